use std::{fmt, path::Path, path::PathBuf};

/// Languages the kernel variants are compiled from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Language {
  Cpp,
  Rust,
}

impl Language {
  pub const ALL: [Language; 2] = [Language::Cpp, Language::Rust];

  pub fn as_str(self) -> &'static str {
    match self {
      Language::Cpp => "cpp",
      Language::Rust => "rust",
    }
  }
}

impl fmt::Display for Language {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One measured implementation, as built for one language.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Variant {
  pub implementation: String,
  pub language: Language,
}

impl Variant {
  pub fn new(implementation: impl Into<String>, language: Language) -> Self {
    Self {
      implementation: implementation.into(),
      language,
    }
  }

  /// Path of the built binary, `<build_dir>/<implementation>_<language>`.
  pub fn binary(&self, build_dir: &Path) -> PathBuf {
    build_dir.join(format!("{}_{}", self.implementation, self.language))
  }
}

impl fmt::Display for Variant {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.language, self.implementation)
  }
}

/// One concrete invocation of a variant.
#[derive(Clone, Debug)]
pub struct RunSpec<'a> {
  pub variant: &'a Variant,
  pub input_size: u32,
  /// Zero-based repetition index.
  pub repetition: u32,
  /// When set, every thread-count environment variable is overridden with it.
  pub threads: Option<u32>,
}

/// Counter tool output for one invocation, parsed but not yet derived.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawCounterReport {
  pub seconds: f64,
  pub instructions: u64,
  pub cycles: u64,
}

/// Hardware counters of a row, absent in timing-only mode.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Counters {
  pub instructions: u64,
  pub cycles: u64,
}

/// A measurement together with its derived metrics. Values are stored
/// unrounded; formatting happens in the reporters.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultRow {
  pub input_size: u32,
  pub seconds: f64,
  pub counters: Option<Counters>,
  pub instructions_per_cycle: Option<f64>,
  pub gflops: Option<f64>,
  pub giga_instructions_per_second: Option<f64>,
}

/// An invocation that failed without stopping the sweep.
#[derive(Clone, Debug)]
pub struct Failure {
  pub variant: Variant,
  pub input_size: u32,
  pub repetition: u32,
  pub reason: String,
}

impl fmt::Display for Failure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} n={} repetition={}: {}",
      self.variant, self.input_size, self.repetition, self.reason
    )
  }
}

/// Outcome of a sweep, accumulated by the orchestrator.
#[derive(Default, Debug)]
pub struct Stats {
  pub invocations: usize,
  pub rows: usize,
  pub failures: Vec<Failure>,
}

impl Stats {
  pub fn failures_for<'a>(&'a self, variant: &'a Variant) -> impl Iterator<Item = &'a Failure> + 'a {
    self.failures.iter().filter(move |failure| &failure.variant == variant)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn binary_path_joins_implementation_and_language() {
    let variant = Variant::new("v3_simd", Language::Rust);

    assert_eq!(variant.binary(Path::new("build/bin")), Path::new("build/bin/v3_simd_rust"));
    assert_eq!(variant.to_string(), "rust v3_simd");
  }

  #[test]
  fn failures_are_grouped_by_variant() {
    let cpp = Variant::new("v0_baseline", Language::Cpp);
    let rust = Variant::new("v0_baseline", Language::Rust);
    let stats = Stats {
      invocations: 1,
      rows: 0,
      failures: vec![Failure {
        variant: cpp.clone(),
        input_size: 100,
        repetition: 0,
        reason: "timeout".into(),
      }],
    };

    assert_eq!(stats.failures_for(&cpp).count(), 1);
    assert_eq!(stats.failures_for(&rust).count(), 0);
  }
}
