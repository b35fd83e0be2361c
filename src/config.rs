use std::{fs, num::NonZeroU32, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::{
  metrics::FlopFormula,
  perf::CounterLabels,
  run::Launcher,
  stats::{Language, Variant},
};

/// Problem dimensions of the benchmark sweep, roughly a factor 1.6 apart.
pub const INPUT_SIZES: [u32; 10] = [100, 160, 250, 400, 630, 1000, 1600, 2500, 4000, 6300];

/// Problem dimensions of the correctness check.
pub const TEST_INPUT_SIZES: [u32; 4] = [1, 10, 100, 200];

pub const DEFAULT_IMPLEMENTATIONS: [&str; 6] = [
  "v0_baseline",
  "v1_linear_reading",
  "v2_instr_level_parallelism",
  "v3_simd",
  "v4_register_reuse",
  "v5_more_register_reuse",
];

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// One entry of the catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Implementation {
  pub name: String,
  /// Overrides the sweep's repetition count for this implementation.
  pub iterations: Option<NonZeroU32>,
}

/// The ordered list of implementations. Loaded once at startup and never
/// modified; its order is the execution and report order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Catalog {
  implementations: Vec<Implementation>,
}

impl Default for Catalog {
  fn default() -> Self {
    Self {
      implementations: DEFAULT_IMPLEMENTATIONS
        .iter()
        .map(|name| Implementation {
          name: name.to_string(),
          iterations: None,
        })
        .collect(),
    }
  }
}

impl Catalog {
  /// Reads a catalog file: one implementation per line, optionally followed
  /// by its repetition count. Blank lines and `#` comments are skipped.
  pub fn load(path: &Path) -> Result<Self> {
    let text = fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;

    Self::parse(&text).with_context(|| format!("parse {path:?}"))
  }

  pub fn parse(text: &str) -> Result<Self> {
    let mut implementations = Vec::new();

    for (index, line) in text.lines().enumerate() {
      let line = line.split('#').next().unwrap_or_default().trim();
      if line.is_empty() {
        continue;
      }

      let mut words = line.split_whitespace();
      let name = words.next().unwrap_or_default().to_string();
      let iterations = words
        .next()
        .map(str::parse::<NonZeroU32>)
        .transpose()
        .with_context(|| format!("line {}: invalid repetition count", index + 1))?;

      if let Some(extra) = words.next() {
        anyhow::bail!("line {}: unexpected {extra:?}", index + 1);
      }

      implementations.push(Implementation { name, iterations });
    }

    if implementations.is_empty() {
      anyhow::bail!("no implementations listed");
    }

    Ok(Self { implementations })
  }

  pub fn implementations(&self) -> &[Implementation] {
    &self.implementations
  }

  /// Implementations whose name starts with any of `prefixes`, in catalog
  /// order. No prefixes select everything.
  pub fn select<'a>(&'a self, prefixes: &'a [String]) -> impl Iterator<Item = &'a Implementation> + 'a {
    self
      .implementations
      .iter()
      .filter(move |imp| prefixes.is_empty() || prefixes.iter().any(|prefix| imp.name.starts_with(prefix)))
  }
}

/// Selects a slice of [`INPUT_SIZES`], or a single explicit size.
pub fn input_sizes(begin: usize, end: Option<usize>, single: Option<u32>) -> Result<Vec<u32>> {
  if let Some(size) = single {
    if size == 0 {
      anyhow::bail!("input size must be positive");
    }
    return Ok(vec![size]);
  }

  let end = end.unwrap_or(INPUT_SIZES.len());
  if begin >= end || end > INPUT_SIZES.len() {
    anyhow::bail!(
      "input size range {begin}..{end} is empty or outside 0..{}",
      INPUT_SIZES.len()
    );
  }

  Ok(INPUT_SIZES[begin..end].to_vec())
}

/// Where result rows go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sink {
  Stdout,
  /// One CSV file per (language, implementation) under this directory.
  Csv(PathBuf),
}

/// What each invocation of a measured binary does.
#[derive(Clone, Debug)]
pub enum Mode {
  /// `<binary> benchmark <n> <iterations> [max seconds]`.
  Benchmark {
    labels: CounterLabels,
    flops: Option<FlopFormula>,
    max_seconds: Option<f64>,
    sink: Sink,
  },
  /// `<binary> test <n> <iterations>`.
  Test { verbose: bool },
}

/// Everything a sweep needs. Built once and only read afterwards.
#[derive(Clone, Debug)]
pub struct SweepConfig {
  pub build_dir: PathBuf,
  pub catalog: Catalog,
  pub prefixes: Vec<String>,
  pub languages: Vec<Language>,
  pub input_sizes: Vec<u32>,
  pub iterations: NonZeroU32,
  pub threads: Option<u32>,
  pub launcher: Launcher,
  pub mode: Mode,
}

impl SweepConfig {
  /// Selected variants in execution order: languages outermost, then catalog
  /// order, each with its repetition count. Catalog repetition counts only
  /// apply to benchmarks; `test` always uses the sweep's count.
  pub fn variants(&self) -> Vec<(Variant, NonZeroU32)> {
    let catalog_iterations = matches!(self.mode, Mode::Benchmark { .. });

    self
      .languages
      .iter()
      .flat_map(move |&language| {
        self.catalog.select(&self.prefixes).map(move |imp| {
          let iterations = imp.iterations.filter(|_| catalog_iterations).unwrap_or(self.iterations);

          (Variant::new(imp.name.clone(), language), iterations)
        })
      })
      .collect()
  }
}

/// Languages left after the `--no-cpp` and `--no-rust` exclusions.
pub fn languages(no_cpp: bool, no_rust: bool) -> Result<Vec<Language>> {
  let languages: Vec<_> = Language::ALL
    .into_iter()
    .filter(|language| match language {
      Language::Cpp => !no_cpp,
      Language::Rust => !no_rust,
    })
    .collect();

  if languages.is_empty() {
    anyhow::bail!("every language is excluded");
  }

  Ok(languages)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_catalog_keeps_order() {
    let names: Vec<_> = Catalog::default()
      .implementations()
      .iter()
      .map(|imp| imp.name.clone())
      .collect();

    assert_eq!(names, DEFAULT_IMPLEMENTATIONS);
  }

  #[test]
  fn parses_catalog_with_repetitions() {
    let catalog = Catalog::parse("v0_baseline\n\n# slow ones\nv1_linear_reading 3\nv3_simd   # comment\n").unwrap();

    assert_eq!(
      catalog.implementations(),
      [
        Implementation {
          name: "v0_baseline".into(),
          iterations: None,
        },
        Implementation {
          name: "v1_linear_reading".into(),
          iterations: NonZeroU32::new(3),
        },
        Implementation {
          name: "v3_simd".into(),
          iterations: None,
        },
      ]
    );
  }

  #[test]
  fn rejects_bad_catalogs() {
    assert!(Catalog::parse("").is_err());
    assert!(Catalog::parse("v0_baseline zero").is_err());
    assert!(Catalog::parse("v0_baseline 0").is_err());
    assert!(Catalog::parse("v0_baseline 1 2").is_err());
  }

  #[test]
  fn prefix_selection() {
    let catalog = Catalog::default();

    let all: Vec<_> = catalog.select(&[]).collect();
    assert_eq!(all.len(), DEFAULT_IMPLEMENTATIONS.len());

    let prefixes = vec!["v0".to_string(), "v3".to_string()];
    let names: Vec<_> = catalog.select(&prefixes).map(|imp| imp.name.as_str()).collect();
    assert_eq!(names, ["v0_baseline", "v3_simd"]);

    let none = vec!["v9".to_string()];
    assert_eq!(catalog.select(&none).count(), 0);
  }

  #[test]
  fn input_size_slices() {
    assert_eq!(input_sizes(0, None, None).unwrap(), INPUT_SIZES);
    assert_eq!(input_sizes(2, Some(4), None).unwrap(), [250, 400]);
    assert_eq!(input_sizes(5, Some(7), Some(3000)).unwrap(), [3000]);
    assert!(input_sizes(4, Some(4), None).is_err());
    assert!(input_sizes(0, Some(11), None).is_err());
    assert!(input_sizes(0, None, Some(0)).is_err());
  }

  #[test]
  fn language_exclusion() {
    assert_eq!(languages(false, false).unwrap(), [Language::Cpp, Language::Rust]);
    assert_eq!(languages(true, false).unwrap(), [Language::Rust]);
    assert_eq!(languages(false, true).unwrap(), [Language::Cpp]);

    let err = languages(true, true).unwrap_err();
    assert_eq!(err.to_string(), "every language is excluded");
  }

  fn sweep(mode: Mode) -> SweepConfig {
    SweepConfig {
      build_dir: PathBuf::from("build/bin"),
      catalog: Catalog::parse("v0_baseline 3\nv1_linear_reading\n").unwrap(),
      prefixes: Vec::new(),
      languages: vec![Language::Cpp, Language::Rust],
      input_sizes: vec![100],
      iterations: NonZeroU32::new(10).unwrap(),
      threads: None,
      launcher: Launcher {
        cpu_list: None,
        counter_tool: None,
        timeout: DEFAULT_TIMEOUT,
      },
      mode,
    }
  }

  #[test]
  fn catalog_repetitions_apply_to_benchmarks_only() {
    let counts = |config: SweepConfig| -> Vec<(String, u32)> {
      config
        .variants()
        .into_iter()
        .map(|(variant, iterations)| (variant.to_string(), iterations.get()))
        .collect()
    };

    let benchmark = sweep(Mode::Benchmark {
      labels: CounterLabels::default(),
      flops: None,
      max_seconds: None,
      sink: Sink::Stdout,
    });
    assert_eq!(
      counts(benchmark),
      [
        ("cpp v0_baseline".to_string(), 3),
        ("cpp v1_linear_reading".to_string(), 10),
        ("rust v0_baseline".to_string(), 3),
        ("rust v1_linear_reading".to_string(), 10),
      ]
    );

    let test = sweep(Mode::Test { verbose: false });
    assert!(counts(test).iter().all(|(_, iterations)| *iterations == 10));
  }
}
