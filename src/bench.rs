use std::{
  fs,
  num::NonZeroU32,
  path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{
  config::{Mode, Sink, SweepConfig},
  error::{Error, Result},
  format::{ConsoleReporter, CsvReporter, Reporter, Schema},
  metrics::{self, FlopFormula},
  perf::{self, CounterLabels},
  run::{self, CapturedOutput},
  stats::{Failure, ResultRow, RunSpec, Stats, Variant},
};

/// Substring the measured binaries print when `test` finds a wrong result.
const TEST_FAILURE_MARKER: &str = "ERROR";

/// Runs one sweep: every selected variant over every input size, one
/// subprocess at a time.
pub struct Bench<'a> {
  config: &'a SweepConfig,
  /// Failures recorded so far and rows written.
  pub stats: Stats,
}

/// `<dir>/<language>/<implementation>.csv`
pub fn csv_path(dir: &Path, variant: &Variant) -> PathBuf {
  dir
    .join(variant.language.as_str())
    .join(format!("{}.csv", variant.implementation))
}

impl<'a> Bench<'a> {
  /// Checks the report directory and creates its per-language
  /// subdirectories, before anything is run.
  ///
  /// # Errors
  ///
  /// [`Error::SinkUnavailable`] if the CSV report directory does not exist.
  pub fn new(config: &'a SweepConfig) -> Result<Self> {
    if let Mode::Benchmark { sink: Sink::Csv(dir), .. } = &config.mode {
      if !dir.is_dir() {
        return Err(Error::SinkUnavailable(dir.clone()));
      }

      for language in &config.languages {
        fs::create_dir_all(dir.join(language.as_str()))?;
      }
    }

    Ok(Self {
      config,
      stats: Stats::default(),
    })
  }

  /// Runs the sweep. Per-invocation failures are recorded in
  /// [`Bench::stats`]; the first sweep-fatal error is returned.
  pub fn run(&mut self) -> Result<()> {
    let config = self.config;

    for (variant, iterations) in config.variants() {
      println!("{variant}");

      let passed = match &config.mode {
        Mode::Benchmark {
          labels,
          flops,
          max_seconds,
          sink,
        } => {
          info!("benchmarking {variant}");
          let measurement = Measurement {
            labels,
            flops: flops.as_ref(),
            max_seconds: *max_seconds,
          };
          self.bench_variant(&variant, iterations, &measurement, sink)?
        }
        Mode::Test { verbose } => {
          info!("testing {variant}");
          self.test_variant(&variant, iterations, *verbose)?
        }
      };

      println!("{}", if passed { "ok" } else { "! fail" });
      println!();
    }

    Ok(())
  }

  fn launch(&mut self, spec: &RunSpec, args: &[String]) -> Result<CapturedOutput> {
    self.stats.invocations += 1;

    let binary = spec.variant.binary(&self.config.build_dir);
    let env = spec.threads.map(run::thread_env);
    let output = self.config.launcher.launch(&binary, args, env.as_ref())?;
    if !output.status.success() {
      debug!("{binary:?} exited with {}", output.status);
    }

    Ok(output)
  }

  /// Records `err` against `spec` if it is recoverable, otherwise returns it.
  fn record_failure(&mut self, spec: &RunSpec, err: Error) -> Result<()> {
    if !err.is_recoverable() {
      return Err(err);
    }

    warn!(
      "{} n={} repetition={}: {err}",
      spec.variant, spec.input_size, spec.repetition
    );
    self.stats.failures.push(Failure {
      variant: spec.variant.clone(),
      input_size: spec.input_size,
      repetition: spec.repetition,
      reason: err.to_string(),
    });

    Ok(())
  }

  /// Measures every input size of `variant` and reports the rows. Returns
  /// whether all invocations succeeded.
  fn bench_variant(
    &mut self,
    variant: &Variant,
    iterations: NonZeroU32,
    measurement: &Measurement,
    sink: &Sink,
  ) -> Result<bool> {
    let config = self.config;
    let counters = config.launcher.counter_tool.is_some();
    let gflops = measurement.flops.is_some();

    let (mut reporter, schema): (Box<dyn Reporter>, _) = match sink {
      Sink::Stdout => (Box::new(ConsoleReporter::stdout()), Schema::console(counters, gflops)),
      Sink::Csv(dir) => (
        Box::new(CsvReporter::new(csv_path(dir, variant))),
        Schema::csv(counters, gflops),
      ),
    };
    reporter.write_header(&schema, true)?;

    for &input_size in &config.input_sizes {
      // With counters every repetition is its own process, so that each one
      // gets its own counter report. Without, the binary repeats internally.
      let repetitions = if counters { iterations.get() } else { 1 };

      for repetition in 0..repetitions {
        let spec = RunSpec {
          variant,
          input_size,
          repetition,
          threads: config.threads,
        };

        let measured = if counters {
          self.measure_counters(&spec, measurement)
        } else {
          self.measure_timing(&spec, iterations, measurement)
        };

        match measured {
          Ok(row) => {
            reporter.write_row(&row)?;
            self.stats.rows += 1;
          }
          Err(err) => self.record_failure(&spec, err)?,
        }
      }
    }

    if let Sink::Csv(dir) = sink {
      println!("wrote {}", csv_path(dir, variant).display());
    }

    Ok(self.stats.failures_for(variant).next().is_none())
  }

  fn benchmark_args(input_size: u32, iterations: u32, max_seconds: Option<f64>) -> Vec<String> {
    let mut args = vec!["benchmark".to_string(), input_size.to_string(), iterations.to_string()];
    if let Some(max_seconds) = max_seconds {
      args.push(max_seconds.to_string());
    }

    args
  }

  fn measure_counters(&mut self, spec: &RunSpec, measurement: &Measurement) -> Result<ResultRow> {
    let args = Self::benchmark_args(spec.input_size, 1, measurement.max_seconds);
    let output = self.launch(spec, &args)?;

    let report = perf::parse(&output.text, measurement.labels)?;

    metrics::derive(&report, spec.input_size, measurement.flops)
  }

  fn measure_timing(&mut self, spec: &RunSpec, iterations: NonZeroU32, measurement: &Measurement) -> Result<ResultRow> {
    let args = Self::benchmark_args(spec.input_size, iterations.get(), measurement.max_seconds);
    let output = self.launch(spec, &args)?;

    let seconds = perf::parse_timing(&output.text)?;

    Ok(metrics::derive_timing(seconds, spec.input_size, measurement.flops))
  }

  /// Runs the correctness check of `variant` for every input size. Returns
  /// whether none of them reported a wrong result or failed to run.
  fn test_variant(&mut self, variant: &Variant, iterations: NonZeroU32, verbose: bool) -> Result<bool> {
    let config = self.config;

    for &input_size in &config.input_sizes {
      let spec = RunSpec {
        variant,
        input_size,
        repetition: 0,
        threads: config.threads,
      };
      let args = vec!["test".to_string(), input_size.to_string(), iterations.to_string()];

      match self.launch(&spec, &args) {
        Ok(output) => {
          if verbose {
            println!("{}", output.text);
          }
          if output.text.contains(TEST_FAILURE_MARKER) {
            self.stats.failures.push(Failure {
              variant: variant.clone(),
              input_size,
              repetition: 0,
              reason: "result differs from the reference".into(),
            });
          }
        }
        Err(err) => self.record_failure(&spec, err)?,
      }
    }

    Ok(self.stats.failures_for(variant).next().is_none())
  }
}

/// Per-sweep settings of a counter or timing measurement.
struct Measurement<'a> {
  labels: &'a CounterLabels,
  flops: Option<&'a FlopFormula>,
  max_seconds: Option<f64>,
}

#[cfg(test)]
mod tests {
  use std::{os::unix::fs::PermissionsExt, time::Duration};

  use serial_test::serial;
  use tempfile::TempDir;

  use super::*;
  use crate::{
    config::{Catalog, INPUT_SIZES},
    run::Launcher,
    stats::Language,
  };

  fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

    path
  }

  const BENCHMARK: &str = r#"echo "benchmarking $0 with input containing $(($2 * $2)) elements"
i=0
while [ $i -lt $3 ]; do
  echo 0.002000
  i=$((i + 1))
done"#;

  const PERF: &str = r#""$@"
echo "0,,context-switches,1000,100.00,0.000,/sec"
echo "1000000,,instructions,1000,100.00,0.50,insn per cycle"
echo "2000000,,cycles,1000,100.00,1.000,GHz""#;

  struct Fixture {
    _dir: TempDir,
    build_dir: PathBuf,
    report_dir: PathBuf,
    perf: PathBuf,
  }

  impl Fixture {
    fn new() -> Self {
      let dir = TempDir::new().unwrap();
      let build_dir = dir.path().join("bin");
      let report_dir = dir.path().join("reports");
      fs::create_dir(&build_dir).unwrap();
      fs::create_dir(&report_dir).unwrap();
      let perf = script(dir.path(), "perf", PERF);

      Self {
        _dir: dir,
        build_dir,
        report_dir,
        perf,
      }
    }

    fn binary(&self, name: &str, body: &str) {
      script(&self.build_dir, name, body);
    }

    fn config(&self, catalog: &str, input_sizes: Vec<u32>, iterations: u32, mode: Mode) -> SweepConfig {
      let counter_tool = match &mode {
        Mode::Benchmark { .. } => Some(vec![self.perf.to_string_lossy().into_owned()]),
        Mode::Test { .. } => None,
      };

      SweepConfig {
        build_dir: self.build_dir.clone(),
        catalog: Catalog::parse(catalog).unwrap(),
        prefixes: Vec::new(),
        languages: vec![Language::Cpp],
        input_sizes,
        iterations: NonZeroU32::new(iterations).unwrap(),
        threads: Some(2),
        launcher: Launcher {
          cpu_list: None,
          counter_tool,
          timeout: Duration::from_secs(10),
        },
        mode,
      }
    }

    fn csv_mode(&self) -> Mode {
      Mode::Benchmark {
        labels: CounterLabels::default(),
        flops: Some(FlopFormula::default()),
        max_seconds: None,
        sink: Sink::Csv(self.report_dir.clone()),
      }
    }

    fn read_csv(&self, variant: &Variant) -> Vec<Vec<String>> {
      let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(csv_path(&self.report_dir, variant))
        .unwrap();

      reader
        .records()
        .map(|record| record.unwrap().iter().map(String::from).collect())
        .collect()
    }
  }

  #[test]
  #[serial]
  fn repetitions_write_one_row_each_under_one_header() {
    let fixture = Fixture::new();
    fixture.binary("v0_baseline_cpp", BENCHMARK);
    let config = fixture.config("v0_baseline", vec![100], 3, fixture.csv_mode());

    let mut bench = Bench::new(&config).unwrap();
    bench.run().unwrap();

    let records = fixture.read_csv(&Variant::new("v0_baseline", Language::Cpp));
    assert_eq!(records.len(), 4);
    assert_eq!(records[0], ["N (rows)", "time (us)", "instructions", "cycles", "GFLOP/s"]);
    for record in &records[1..] {
      assert_eq!(record, &["100", "2000.000", "1000000", "2000000", "1.000"]);
    }
    assert_eq!(bench.stats.rows, 3);
    assert!(bench.stats.failures.is_empty());
  }

  #[test]
  #[serial]
  fn rows_follow_size_then_repetition_order() {
    let fixture = Fixture::new();
    fixture.binary("v0_baseline_cpp", BENCHMARK);
    let config = fixture.config("v0_baseline", vec![100, 160, 250], 2, fixture.csv_mode());

    Bench::new(&config).unwrap().run().unwrap();

    let sizes: Vec<_> = fixture.read_csv(&Variant::new("v0_baseline", Language::Cpp))[1..]
      .iter()
      .map(|record| record[0].clone())
      .collect();
    assert_eq!(sizes, ["100", "100", "160", "160", "250", "250"]);
  }

  #[test]
  #[serial]
  fn permission_failure_aborts_the_sweep() {
    let fixture = Fixture::new();
    fixture.binary(
      "v0_baseline_cpp",
      "echo 'Error:'; echo 'You may not have permission to collect stats.'; exit 1",
    );
    fixture.binary("v1_linear_reading_cpp", BENCHMARK);
    let config = fixture.config("v0_baseline\nv1_linear_reading", vec![100, 160], 1, fixture.csv_mode());

    let mut bench = Bench::new(&config).unwrap();
    let err = bench.run().unwrap_err();

    assert!(matches!(err, Error::PermissionDenied), "{err}");
    assert_eq!(bench.stats.rows, 0);
    assert_eq!(bench.stats.invocations, 1);
    assert_eq!(fixture.read_csv(&Variant::new("v0_baseline", Language::Cpp)).len(), 1);
    assert!(!csv_path(&fixture.report_dir, &Variant::new("v1_linear_reading", Language::Cpp)).exists());
  }

  #[test]
  #[serial]
  fn broken_variants_are_recorded_and_skipped() {
    let fixture = Fixture::new();
    // v0 is never built, v1 hangs, v2 prints garbage
    fixture.binary("v1_linear_reading_cpp", "sleep 5");
    fixture.binary("v2_instr_level_parallelism_cpp", "echo benchmarking; echo not-a-time");
    fixture.binary("v3_simd_cpp", BENCHMARK);
    let mut config = fixture.config(
      "v0_baseline\nv1_linear_reading\nv2_instr_level_parallelism\nv3_simd",
      vec![100],
      1,
      fixture.csv_mode(),
    );
    config.launcher.timeout = Duration::from_millis(200);

    let mut bench = Bench::new(&config).unwrap();
    bench.run().unwrap();

    let implementations: Vec<_> = bench
      .stats
      .failures
      .iter()
      .map(|failure| failure.variant.implementation.as_str())
      .collect();
    assert_eq!(implementations, ["v0_baseline", "v1_linear_reading", "v2_instr_level_parallelism"]);
    assert!(bench.stats.failures[0].reason.starts_with("failed to launch"));
    assert!(bench.stats.failures[1].reason.contains("did not finish"));
    assert!(bench.stats.failures[2].reason.starts_with("malformed counter report"));
    assert_eq!(bench.stats.rows, 1);
    assert_eq!(fixture.read_csv(&Variant::new("v3_simd", Language::Cpp)).len(), 2);
  }

  #[test]
  #[serial]
  fn prefix_filter_runs_only_matching_variant() {
    let fixture = Fixture::new();
    for language in Language::ALL {
      for implementation in ["v0_baseline", "v1_linear_reading"] {
        fixture.binary(&format!("{implementation}_{language}"), BENCHMARK);
      }
    }
    let mut config = fixture.config("v0_baseline\nv1_linear_reading", INPUT_SIZES[..2].to_vec(), 1, fixture.csv_mode());
    config.prefixes = vec!["v1".into()];
    config.languages = Language::ALL.to_vec();

    let mut bench = Bench::new(&config).unwrap();
    bench.run().unwrap();

    assert_eq!(bench.stats.invocations, 4);
    for language in Language::ALL {
      assert!(!csv_path(&fixture.report_dir, &Variant::new("v0_baseline", language)).exists());
      let records = fixture.read_csv(&Variant::new("v1_linear_reading", language));
      assert_eq!(records.len(), 3);
    }
  }

  #[test]
  #[serial]
  fn timing_mode_averages_repetitions_in_one_process() {
    let fixture = Fixture::new();
    fixture.binary(
      "v0_baseline_cpp",
      r#"echo "benchmarking $0"; echo 0.001; echo 0.003; echo 0.002"#,
    );
    let mut config = fixture.config("v0_baseline", vec![100], 3, fixture.csv_mode());
    config.launcher.counter_tool = None;

    let mut bench = Bench::new(&config).unwrap();
    bench.run().unwrap();

    let records = fixture.read_csv(&Variant::new("v0_baseline", Language::Cpp));
    assert_eq!(bench.stats.invocations, 1);
    assert_eq!(records[0], ["N (rows)", "time (us)", "GFLOP/s"]);
    assert_eq!(records[1], ["100", "2000.000", "1.000"]);
  }

  #[test]
  #[serial]
  fn thread_count_reaches_the_binary() {
    let fixture = Fixture::new();
    fixture.binary(
      "v0_baseline_cpp",
      r#"echo "benchmarking"; echo 0.002; [ "$OMP_NUM_THREADS" = 2 ] && [ "$RAYON_NUM_THREADS" = 2 ] || echo ERROR"#,
    );
    let config = fixture.config("v0_baseline", vec![10], 1, Mode::Test { verbose: false });

    let mut bench = Bench::new(&config).unwrap();
    bench.run().unwrap();

    assert!(bench.stats.failures.is_empty());
  }

  #[test]
  #[serial]
  fn test_mode_flags_error_output() {
    let fixture = Fixture::new();
    fixture.binary(
      "v0_baseline_cpp",
      r#"echo "testing $0"; [ "$2" = 100 ] && echo "ERROR: step function produced unexpected value"; true"#,
    );
    fixture.binary("v1_linear_reading_cpp", r#"echo "testing $0"; echo ..."#);
    let config = fixture.config(
      "v0_baseline\nv1_linear_reading",
      vec![1, 10, 100, 200],
      10,
      Mode::Test { verbose: false },
    );

    let mut bench = Bench::new(&config).unwrap();
    bench.run().unwrap();

    assert_eq!(bench.stats.invocations, 8);
    assert_eq!(bench.stats.failures.len(), 1);
    assert_eq!(bench.stats.failures[0].variant.implementation, "v0_baseline");
    assert_eq!(bench.stats.failures[0].input_size, 100);
  }

  #[test]
  #[serial]
  fn missing_report_directory_fails_before_running() {
    let fixture = Fixture::new();
    let mut config = fixture.config("v0_baseline", vec![100], 1, fixture.csv_mode());
    config.mode = Mode::Benchmark {
      labels: CounterLabels::default(),
      flops: None,
      max_seconds: None,
      sink: Sink::Csv(fixture.report_dir.join("missing")),
    };

    assert!(matches!(Bench::new(&config), Err(Error::SinkUnavailable(_))));
  }

  #[test]
  fn benchmark_args_forward_time_limit() {
    assert_eq!(Bench::benchmark_args(100, 1, None), ["benchmark", "100", "1"]);
    assert_eq!(Bench::benchmark_args(630, 5, Some(2.5)), ["benchmark", "630", "5", "2.5"]);
  }
}
