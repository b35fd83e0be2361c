mod bench;
mod config;
mod error;
mod ext;
mod format;
mod metrics;
mod perf;
mod run;
mod stats;

use std::{num::NonZeroU32, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use self::{
  bench::Bench,
  config::{Catalog, Mode, Sink, SweepConfig, TEST_INPUT_SIZES},
  metrics::FlopFormula,
  perf::CounterLabels,
  run::{Launcher, PERF_STAT},
};

#[derive(Parser)]
struct Args {
  /// Log every command line, and echo binary output in `test`.
  #[arg(short, long, global = true)]
  verbose: bool,
  #[command(subcommand)]
  command: Command,
}

/// Options shared by both subcommands.
#[derive(clap::Args, Debug)]
struct Selection {
  /// Only run implementations whose name starts with one of these prefixes.
  #[arg(short, long = "implementation")]
  implementations: Vec<String>,
  /// Skip the C++ builds.
  #[arg(long)]
  no_cpp: bool,
  /// Skip the Rust builds.
  #[arg(long)]
  no_rust: bool,
  /// Value of every thread-count variable passed to the binaries.
  #[arg(short, long)]
  threads: Option<u32>,
  /// Pin the binaries to these CPUs, in `taskset -c` syntax.
  #[arg(long)]
  cpu_list: Option<String>,
  /// Seconds after which a binary is killed.
  #[arg(long, default_value_t = config::DEFAULT_TIMEOUT.as_secs())]
  timeout: u64,
  /// File listing the implementations, one per line with an optional
  /// repetition count.
  #[arg(long)]
  catalog: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ReportKind {
  Stdout,
  Csv,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Measure every selected variant over the input sizes.
  Bench {
    /// Directory with the built `<implementation>_<language>` binaries.
    build_dir: PathBuf,
    /// First index into the input size catalog.
    #[arg(long, default_value_t = 0)]
    begin: usize,
    /// One past the last index into the input size catalog.
    #[arg(long)]
    end: Option<usize>,
    /// Run only this input size instead of the catalog.
    #[arg(short = 'n', long)]
    input_size: Option<u32>,
    /// Repetitions of each input size.
    #[arg(long, default_value = "1")]
    iterations: NonZeroU32,
    #[arg(long, value_enum, default_value_t = ReportKind::Stdout)]
    report: ReportKind,
    /// Directory for CSV reports, one subdirectory per language.
    #[arg(long, default_value = "reports")]
    report_dir: PathBuf,
    /// Time the binaries without `perf stat`.
    #[arg(long)]
    no_perf: bool,
    /// Passed to the binaries to stop repeating after this many seconds.
    #[arg(long)]
    max_seconds: Option<f64>,
    /// Leave out GFLOP/s.
    #[arg(long)]
    no_flops: bool,
    /// GFLOP/s assumes `coefficient * n^exponent` operations.
    #[arg(long, default_value_t = FlopFormula::default().coefficient)]
    flop_coefficient: f64,
    #[arg(long, default_value_t = FlopFormula::default().exponent)]
    flop_exponent: i32,
    /// Label of the retired instructions counter in `perf` output.
    #[arg(long, default_value = "instructions")]
    instructions_label: String,
    /// Label of the cycles counter in `perf` output.
    #[arg(long, default_value = "cycles")]
    cycles_label: String,
    #[command(flatten)]
    selection: Selection,
  },
  /// Check every selected variant against the reference implementation.
  Test {
    /// Directory with the built `<implementation>_<language>` binaries.
    #[arg(short, long, default_value = "./build/bin")]
    build_dir: PathBuf,
    /// Repetitions of each input size.
    #[arg(long, default_value = "10")]
    iterations: NonZeroU32,
    #[command(flatten)]
    selection: Selection,
  },
}

fn init_tracing(verbose: bool) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

  tracing_subscriber::registry()
    .with(filter)
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .init();
}

/// Builds the sweep configuration, reading the catalog if one is given.
fn sweep_config(command: Command, verbose: bool) -> Result<SweepConfig> {
  let (build_dir, input_sizes, iterations, counter_tool, mode, selection) = match command {
    Command::Bench {
      build_dir,
      begin,
      end,
      input_size,
      iterations,
      report,
      report_dir,
      no_perf,
      max_seconds,
      no_flops,
      flop_coefficient,
      flop_exponent,
      instructions_label,
      cycles_label,
      selection,
    } => {
      let input_sizes = config::input_sizes(begin, end, input_size).context("input sizes")?;
      let counter_tool = (!no_perf).then(|| PERF_STAT.map(String::from).to_vec());
      let mode = Mode::Benchmark {
        labels: CounterLabels {
          instructions: instructions_label,
          cycles: cycles_label,
          ..CounterLabels::default()
        },
        flops: (!no_flops).then_some(FlopFormula {
          coefficient: flop_coefficient,
          exponent: flop_exponent,
        }),
        max_seconds,
        sink: match report {
          ReportKind::Stdout => Sink::Stdout,
          ReportKind::Csv => Sink::Csv(report_dir),
        },
      };

      (build_dir, input_sizes, iterations, counter_tool, mode, selection)
    }
    Command::Test {
      build_dir,
      iterations,
      selection,
    } => (
      build_dir,
      TEST_INPUT_SIZES.to_vec(),
      iterations,
      None,
      Mode::Test { verbose },
      selection,
    ),
  };

  let catalog = match &selection.catalog {
    Some(path) => Catalog::load(path).context("Catalog::load")?,
    None => Catalog::default(),
  };
  debug!("{} implementations in catalog", catalog.implementations().len());

  let languages = config::languages(selection.no_cpp, selection.no_rust)?;

  Ok(SweepConfig {
    build_dir,
    catalog,
    prefixes: selection.implementations,
    languages,
    input_sizes,
    iterations,
    threads: selection.threads,
    launcher: Launcher {
      cpu_list: selection.cpu_list,
      counter_tool,
      timeout: Duration::from_secs(selection.timeout),
    },
    mode,
  })
}

/// Logs the corrective hint of a sweep-fatal error.
fn fatal(err: error::Error) -> anyhow::Error {
  if let Some(hint) = err.hint() {
    error!("{hint}");
  }

  err.into()
}

fn main() -> Result<()> {
  let args = Args::parse();
  init_tracing(args.verbose);

  let config = sweep_config(args.command, args.verbose).context("config")?;
  if !config.build_dir.is_dir() {
    anyhow::bail!("{:?} does not exist", config.build_dir);
  }

  let mut bench = Bench::new(&config).map_err(fatal).context("Bench::new")?;
  let swept = bench.run();

  print!("{}", format::format_summary(&bench.stats).context("format")?);

  swept.map_err(fatal).context("sweep aborted")?;

  Ok(())
}
