use std::{
  fmt::Write as _,
  fs::{File, OpenOptions},
  io::{self, Write},
  path::{Path, PathBuf},
};

use crate::{
  error::{Error, Result},
  stats::{ResultRow, Stats},
};

const COLUMN_WIDTH: usize = 14;
const COLUMN_PADDING: &str = "  ";

/// A column of a report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
  InputSize,
  TimeMicros,
  Instructions,
  Cycles,
  InstructionsPerCycle,
  Gflops,
  GigaInstructionsPerSecond,
}

impl Field {
  pub fn label(self) -> &'static str {
    match self {
      Field::InputSize => "N (rows)",
      Field::TimeMicros => "time (us)",
      Field::Instructions => "instructions",
      Field::Cycles => "cycles",
      Field::InstructionsPerCycle => "insn/cycle",
      Field::Gflops => "GFLOP/s",
      Field::GigaInstructionsPerSecond => "Ginsn/s",
    }
  }

  /// The value of this column in `row`, rounded for presentation, or `None`
  /// if the row was measured without it.
  pub fn format(self, row: &ResultRow) -> Option<String> {
    match self {
      Field::InputSize => Some(row.input_size.to_string()),
      Field::TimeMicros => Some(format!("{:.3}", row.seconds * 1e6)),
      Field::Instructions => row.counters.map(|counters| counters.instructions.to_string()),
      Field::Cycles => row.counters.map(|counters| counters.cycles.to_string()),
      Field::InstructionsPerCycle => row.instructions_per_cycle.map(|ipc| format!("{ipc:.3}")),
      Field::Gflops => row.gflops.map(|gflops| format!("{gflops:.3}")),
      Field::GigaInstructionsPerSecond => row.giga_instructions_per_second.map(|gips| format!("{gips:.3}")),
    }
  }
}

/// Ordered columns of a report.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Schema(Vec<Field>);

impl Schema {
  /// `N (rows), time (us), instructions, cycles[, GFLOP/s]`, the columns the
  /// plotting scripts read. Counter columns are left out in timing-only mode.
  pub fn csv(counters: bool, gflops: bool) -> Self {
    let mut fields = vec![Field::InputSize, Field::TimeMicros];
    if counters {
      fields.extend([Field::Instructions, Field::Cycles]);
    }
    if gflops {
      fields.push(Field::Gflops);
    }

    Self(fields)
  }

  /// The CSV columns plus the derived rates worth reading in a terminal.
  pub fn console(counters: bool, gflops: bool) -> Self {
    let mut fields = vec![Field::InputSize, Field::TimeMicros];
    if counters {
      fields.extend([
        Field::Instructions,
        Field::Cycles,
        Field::InstructionsPerCycle,
        Field::GigaInstructionsPerSecond,
      ]);
    }
    if gflops {
      fields.push(Field::Gflops);
    }

    Self(fields)
  }

  pub fn fields(&self) -> &[Field] {
    &self.0
  }

  pub fn labels(&self) -> impl Iterator<Item = &'static str> + '_ {
    self.0.iter().map(|field| field.label())
  }
}

/// A destination for result rows.
pub trait Reporter {
  /// Starts a report with `schema`. With `truncate`, previous content of the
  /// sink is discarded first.
  fn write_header(&mut self, schema: &Schema, truncate: bool) -> Result<()>;

  /// Writes one row in the order of the last written header.
  fn write_row(&mut self, row: &ResultRow) -> Result<()>;
}

/// Fixed-width table for a terminal.
pub struct ConsoleReporter<W> {
  out: W,
  schema: Schema,
}

impl ConsoleReporter<io::Stdout> {
  pub fn stdout() -> Self {
    Self::new(io::stdout())
  }
}

impl<W: Write> ConsoleReporter<W> {
  pub fn new(out: W) -> Self {
    Self {
      out,
      schema: Schema::default(),
    }
  }

  pub fn into_inner(self) -> W {
    self.out
  }
}

fn join_columns<I: IntoIterator<Item = String>>(columns: I) -> String {
  columns.into_iter().collect::<Vec<_>>().join(COLUMN_PADDING)
}

impl<W: Write> Reporter for ConsoleReporter<W> {
  fn write_header(&mut self, schema: &Schema, _truncate: bool) -> Result<()> {
    self.schema = schema.clone();

    let header = join_columns(schema.labels().map(|label| format!("{label:>COLUMN_WIDTH$}")));
    writeln!(self.out, "{header}")?;
    writeln!(self.out, "{}", "=".repeat(header.len()))?;

    Ok(())
  }

  fn write_row(&mut self, row: &ResultRow) -> Result<()> {
    let line = join_columns(self.schema.fields().iter().map(|field| {
      let value = field.format(row).unwrap_or_else(|| "-".to_string());
      format!("{value:>COLUMN_WIDTH$}")
    }));
    writeln!(self.out, "{line}")?;

    Ok(())
  }
}

/// Append-only CSV file. Every call opens the file, writes, flushes and
/// closes it again, so each row is on disk once the call returns.
pub struct CsvReporter {
  path: PathBuf,
  schema: Schema,
}

impl CsvReporter {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      schema: Schema::default(),
    }
  }

  fn open(&self, truncate: bool) -> Result<csv::Writer<File>> {
    let dir = match self.path.parent() {
      Some(dir) if !dir.as_os_str().is_empty() => dir,
      _ => Path::new("."),
    };
    if !dir.is_dir() {
      return Err(Error::SinkUnavailable(dir.to_path_buf()));
    }

    let mut options = OpenOptions::new();
    options.create(true);
    if truncate {
      options.write(true).truncate(true);
    } else {
      options.append(true);
    }

    Ok(csv::Writer::from_writer(options.open(&self.path)?))
  }
}

impl Reporter for CsvReporter {
  fn write_header(&mut self, schema: &Schema, truncate: bool) -> Result<()> {
    let mut writer = self.open(truncate)?;
    writer.write_record(schema.labels())?;
    writer.flush()?;

    self.schema = schema.clone();

    Ok(())
  }

  fn write_row(&mut self, row: &ResultRow) -> Result<()> {
    let mut writer = self.open(false)?;
    writer.write_record(
      self
        .schema
        .fields()
        .iter()
        .map(|field| field.format(row).unwrap_or_default()),
    )?;
    writer.flush()?;

    Ok(())
  }
}

/// Summary printed after a sweep.
pub fn format_summary(stats: &Stats) -> anyhow::Result<String> {
  let mut summary = String::new();

  writeln!(
    summary,
    "{} invocations, {} failed",
    stats.invocations,
    stats.failures.len()
  )?;
  if stats.rows > 0 {
    writeln!(summary, "{} rows written", stats.rows)?;
  }
  if stats.failures.is_empty() {
    return Ok(summary);
  }

  writeln!(summary, "{}", "-".repeat(COLUMN_WIDTH * 2))?;
  for failure in &stats.failures {
    writeln!(summary, "{failure}")?;
  }

  Ok(summary)
}
