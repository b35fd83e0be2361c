//! Parsing of `perf stat --field-separator ,` output, merged with the output
//! of the measured binary.
//!
//! The expected text is
//!
//! ```text
//! benchmarking ./v0_baseline_cpp with input containing 10000 elements
//! 0.0021394
//! 7436512,,cycles,2130000,100.00,3.491,GHz
//! 24105876,,instructions,2130000,100.00,3.24,insn per cycle
//! ```
//!
//! where the first line is the binary's header, the second its elapsed time
//! in seconds and the rest is whatever counters `perf` decided to emit.

use crate::{
  error::{Error, Result},
  stats::RawCounterReport,
};

pub const PERMISSION_PHRASE: &str = "You may not have permission to collect stats";

/// The labels and separator the counter lookup keys on. They depend on the
/// `perf` version, so they are configurable.
#[derive(Clone, Debug)]
pub struct CounterLabels {
  pub instructions: String,
  pub cycles: String,
  pub separator: char,
  pub permission_phrase: String,
}

impl Default for CounterLabels {
  fn default() -> Self {
    Self {
      instructions: "instructions".into(),
      cycles: "cycles".into(),
      separator: ',',
      permission_phrase: PERMISSION_PHRASE.into(),
    }
  }
}

fn malformed(reason: impl Into<String>) -> Error {
  Error::MalformedReport(reason.into())
}

/// Parses the merged output of one `perf stat` run.
///
/// # Errors
///
/// - [`Error::PermissionDenied`] if the output carries the permission failure
///   phrase. Nothing else is looked at in that case.
/// - [`Error::MalformedReport`] if the time line or either counter is missing
///   or not a number.
pub fn parse(text: &str, labels: &CounterLabels) -> Result<RawCounterReport> {
  if text.contains(&labels.permission_phrase) {
    return Err(Error::PermissionDenied);
  }

  let mut lines = text.lines();
  lines.next().ok_or_else(|| malformed("empty output"))?;

  let time_line = lines.next().ok_or_else(|| malformed("missing elapsed time line"))?;
  let seconds = parse_seconds(time_line)?;

  let counter_lines: Vec<&str> = lines.collect();

  Ok(RawCounterReport {
    seconds,
    instructions: counter(&counter_lines, &labels.instructions, labels.separator)?,
    cycles: counter(&counter_lines, &labels.cycles, labels.separator)?,
  })
}

/// Parses the output of a binary run without a counter tool: a header line
/// followed by one elapsed time per repetition. Returns the mean.
///
/// The binary may stop early when given a time limit, so the mean is over the
/// lines actually printed.
pub fn parse_timing(text: &str) -> Result<f64> {
  let times = text
    .lines()
    .skip(1)
    .map_while(|line| line.trim().parse::<f64>().ok())
    .collect::<Vec<_>>();

  if times.is_empty() {
    return Err(malformed("no elapsed times after the header"));
  }

  let mean = times.iter().sum::<f64>() / times.len() as f64;
  if !(mean.is_finite() && mean > 0.0) {
    return Err(malformed(format!("mean elapsed time {mean} is not positive")));
  }

  Ok(mean)
}

fn parse_seconds(line: &str) -> Result<f64> {
  let seconds = line
    .trim()
    .parse::<f64>()
    .map_err(|_| malformed(format!("elapsed time {line:?} is not a number")))?;

  if !(seconds.is_finite() && seconds > 0.0) {
    return Err(malformed(format!("elapsed time {seconds} is not positive")));
  }

  Ok(seconds)
}

/// Value of the first counter line labelled `label`.
fn counter(lines: &[&str], label: &str, separator: char) -> Result<u64> {
  let value = lines
    .iter()
    .find_map(|line| labelled_value(line, label, separator))
    .ok_or_else(|| malformed(format!("no {label:?} counter")))?;

  value
    .parse()
    .map_err(|_| malformed(format!("{label:?} counter {value:?} is not a number")))
}

/// The nearest non-empty field before the last field on `line` labelled
/// `label`. Empty fields in between are unit columns.
fn labelled_value<'a>(line: &'a str, label: &str, separator: char) -> Option<&'a str> {
  let fields: Vec<&str> = line.split(separator).map(str::trim).collect();
  let position = fields.iter().rposition(|field| is_label(field, label))?;

  fields[..position].iter().rev().copied().find(|field| !field.is_empty())
}

/// `instructions` also matches modifier forms such as `instructions:u`, and
/// the PMU-qualified form of hybrid CPUs, `cpu_core/instructions/`.
fn is_label(field: &str, label: &str) -> bool {
  let event = match field.split_once('/') {
    Some((_pmu, rest)) => rest.split('/').next().unwrap_or_default(),
    None => field,
  };

  event
    .strip_prefix(label)
    .is_some_and(|rest| rest.is_empty() || rest.starts_with(':'))
}
