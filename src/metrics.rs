use crate::{
  error::{Error, Result},
  stats::{Counters, RawCounterReport, ResultRow},
};

/// Floating point operations performed by the kernel for input size `n`,
/// modelled as `coefficient * n^exponent`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlopFormula {
  pub coefficient: f64,
  pub exponent: i32,
}

impl Default for FlopFormula {
  /// `2 * n^3`: one add and one min for each of the n^3 inner steps.
  fn default() -> Self {
    Self {
      coefficient: 2.0,
      exponent: 3,
    }
  }
}

impl FlopFormula {
  pub fn flops(&self, n: u32) -> f64 {
    self.coefficient * f64::from(n).powi(self.exponent)
  }
}

pub fn instructions_per_cycle(instructions: u64, cycles: u64) -> Result<f64> {
  if cycles == 0 {
    return Err(Error::DivisionByZero);
  }

  Ok(instructions as f64 / cycles as f64)
}

pub fn gflops(flops: f64, seconds: f64) -> f64 {
  1e-9 * flops / seconds
}

pub fn giga_instructions_per_second(instructions: u64, seconds: f64) -> f64 {
  1e-9 * instructions as f64 / seconds
}

/// Derives a row from a counter report.
///
/// # Errors
///
/// Fails with [`Error::DivisionByZero`] if the report has zero cycles.
pub fn derive(report: &RawCounterReport, input_size: u32, formula: Option<&FlopFormula>) -> Result<ResultRow> {
  let instructions_per_cycle = instructions_per_cycle(report.instructions, report.cycles)?;

  Ok(ResultRow {
    input_size,
    seconds: report.seconds,
    counters: Some(Counters {
      instructions: report.instructions,
      cycles: report.cycles,
    }),
    instructions_per_cycle: Some(instructions_per_cycle),
    gflops: formula.map(|formula| gflops(formula.flops(input_size), report.seconds)),
    giga_instructions_per_second: Some(giga_instructions_per_second(report.instructions, report.seconds)),
  })
}

/// Derives a row from a timing-only measurement, where no counters exist.
pub fn derive_timing(seconds: f64, input_size: u32, formula: Option<&FlopFormula>) -> ResultRow {
  ResultRow {
    input_size,
    seconds,
    counters: None,
    instructions_per_cycle: None,
    gflops: formula.map(|formula| gflops(formula.flops(input_size), seconds)),
    giga_instructions_per_second: None,
  }
}
