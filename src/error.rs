use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Failures of a single measurement, or of the sweep as a whole.
#[derive(Debug, Error)]
pub enum Error {
  /// The measured binary is missing, not executable, or could not be spawned.
  #[error("failed to launch {program:?}: {reason}")]
  Launch { program: PathBuf, reason: String },

  /// The subprocess did not exit within the configured bound and was killed.
  #[error("{program:?} did not finish within {timeout:?}")]
  Timeout { program: PathBuf, timeout: Duration },

  /// Counter tool output did not have the expected shape. Usually a tool
  /// version mismatch.
  #[error("malformed counter report: {0}")]
  MalformedReport(String),

  /// The counter tool is not allowed to read hardware counters.
  #[error("insufficient permission to collect hardware counters")]
  PermissionDenied,

  #[error("report directory {0:?} does not exist")]
  SinkUnavailable(PathBuf),

  #[error("cannot compute instructions per cycle from zero cycles")]
  DivisionByZero,

  #[error(transparent)]
  Io(#[from] io::Error),

  #[error(transparent)]
  Csv(#[from] csv::Error),
}

impl Error {
  /// Returns true for errors that only concern one invocation. These are
  /// recorded against their (variant, size, repetition) and the sweep moves
  /// on; anything else aborts it.
  pub fn is_recoverable(&self) -> bool {
    matches!(
      self,
      Error::Launch { .. } | Error::Timeout { .. } | Error::MalformedReport(_) | Error::DivisionByZero
    )
  }

  /// A corrective hint for errors the user can fix in their environment.
  pub fn hint(&self) -> Option<&'static str> {
    match self {
      Error::PermissionDenied => Some(
        "perf cannot read hardware counters; lower the restriction with \
         `sudo sysctl kernel.perf_event_paranoid=-1` or rerun with --no-perf",
      ),
      Error::SinkUnavailable(_) => Some("create the report directory before starting the sweep"),
      _ => None,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
