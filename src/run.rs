use std::{
  collections::BTreeMap,
  ffi::OsString,
  fs,
  path::{Path, PathBuf},
  process::{Command, ExitStatus},
  time::Duration,
};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::{
  error::{Error, Result},
  ext::{ChildExt, CommandExt, NamedTempFileExt},
};

/// Concurrency-control variables of the threading runtimes the measured
/// binaries may use (OpenMP for C++, rayon for Rust).
pub const THREAD_VARIABLES: [&str; 2] = ["OMP_NUM_THREADS", "RAYON_NUM_THREADS"];

pub const PERF_STAT: [&str; 6] = ["perf", "stat", "--detailed", "--detailed", "--field-separator", ","];

/// Combined stdout and stderr of one process, with its exit status.
#[derive(Debug)]
pub struct CapturedOutput {
  pub text: String,
  pub status: ExitStatus,
}

/// Environment overrides setting every thread-count variable to `threads`.
pub fn thread_env(threads: u32) -> BTreeMap<String, String> {
  THREAD_VARIABLES
    .iter()
    .map(|var| (var.to_string(), threads.to_string()))
    .collect()
}

/// How measured binaries are started: an optional CPU-affinity prefix, an
/// optional counter tool prefix, and the bound on each wait.
#[derive(Clone, Debug)]
pub struct Launcher {
  pub cpu_list: Option<String>,
  pub counter_tool: Option<Vec<String>>,
  pub timeout: Duration,
}

impl Launcher {
  /// Builds `[taskset -c <cpus>] [<counter tool>] <binary> <args>`.
  pub fn command_line(&self, binary: &Path, args: &[String]) -> Vec<OsString> {
    let mut line: Vec<OsString> = Vec::new();

    if let Some(cpus) = &self.cpu_list {
      line.extend(["taskset", "-c", cpus.as_str()].map(OsString::from));
    }
    if let Some(tool) = &self.counter_tool {
      line.extend(tool.iter().map(OsString::from));
    }

    line.push(binary.into());
    line.extend(args.iter().map(OsString::from));

    line
  }

  /// Runs `binary` with `args` under the configured prefixes.
  ///
  /// # Errors
  ///
  /// - [`Error::Launch`] if `binary` is missing or not executable, or the
  ///   first program of the command line cannot be spawned.
  /// - [`Error::Timeout`] if the process outlives [`Launcher::timeout`].
  pub fn launch(&self, binary: &Path, args: &[String], env: Option<&BTreeMap<String, String>>) -> Result<CapturedOutput> {
    check_executable(binary)?;

    execute(&self.command_line(binary, args), env, self.timeout).map_err(|err| match err {
      Error::Timeout { timeout, .. } => Error::Timeout {
        program: binary.to_path_buf(),
        timeout,
      },
      other => other,
    })
  }
}

/// Fails with [`Error::Launch`] unless `binary` is an executable file.
pub fn check_executable(binary: &Path) -> Result<()> {
  let launch_error = |reason: String| Error::Launch {
    program: binary.to_path_buf(),
    reason,
  };

  let metadata = fs::metadata(binary).map_err(|err| launch_error(err.to_string()))?;
  if !metadata.is_file() {
    return Err(launch_error("not a regular file".into()));
  }

  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;

    if metadata.permissions().mode() & 0o111 == 0 {
      return Err(launch_error("not executable".into()));
    }
  }

  Ok(())
}

/// Executes `command_line`, with `env` merged over the inherited environment,
/// and captures stdout and stderr as one text. The wait is bounded by
/// `timeout`; a process still running after it is killed.
pub fn execute(
  command_line: &[OsString],
  env: Option<&BTreeMap<String, String>>,
  timeout: Duration,
) -> Result<CapturedOutput> {
  let Some((program, args)) = command_line.split_first() else {
    return Err(Error::Launch {
      program: PathBuf::new(),
      reason: "empty command line".into(),
    });
  };

  let mut command = Command::new(program);
  command.args(args);
  if let Some(env) = env {
    command.envs(env);
  }

  debug!(?command, "spawning");

  let capture = NamedTempFile::capture()?;
  let mut child = command.spawn_merged(&capture).map_err(|err| Error::Launch {
    program: PathBuf::from(program),
    reason: err.to_string(),
  })?;

  let Some(status) = child.wait_or_kill(timeout)? else {
    return Err(Error::Timeout {
      program: PathBuf::from(program),
      timeout,
    });
  };

  Ok(CapturedOutput {
    text: capture.read_lossy()?,
    status,
  })
}
