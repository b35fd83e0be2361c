use std::{
  io::{self, Read},
  os::unix::process::CommandExt as _,
  process::{Child, Command, ExitStatus, Stdio},
  time::Duration,
};

use tempfile::{Builder, NamedTempFile};
use wait_timeout::ChildExt as WaitExt;

#[extend::ext]
pub impl Child {
  /// Waits at most `timeout` for the child to exit. On timeout the child's
  /// whole process group is killed, the child is reaped, and `Ok(None)` is
  /// returned. The child must lead its own group, see `spawn_merged`.
  fn wait_or_kill(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let Some(status) = self.wait_timeout(timeout)? else {
      // `perf stat` forks the workload, so killing the child alone would orphan it.
      if unsafe { libc::killpg(self.id() as libc::pid_t, libc::SIGKILL) } < 0 {
        return Err(io::Error::last_os_error());
      }
      self.wait()?;

      return Ok(None);
    };

    Ok(Some(status))
  }
}

#[extend::ext]
pub impl Command {
  /// Spawns the command in a new process group with both stdout and stderr
  /// written to `capture`. Both streams share one file description, so the
  /// interleaving the child produced is kept.
  fn spawn_merged(&mut self, capture: &NamedTempFile) -> io::Result<Child> {
    let stdout = capture.as_file().try_clone()?;
    let stderr = capture.as_file().try_clone()?;

    self
      .stdin(Stdio::null())
      .stdout(stdout)
      .stderr(stderr)
      .process_group(0)
      .spawn()
  }
}

#[extend::ext]
pub impl NamedTempFile {
  fn capture() -> io::Result<NamedTempFile> {
    Builder::new().prefix("step-bench-").suffix(".log").tempfile()
  }

  /// Reads the whole file from the start, replacing invalid UTF-8.
  fn read_lossy(&self) -> io::Result<String> {
    let mut bytes = Vec::new();
    self.reopen()?.read_to_end(&mut bytes)?;

    Ok(String::from_utf8_lossy(&bytes).into_owned())
  }
}
