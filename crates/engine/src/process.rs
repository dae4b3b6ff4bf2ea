//! Handles to running child processes.

use std::fs::File;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

/// Added to a signal number to form the exit code of a signalled process.
pub const SIGNAL_EXIT_BASE: i32 = 128;

const PTY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A supervised child, launched over pipes or on a PTY.
pub enum ChildProcess {
    Pipe(tokio::process::Child),
    Pty(Box<dyn portable_pty::Child + Send + Sync>),
}

impl ChildProcess {
    /// OS process id, or `None` once a pipe child has been reaped.
    pub fn pid(&self) -> Option<u32> {
        match self {
            ChildProcess::Pipe(child) => child.id(),
            ChildProcess::Pty(child) => child.process_id(),
        }
    }

    /// Exit code if the process has exited, without blocking.
    pub fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
        match self {
            ChildProcess::Pipe(child) => Ok(child.try_wait()?.map(exit_code_of)),
            ChildProcess::Pty(child) => Ok(child.try_wait()?.map(|status| status.exit_code() as i32)),
        }
    }

    /// Waits for exit and returns the exit code.
    ///
    /// Cancel-safe: dropping the future leaves the child running.
    pub async fn wait_exit(&mut self) -> io::Result<i32> {
        match self {
            ChildProcess::Pipe(child) => child.wait().await.map(exit_code_of),
            ChildProcess::Pty(child) => loop {
                if let Some(status) = child.try_wait()? {
                    return Ok(status.exit_code() as i32);
                }
                tokio::time::sleep(PTY_POLL_INTERVAL).await;
            },
        }
    }

    /// Kills the process through its own handle rather than by pid.
    pub fn kill_direct(&mut self) -> io::Result<()> {
        match self {
            ChildProcess::Pipe(child) => child.start_kill(),
            ChildProcess::Pty(child) => child.kill(),
        }
    }

    pub fn is_pty(&self) -> bool {
        matches!(self, ChildProcess::Pty(_))
    }
}

impl std::fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pty", &self.is_pty())
            .field("pid", &self.pid())
            .finish()
    }
}

/// Exit code of `status`; `128 + n` for a process killed by signal `n`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return SIGNAL_EXIT_BASE + signal;
        }
    }
    -1
}

/// One OS pipe whose write end is handed to both stdout and stderr.
///
/// Returns the read end and the two `Stdio` values for the child. The
/// parent's copies of the write end must be dropped after spawning so that
/// the reader sees EOF.
pub(crate) fn merged_pipe() -> io::Result<(File, Stdio, Stdio)> {
    let (read, write) = open_pipe()?;
    let write_err = write.try_clone()?;
    Ok((File::from(read), Stdio::from(write), Stdio::from(write_err)))
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn open_pipe() -> io::Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
    use nix::fcntl::OFlag;

    nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn open_pipe() -> io::Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
    nix::unistd::pipe().map_err(io::Error::from)
}
