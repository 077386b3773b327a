//! Process handle abstraction used by the session.

use async_trait::async_trait;
use std::io;
use std::process::ExitStatus;

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitReport {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if any (unix only)
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Exit signal and kill switch of a child process.
///
/// `wait` must be cancel safe: the session polls it inside `select!` and
/// drops the future whenever another event wins.
#[async_trait]
pub trait ChildProcess: Send + 'static {
    async fn wait(&mut self) -> io::Result<ExitReport>;

    /// Send `signal`, or force termination when `None`. Exit is still
    /// reported through `wait`.
    fn kill(&mut self, signal: Option<i32>) -> io::Result<()>;
}

#[async_trait]
impl ChildProcess for tokio::process::Child {
    async fn wait(&mut self) -> io::Result<ExitReport> {
        let status = tokio::process::Child::wait(self).await?;
        Ok(status.into())
    }

    fn kill(&mut self, signal: Option<i32>) -> io::Result<()> {
        let Some(signal) = signal else {
            return self.start_kill();
        };
        let pid = self
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child has already exited"))?;
        send_signal(pid, signal)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) only reads its two integer arguments
    if unsafe { libc::kill(pid, signal) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signals are only supported on unix",
    ))
}
