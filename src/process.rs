//! VM child-process management.
//!
//! Signal delivery and exit-code collection for the external VM process.
//! Exit codes follow the shell convention: a signal death maps to
//! 128 + signal number.

use std::process::Child;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Default timeout when waiting for a process to exit after a signal.
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Check if a process is alive.
pub fn is_alive(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

fn send_signal(pid: libc::pid_t, signal: libc::c_int) -> bool {
    unsafe { libc::kill(pid, signal) == 0 }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// Handle to a spawned VM process.
///
/// Wraps the child and caches its exit code once collected, so status can be
/// queried repeatedly after exit.
#[derive(Debug)]
pub struct VmProcess {
    child: Child,
    exit_code: Option<i32>,
}

impl VmProcess {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            exit_code: None,
        }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.child.id() as libc::pid_t
    }

    /// Non-blocking exit check. Returns `Some(code)` once the process has
    /// exited and been reaped.
    pub fn try_wait(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(exit_code(status));
                self.exit_code
            }
            Ok(None) => None,
            Err(_) => {
                // Not our child anymore; treat as gone.
                self.exit_code = Some(-1);
                self.exit_code
            }
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.try_wait().is_none()
    }

    /// Send SIGINT (the VM's graceful quit).
    pub fn interrupt(&self) -> bool {
        send_signal(self.pid(), libc::SIGINT)
    }

    /// Send SIGKILL.
    pub fn kill(&mut self) {
        let _ = self.child.kill();
    }

    /// Wait for exit, polling up to `timeout`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<i32> {
        let start = Instant::now();
        loop {
            if let Some(code) = self.try_wait() {
                return Ok(code);
            }
            if start.elapsed() >= timeout {
                return Err(Error::Setup(format!(
                    "process {} did not exit within {:?}",
                    self.pid(),
                    timeout
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn spawn_sleep() -> VmProcess {
        VmProcess::new(
            Command::new("sleep")
                .arg("30")
                .spawn()
                .expect("spawn sleep"),
        )
    }

    #[test]
    fn test_is_alive_self() {
        let pid = unsafe { libc::getpid() };
        assert!(is_alive(pid));
    }

    #[test]
    fn test_running_process_has_no_exit_code() {
        let mut proc = spawn_sleep();
        assert!(proc.is_running());
        assert!(proc.try_wait().is_none());
        proc.kill();
        let _ = proc.wait_timeout(Duration::from_secs(5));
    }

    #[test]
    fn test_kill_reports_signal_exit() {
        let mut proc = spawn_sleep();
        proc.kill();
        let code = proc.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(code, 128 + libc::SIGKILL);
        // Cached afterwards.
        assert_eq!(proc.try_wait(), Some(code));
    }

    #[test]
    fn test_interrupt_terminates_sleep() {
        let mut proc = spawn_sleep();
        assert!(proc.interrupt());
        let code = proc.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(code, 128 + libc::SIGINT);
    }

    #[test]
    fn test_clean_exit_code() {
        let mut proc = VmProcess::new(Command::new("true").spawn().expect("spawn true"));
        let code = proc.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(code, 0);
        assert!(!proc.is_running());
    }
}
