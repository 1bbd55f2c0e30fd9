//! Guest command execution.
//!
//! The orchestrator only depends on the synchronous exec contract in
//! [`GuestShell`]; the bundled [`SshShell`] drives the ssh binary against the
//! forwarded guest port. Test code substitutes scripted shells.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Default per-command timeout.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Default deadline for the guest to become reachable after boot.
pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval between reachability probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Result of a guest command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Fail with [`Error::GuestExec`] on a non-zero exit code.
    pub fn check(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::GuestExec(format!(
                "exit code {}: {}",
                self.code,
                self.stderr.trim()
            )))
        }
    }
}

/// Synchronous remote command execution inside the guest.
pub trait GuestShell: Send {
    /// Run `argv` in the guest, waiting at most `timeout` for completion.
    fn exec(&self, argv: &[&str], timeout: Duration) -> Result<ExecOutput>;
}

/// ssh-based [`GuestShell`] over the VM's forwarded port on localhost.
pub struct SshShell {
    port: u16,
    key_path: PathBuf,
    user: String,
}

const SSH_OPTS: &[&str] = &[
    "-oGlobalKnownHostsFile=/dev/null",
    "-oUserKnownHostsFile=/dev/null",
    "-oPasswordAuthentication=no",
    "-oStrictHostKeyChecking=no",
    "-oTCPKeepAlive=no",
    "-oServerAliveInterval=3",
    "-oServerAliveCountMax=10",
];

impl SshShell {
    pub fn new(port: u16, key_path: PathBuf, user: impl Into<String>) -> Self {
        Self {
            port,
            key_path,
            user: user.into(),
        }
    }
}

impl GuestShell for SshShell {
    fn exec(&self, argv: &[&str], timeout: Duration) -> Result<ExecOutput> {
        let mut cmd = Command::new("ssh");
        cmd.args(SSH_OPTS)
            .arg("-i")
            .arg(&self.key_path)
            .arg("-p")
            .arg(self.port.to_string())
            .arg(format!("{}@localhost", self.user))
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!(port = self.port, command = ?argv, "guest exec");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::GuestExec(format!("failed to spawn ssh: {e}")))?;

        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => {}
                Err(e) => return Err(Error::GuestExec(format!("wait failed: {e}"))),
            }
            if start.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::GuestExec(format!(
                    "{:?} timed out after {:?}",
                    argv, timeout
                )));
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        let output = child
            .wait_with_output()
            .map_err(|e| Error::GuestExec(format!("failed to collect output: {e}")))?;
        let result = ExecOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        tracing::debug!(code = result.code, "guest exec returned");
        Ok(result)
    }
}

/// Poll the guest with `probe` until it answers with exit code 0.
///
/// Retries at `step` intervals; transport failures and timeouts of single
/// probes are swallowed. Fails with [`Error::GuestUnreachable`] once the
/// overall deadline elapses.
pub fn wait_reachable(
    shell: &dyn GuestShell,
    probe: &[&str],
    timeout: Duration,
    step: Duration,
) -> Result<()> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        match shell.exec(probe, step) {
            Ok(out) if out.success() => return Ok(()),
            Ok(out) => {
                // A botched key never heals; retrying just burns the deadline.
                if out.stderr.contains("UNPROTECTED PRIVATE KEY FILE") {
                    return Err(Error::GuestExec(
                        "ssh key permissions are too open".to_string(),
                    ));
                }
            }
            Err(Error::GuestExec(_)) => {}
            Err(e) => return Err(e),
        }
        std::thread::sleep(step);
    }

    tracing::error!(waited = ?start.elapsed(), "guest unreachable");
    Err(Error::GuestUnreachable {
        waited: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedShell {
        // Number of probes that fail before one succeeds.
        failures: AtomicU32,
    }

    impl GuestShell for ScriptedShell {
        fn exec(&self, _argv: &[&str], _timeout: Duration) -> Result<ExecOutput> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Ok(ExecOutput {
                    code: 255,
                    stdout: String::new(),
                    stderr: "Connection refused".to_string(),
                });
            }
            Ok(ExecOutput {
                code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[test]
    fn test_check_rejects_nonzero() {
        let out = ExecOutput {
            code: 1,
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        assert!(matches!(out.check(), Err(Error::GuestExec(_))));
    }

    #[test]
    fn test_wait_reachable_retries_until_success() {
        let shell = ScriptedShell {
            failures: AtomicU32::new(2),
        };
        wait_reachable(
            &shell,
            &["true"],
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .unwrap();
    }

    #[test]
    fn test_wait_reachable_deadline() {
        let shell = ScriptedShell {
            failures: AtomicU32::new(u32::MAX),
        };
        let start = Instant::now();
        let err = wait_reachable(
            &shell,
            &["true"],
            Duration::from_millis(200),
            Duration::from_millis(20),
        )
        .unwrap_err();
        assert!(matches!(err, Error::GuestUnreachable { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_bad_key_permissions_fail_fast() {
        struct BadKeyShell;
        impl GuestShell for BadKeyShell {
            fn exec(&self, _argv: &[&str], _timeout: Duration) -> Result<ExecOutput> {
                Ok(ExecOutput {
                    code: 255,
                    stdout: String::new(),
                    stderr: "WARNING: UNPROTECTED PRIVATE KEY FILE!".to_string(),
                })
            }
        }
        let err = wait_reachable(
            &BadKeyShell,
            &["true"],
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .unwrap_err();
        assert!(matches!(err, Error::GuestExec(_)));
    }
}
