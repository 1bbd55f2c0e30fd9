//! Error types for vmharness.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the orchestrator and the QMP client.
#[derive(Error, Debug)]
pub enum Error {
    /// The QMP socket never appeared within the connect deadline.
    ///
    /// The partially started VM process is force-killed before this
    /// propagates.
    #[error("QMP socket {path} did not accept a connection within {waited:?}")]
    ConnectionTimeout { path: PathBuf, waited: Duration },

    /// The peer rejected a command with an error frame.
    ///
    /// The connection stays usable; the failure applies to that command only.
    #[error("{class}: {desc}")]
    Protocol { class: String, desc: String },

    /// Frame ordering or correlation violation.
    ///
    /// Indicates a protocol or implementation bug; the connection must be
    /// discarded.
    #[error("unexpected QMP message: {0}")]
    UnexpectedMessage(String),

    /// Health check failed: the VM process was never started.
    #[error("VM process has not run")]
    ProcessNotRunning,

    /// Health check failed: the VM process has exited.
    #[error("VM process exited with code {0}")]
    ProcessExited(i32),

    /// The guest did not become reachable within the probe deadline.
    ///
    /// Typically indicates a boot failure.
    #[error("guest unreachable for more than {waited:?}")]
    GuestUnreachable { waited: Duration },

    /// Migration reached a terminal status other than "completed",
    /// or was rejected up front (non-migratable disk attached).
    #[error("migration failed with status: {0}")]
    Migration(String),

    /// The VM binary could not be probed (`-version` / `-device ?`).
    #[error("failed to probe VM binary: {0}")]
    BinaryProbe(String),

    /// Guest command execution failed at the transport level.
    #[error("guest exec failed: {0}")]
    GuestExec(String),

    /// Operation not permitted in the VM's current state.
    #[error("invalid VM state: expected {expected}, actual {actual}")]
    InvalidState { expected: String, actual: String },

    /// Start sequencing failed outside the protocol layer.
    #[error("VM setup failed: {0}")]
    Setup(String),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("JSON encode/decode error")]
    Json(#[from] serde_json::Error),
}
