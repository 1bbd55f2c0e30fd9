//! vmharness - test orchestration for disk-virtualization backends.
//!
//! Drives a QEMU-compatible VM through its machine protocol socket to
//! validate disk backends under real guest workloads: boot, hot-plug,
//! save/restore migration, and guest-side verification over ssh.
//!
//! The crate splits into three layers:
//!
//! - [`qmp`]: a blocking newline-JSON protocol client with single-flight
//!   command correlation and an event queue.
//! - [`disk`]: polymorphic disk attachment descriptors (file-backed,
//!   vhost-user-blk, virtiofs) with per-backend capability flags.
//! - [`vm`]: process lifecycle, the VM state machine, device hot-plug, and
//!   the migration protocol.

pub mod disk;
pub mod error;
pub mod guest;
pub mod process;
pub mod qmp;
pub mod vm;

pub use error::{Error, Result};
