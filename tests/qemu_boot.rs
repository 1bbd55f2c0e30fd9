//! End-to-end tests against a real QEMU binary and guest image.
//!
//! Gated behind the `qemu-tests` feature; requires KVM and these variables:
//!
//! - `VMHARNESS_QEMU`: path to qemu-system-x86_64
//! - `VMHARNESS_IMAGE`: bootable raw image with sshd and the test key
//! - `VMHARNESS_SSH_KEY`: private key for root@guest
//!
//! Run with `cargo test --features qemu-tests -- --test-nocapture`.

#![cfg(feature = "qemu-tests")]

mod common;

use std::env;
use std::path::PathBuf;

use tempfile::tempdir;

use vmharness::disk::{DiskAttachment, DiskBackend};
use vmharness::vm::{Vm, VmConfig, VmState};

fn env_path(name: &str) -> PathBuf {
    PathBuf::from(env::var(name).unwrap_or_else(|_| panic!("{name} must be set")))
}

fn boot_vm(work_dir: &std::path::Path) -> Vm {
    let mut config = VmConfig::new(
        env_path("VMHARNESS_QEMU"),
        work_dir,
        env_path("VMHARNESS_SSH_KEY"),
    );
    config.name = "qemu-boot-test".to_string();
    let mut vm = Vm::new(config).unwrap();
    vm.register_disk(DiskAttachment::new(
        "root",
        DiskBackend::File {
            image: env_path("VMHARNESS_IMAGE"),
            format: "raw".to_string(),
        },
        true,
    ));
    vm.start().unwrap();
    vm
}

#[test]
fn test_boot_and_guest_exec() {
    let dir = tempdir().unwrap();
    let mut vm = boot_vm(dir.path());
    assert_eq!(vm.state(), VmState::Running);

    let output = vm.guest_exec(&["uname", "-s"]).unwrap().check().unwrap();
    assert_eq!(output.stdout.trim(), "Linux");

    vm.kill(false).unwrap();
}

#[test]
fn test_migrate_round_trip_preserves_guest() {
    let dir = tempdir().unwrap();
    let mut vm = boot_vm(dir.path());

    // Leave a mark in the guest's tmpfs; it must survive the state transfer.
    vm.guest_exec(&["sh", "-c", "echo alive > /tmp/mark"])
        .unwrap()
        .check()
        .unwrap();

    vm.migrate().unwrap();
    assert_eq!(vm.state(), VmState::Running);

    let output = vm
        .guest_exec(&["cat", "/tmp/mark"])
        .unwrap()
        .check()
        .unwrap();
    assert_eq!(output.stdout.trim(), "alive");

    vm.kill(false).unwrap();
}
