//! Disk attachments and their backends.
//!
//! Each attachment pairs a guest-visible virtio device with the backend that
//! serves its I/O: a file opened by the VM itself, an out-of-process
//! vhost-user block daemon, or an out-of-process virtiofs daemon. Behavior
//! differences between variants are expressed as a capability set consulted
//! by the orchestrator, not as type dispatch.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};

use crate::error::Result;
use crate::guest::GuestShell;

/// Timeout for each guest-side setup command.
const GUEST_SETUP_TIMEOUT: Duration = Duration::from_secs(60);

/// What a disk variant can do, as consulted by the orchestrator.
///
/// New variants opt in explicitly instead of being probed by type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskCaps {
    /// The device can be bound to a dedicated iothread object.
    pub supports_iothread: bool,
    /// The device accepts a `num-queues` derived from the vCPU count.
    pub supports_multiqueue: bool,
    /// The attachment survives live migration: its device produces a state
    /// stream the destination can load.
    pub migratable: bool,
    /// I/O is served by a process outside the VM, reached over a socket.
    pub requires_external_backend: bool,
}

/// Backend serving a disk's I/O.
#[derive(Debug, Clone)]
pub enum DiskBackend {
    /// Image file opened by the VM process itself (`blockdev-add`).
    File {
        /// Path to the disk image on the host.
        image: PathBuf,
        /// Image driver name, e.g. "raw" or "qcow2".
        format: String,
    },
    /// Out-of-process vhost-user block daemon reached via a Unix socket.
    VhostUserBlk {
        /// The daemon's vhost-user socket.
        socket: PathBuf,
        /// Use the transitional `vhost-user-virtio-blk-pci` driver, which
        /// carries the virtio-blk migration stream format.
        legacy_virtio_stream: bool,
    },
    /// Out-of-process virtiofs daemon exporting a host directory.
    VirtioFs {
        /// The daemon's vhost-user socket.
        socket: PathBuf,
        /// File inside the export used to target validation I/O.
        scratch_file: String,
    },
}

/// A disk to attach to a VM.
///
/// Bus slots are assigned by the VM at hot-plug time (monotonically, never
/// reused mid-run); the attachment only supplies command payload fragments.
#[derive(Debug, Clone)]
pub struct DiskAttachment {
    id: String,
    backend: DiskBackend,
    bootable: bool,
    with_iothread: bool,
}

impl DiskAttachment {
    /// Create an attachment. The iothread is enabled by default for variants
    /// that support one.
    pub fn new(id: impl Into<String>, backend: DiskBackend, bootable: bool) -> Self {
        let mut attachment = Self {
            id: id.into(),
            backend,
            bootable,
            with_iothread: false,
        };
        attachment.with_iothread = attachment.caps().supports_iothread;
        attachment
    }

    /// Disable the dedicated iothread for an iothread-capable variant.
    pub fn without_iothread(mut self) -> Self {
        self.with_iothread = false;
        self
    }

    /// Attachment identifier; also used as the device serial.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Capability set for this variant.
    pub fn caps(&self) -> DiskCaps {
        match &self.backend {
            DiskBackend::File { .. } => DiskCaps {
                supports_iothread: true,
                supports_multiqueue: true,
                migratable: true,
                requires_external_backend: false,
            },
            DiskBackend::VhostUserBlk {
                legacy_virtio_stream,
                ..
            } => DiskCaps {
                supports_iothread: false,
                supports_multiqueue: true,
                // Only the transitional driver carries a stream the
                // destination can load.
                migratable: *legacy_virtio_stream,
                requires_external_backend: true,
            },
            DiskBackend::VirtioFs { .. } => DiskCaps {
                supports_iothread: false,
                supports_multiqueue: false,
                migratable: false,
                requires_external_backend: true,
            },
        }
    }

    /// The backend attach command sent before `device_add`, if any.
    pub fn connect_command(&self) -> Option<(&'static str, Value)> {
        match &self.backend {
            DiskBackend::File { image, format } => Some((
                "blockdev-add",
                json!({
                    "driver": format,
                    "node-name": self.node_name(),
                    "cache": { "direct": true },
                    "detect-zeroes": "on",
                    "file": {
                        "driver": "file",
                        "filename": image.display().to_string(),
                    },
                }),
            )),
            DiskBackend::VhostUserBlk { socket, .. } | DiskBackend::VirtioFs { socket, .. } => {
                Some((
                    "chardev-add",
                    json!({
                        "id": self.chardev_id(),
                        "backend": {
                            "type": "socket",
                            "data": {
                                "reconnect": 1,
                                "server": false,
                                "addr": {
                                    "type": "unix",
                                    "data": { "path": socket.display().to_string() },
                                },
                            },
                        },
                    }),
                ))
            }
        }
    }

    /// Driver name passed to `device_add`.
    pub fn driver(&self) -> &'static str {
        match &self.backend {
            DiskBackend::File { .. } => "virtio-blk-pci",
            DiskBackend::VhostUserBlk {
                legacy_virtio_stream: true,
                ..
            } => "vhost-user-virtio-blk-pci",
            DiskBackend::VhostUserBlk { .. } => "vhost-user-blk-pci",
            DiskBackend::VirtioFs { .. } => "vhost-user-fs-pci",
        }
    }

    /// Guest-visible device id.
    pub fn device_id(&self) -> String {
        match &self.backend {
            DiskBackend::File { .. } => format!("virtio-disk-{}", self.id),
            DiskBackend::VhostUserBlk { .. } => format!("vhost-user-blk-{}", self.id),
            DiskBackend::VirtioFs { .. } => format!("virtiofs-{}", self.id),
        }
    }

    /// Id of the iothread object to create before `device_add`, if enabled.
    pub fn iothread_id(&self) -> Option<String> {
        self.with_iothread.then(|| format!("iot-{}", self.id))
    }

    fn node_name(&self) -> String {
        format!("node-{}", self.id)
    }

    fn chardev_id(&self) -> String {
        match &self.backend {
            DiskBackend::VhostUserBlk { .. } => format!("vhost-user-blk-{}.sock", self.id),
            _ => format!("virtiofs-{}.sock", self.id),
        }
    }

    /// virtiofs mount tag.
    fn fs_tag(&self) -> String {
        format!("{}_tag", self.id)
    }

    fn guest_mount_dir(&self) -> String {
        format!("/mnt/{}", self.id)
    }

    /// `device_add` arguments for hot-plugging this disk.
    ///
    /// `bus` is the PCI root-port id assigned by the VM; `cpu_count` sizes
    /// the queue count for multi-queue variants. `vm_major` accounts for
    /// version-dependent argument differences.
    pub fn hotplug_args(&self, bus: &str, cpu_count: u32, vm_major: u32) -> Value {
        let mut args = match &self.backend {
            DiskBackend::File { .. } => json!({
                "driver": self.driver(),
                "id": self.device_id(),
                "disable-legacy": "off",
                "write-cache": "off",
                "rerror": "report",
                "werror": "report",
                "drive": self.node_name(),
                "serial": self.id,
                "config-wce": "off",
            }),
            DiskBackend::VhostUserBlk { .. } => json!({
                "driver": self.driver(),
                "id": self.device_id(),
                "disable-legacy": "off",
                "chardev": self.chardev_id(),
                "config-wce": "off",
            }),
            DiskBackend::VirtioFs { .. } => json!({
                "driver": self.driver(),
                "id": self.device_id(),
                "chardev": self.chardev_id(),
                "tag": self.fs_tag(),
            }),
        };

        args["bus"] = json!(bus);
        if self.bootable {
            args["bootindex"] = json!("1");
        }
        if self.caps().supports_multiqueue {
            args["num-queues"] = json!(cpu_count);
        }
        if let Some(iothread) = self.iothread_id() {
            args["iothread"] = json!(iothread);
        }
        if matches!(self.backend, DiskBackend::File { .. }) && vm_major >= 5 {
            // libvhost does not implement these; they must stay off for the
            // virtio-blk to vhost transition to migrate cleanly.
            args["write-zeroes"] = json!("off");
            args["discard"] = json!("off");
        }

        args
    }

    /// Guest-visible path used to target validation I/O.
    pub fn guest_path(&self) -> String {
        match &self.backend {
            DiskBackend::File { .. } | DiskBackend::VhostUserBlk { .. } => {
                format!("/dev/disk/by-id/virtio-{}", self.id)
            }
            DiskBackend::VirtioFs { scratch_file, .. } => {
                format!("{}/{}", self.guest_mount_dir(), scratch_file)
            }
        }
    }

    /// Guest-side setup after boot. A no-op for block variants; virtiofs
    /// exports are added to fstab and mounted.
    pub fn setup_guest(&self, shell: &dyn GuestShell) -> Result<()> {
        if !matches!(self.backend, DiskBackend::VirtioFs { .. }) {
            return Ok(());
        }
        let tag = self.fs_tag();
        let dir = self.guest_mount_dir();

        let mounted = shell.exec(
            &["findmnt", "--noheadings", "-t", "virtiofs", &tag, "--kernel"],
            GUEST_SETUP_TIMEOUT,
        )?;
        if !mounted.stdout.trim().is_empty() {
            return Ok(());
        }

        let in_fstab = shell.exec(
            &["findmnt", "--noheadings", "-t", "virtiofs", &tag, "--fstab"],
            GUEST_SETUP_TIMEOUT,
        )?;
        if in_fstab.stdout.trim().is_empty() {
            shell
                .exec(&["mkdir", "-p", &dir], GUEST_SETUP_TIMEOUT)?
                .check()?;
            let fstab_line = format!(
                "echo '{tag} {dir} virtiofs defaults 1 1 # added by vmharness' >> /etc/fstab"
            );
            shell
                .exec(&["sh", "-c", &fstab_line], GUEST_SETUP_TIMEOUT)?
                .check()?;
        }

        shell
            .exec(&["mount", "-t", "virtiofs", &tag], GUEST_SETUP_TIMEOUT)?
            .check()?;
        shell.exec(&["sync"], GUEST_SETUP_TIMEOUT)?.check()?;
        Ok(())
    }
}
