//! VM lifecycle orchestration.
//!
//! [`Vm`] owns the external VM process, its QMP connection, and the state
//! machine across start, pause, hot-plug, migration, and shutdown. One
//! instance owns one process and one socket; concurrency across VMs is
//! achieved by independent instances with nothing shared.

pub mod migration;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};

use crate::disk::DiskAttachment;
use crate::error::{Error, Result};
use crate::guest::{self, ExecOutput, GuestShell, SshShell, DEFAULT_EXEC_TIMEOUT};
use crate::process::{VmProcess, DEFAULT_EXIT_TIMEOUT};
use crate::qmp::QmpClient;
use migration::{MigrationSession, MigrationStatus, STATUS_POLL_INTERVAL};

/// Deadline for the QMP socket to appear after process launch.
pub const QMP_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Fixed UUID so capability-negotiated UUID validation is deterministic.
const VM_UUID: &str = "ffffffff-ffff-ffff-ffff-ffffffffffff";

/// Id of the main memory backend object.
const MEM_ID: &str = "memory";

/// Guest OS flavor; selects shell user, probe command, and CPU flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsType {
    Linux,
    Windows,
}

/// Caller-built VM configuration.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Name used in log spans.
    pub name: String,
    /// VM binary (qemu-system-x86_64 or compatible).
    pub binary: PathBuf,
    /// Directory for sockets, logs, pid file, and migration state.
    pub work_dir: PathBuf,
    /// Private key for guest ssh access.
    pub ssh_key: PathBuf,
    pub os_type: OsType,
    /// Desired vCPU count before host-proportional capping.
    pub target_size: u32,
    /// Deadline for the guest to answer probes after boot.
    pub boot_timeout: Duration,
    /// Interval between guest probes.
    pub probe_interval: Duration,
    /// Deadline for the QMP socket to appear after process launch.
    pub qmp_connect_timeout: Duration,
}

impl VmConfig {
    pub fn new(
        binary: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        ssh_key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: "vm".to_string(),
            binary: binary.into(),
            work_dir: work_dir.into(),
            ssh_key: ssh_key.into(),
            os_type: OsType::Linux,
            target_size: 16,
            boot_timeout: guest::DEFAULT_BOOT_TIMEOUT,
            probe_interval: guest::DEFAULT_PROBE_INTERVAL,
            qmp_connect_timeout: QMP_CONNECT_TIMEOUT,
        }
    }
}

/// Host-proportional CPU and memory sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmSizing {
    /// vCPU count; always even to match the threads=2 topology.
    pub cpu_count: u32,
    pub mem_size_gb: u32,
    /// Headroom reserved for memory hot-plug.
    pub hotplug_mem_gb: u32,
}

impl VmSizing {
    /// Size a VM to `target` vCPUs, capped at a quarter of the host's CPUs
    /// and memory with 1 GiB per vCPU.
    pub fn for_host(target: u32) -> Self {
        const HOST_FRACTION: u32 = 4;
        const MEM_PER_CPU_GB: u32 = 1;

        let host_cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) }.max(1) as u32;
        let host_mem_gb = {
            let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) }.max(0) as u64;
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(0) as u64;
            (pages * page_size >> 30) as u32
        };

        let mut cpus = target.min((host_cpus / HOST_FRACTION).max(1));
        let mut mem = (cpus * MEM_PER_CPU_GB)
            .min((host_mem_gb / HOST_FRACTION).max(1))
            .max(1);
        // Whatever the limiting factor, keep the proportion.
        cpus = cpus.min(mem / MEM_PER_CPU_GB).max(1);
        // Even count, at least one core with two threads.
        cpus = (cpus & !1).max(2);
        mem = mem.max(cpus * MEM_PER_CPU_GB);

        Self {
            cpu_count: cpus,
            mem_size_gb: mem,
            hotplug_mem_gb: 1,
        }
    }

    pub fn max_mem_gb(&self) -> u32 {
        self.mem_size_gb + self.hotplug_mem_gb
    }
}

/// The VM state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Stopped,
    Starting,
    Running,
    Paused,
    MigratingOut,
    MigratingIn,
    Dead,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Stopped => write!(f, "stopped"),
            VmState::Starting => write!(f, "starting"),
            VmState::Running => write!(f, "running"),
            VmState::Paused => write!(f, "paused"),
            VmState::MigratingOut => write!(f, "migrating-out"),
            VmState::MigratingIn => write!(f, "migrating-in"),
            VmState::Dead => write!(f, "dead"),
        }
    }
}

/// Capabilities probed from the VM binary before launch.
#[derive(Debug, Clone)]
pub struct BinaryInfo {
    /// `[major, minor, patch]`.
    pub version: Vec<u32>,
    /// Device names from `-device ?`.
    pub devices: Vec<String>,
}

fn parse_version(text: &str) -> Result<Vec<u32>> {
    let re =
        Regex::new(r"\d+\.\d+\.\d+").map_err(|e| Error::BinaryProbe(e.to_string()))?;
    let found = re.find(text).ok_or_else(|| {
        Error::BinaryProbe(format!("can't find version in output: '{}'", text.trim()))
    })?;
    found
        .as_str()
        .split('.')
        .map(|part| {
            part.parse::<u32>()
                .map_err(|e| Error::BinaryProbe(e.to_string()))
        })
        .collect()
}

fn parse_devices(text: &str) -> Result<Vec<String>> {
    let re = Regex::new(r#"name "(\S+?)""#).map_err(|e| Error::BinaryProbe(e.to_string()))?;
    let devices: Vec<String> = re
        .captures_iter(text)
        .map(|cap| cap[1].trim_end_matches(',').to_string())
        .collect();
    if devices.is_empty() {
        return Err(Error::BinaryProbe(format!(
            "can't load supported devices: '{}'",
            text.trim()
        )));
    }
    Ok(devices)
}

fn probe_binary(binary: &Path) -> Result<BinaryInfo> {
    let run = |args: &[&str]| -> Result<String> {
        let output = Command::new(binary).args(args).output().map_err(|e| {
            Error::BinaryProbe(format!("failed to run {}: {e}", binary.display()))
        })?;
        // Old versions print the device list to stderr.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    };

    let version = parse_version(&run(&["-version"])?)?;
    let devices = parse_devices(&run(&["-device", "?"])?)?;
    Ok(BinaryInfo { version, devices })
}

/// Builds a [`GuestShell`] once the forwarded ssh port is known.
pub type ShellFactory = Box<dyn Fn(u16) -> Box<dyn GuestShell> + Send>;

/// A single orchestrated VM instance.
pub struct Vm {
    config: VmConfig,
    sizing: VmSizing,
    binary_info: BinaryInfo,

    qmp_sock: PathBuf,
    vnc_sock: PathBuf,
    serial_log: PathBuf,
    bios_log: PathBuf,
    migrate_state: PathBuf,
    pid_file: PathBuf,
    log_path: PathBuf,

    state: VmState,
    process: Option<VmProcess>,
    qmp: Option<QmpClient>,
    shell: Option<Box<dyn GuestShell>>,
    shell_factory: ShellFactory,
    ssh_port: Option<u16>,
    net_count: u32,
    /// Disks replayed at every start, in registration order.
    registered: Vec<DiskAttachment>,
    /// Disks attached to the live instance; cleared on process exit.
    attached: Vec<DiskAttachment>,
    migration: Option<MigrationSession>,
    span: tracing::Span,
}

impl Vm {
    /// Probe the binary, size the VM against the host, and prepare the work
    /// directory. No process is started yet.
    pub fn new(config: VmConfig) -> Result<Self> {
        let binary_info = probe_binary(&config.binary)?;
        let sizing = VmSizing::for_host(config.target_size);
        fs::create_dir_all(&config.work_dir)?;

        let work = &config.work_dir;
        let span = tracing::info_span!("vm", vm = %config.name);
        let ssh_key = config.ssh_key.clone();
        let user = match config.os_type {
            OsType::Windows => "Administrator",
            OsType::Linux => "root",
        };
        let shell_factory: ShellFactory =
            Box::new(move |port| Box::new(SshShell::new(port, ssh_key.clone(), user)));

        Ok(Self {
            qmp_sock: work.join("qmp.sock"),
            vnc_sock: work.join("vnc.sock"),
            serial_log: work.join("serial0.log"),
            bios_log: work.join("bios.log"),
            migrate_state: work.join("migrate.state"),
            pid_file: work.join("vm-pid"),
            log_path: work.join("vm.log"),
            config,
            sizing,
            binary_info,
            state: VmState::Stopped,
            process: None,
            qmp: None,
            shell: None,
            shell_factory,
            ssh_port: None,
            net_count: 0,
            registered: Vec::new(),
            attached: Vec::new(),
            migration: None,
            span,
        })
    }

    /// Replace the default ssh shell. Applies from the next port discovery.
    pub fn set_shell_factory(&mut self, factory: ShellFactory) {
        self.shell_factory = factory;
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn sizing(&self) -> VmSizing {
        self.sizing
    }

    pub fn version(&self) -> &[u32] {
        &self.binary_info.version
    }

    fn version_major(&self) -> u32 {
        self.binary_info.version.first().copied().unwrap_or(0)
    }

    pub fn supports_device(&self, device: &str) -> bool {
        self.binary_info.devices.iter().any(|d| d == device)
    }

    pub fn qmp_socket_path(&self) -> &Path {
        &self.qmp_sock
    }

    pub fn migrate_state_path(&self) -> &Path {
        &self.migrate_state
    }

    pub fn ssh_port(&self) -> Option<u16> {
        self.ssh_port
    }

    /// Disks attached to the live instance, in bus order.
    pub fn attached_disks(&self) -> &[DiskAttachment] {
        &self.attached
    }

    /// Direct access to the QMP client for scenario-specific commands.
    pub fn qmp(&mut self) -> Result<&mut QmpClient> {
        self.qmp.as_mut().ok_or(Error::ProcessNotRunning)
    }

    /// Register a disk to be attached at every start, after any already
    /// registered ones.
    pub fn register_disk(&mut self, disk: DiskAttachment) {
        self.registered.push(disk);
    }

    /// Start the VM: launch the process, connect QMP, attach network and
    /// registered disks, reset, resume, and wait for the guest to boot.
    ///
    /// A failure during command sequencing force-kills the partially started
    /// process before the error propagates.
    pub fn start(&mut self) -> Result<()> {
        self.launch(false)?;
        self.wait_guest_boot()?;
        self.state = VmState::Running;
        self.post_boot_setup()
    }

    fn launch(&mut self, incoming: bool) -> Result<()> {
        if let Some(proc) = self.process.as_mut() {
            if proc.is_running() {
                return Err(Error::InvalidState {
                    expected: "no running VM process".to_string(),
                    actual: format!("pid {} running", proc.pid()),
                });
            }
        }

        let args = self.build_args(incoming);
        let span = self.span.clone();
        let _guard = span.enter();
        tracing::debug!(cmdline = %args.join(" "), "starting VM process");

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(
            log,
            "starting VM\ncmd: {} {}",
            self.config.binary.display(),
            args.join(" ")
        )?;

        let child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .spawn()?;
        let pid = child.id();
        self.process = Some(VmProcess::new(child));
        self.state = if incoming {
            VmState::MigratingIn
        } else {
            VmState::Starting
        };
        fs::write(&self.pid_file, pid.to_string())?;

        match self.launch_setup(incoming) {
            Ok(()) => {
                tracing::debug!(pid, "VM process started");
                Ok(())
            }
            Err(e) => {
                tracing::info!(error = %e, "killing VM after failed setup");
                self.force_cleanup();
                Err(e)
            }
        }
    }

    fn launch_setup(&mut self, incoming: bool) -> Result<()> {
        if let Some(code) = self.process.as_mut().and_then(VmProcess::try_wait) {
            return Err(Error::ProcessExited(code));
        }

        self.qmp = Some(QmpClient::connect(
            &self.qmp_sock,
            self.config.qmp_connect_timeout,
        )?);
        self.hotplug_net_user()?;

        for disk in self.registered.clone() {
            self.attach_disk_commands(&disk)?;
        }

        let qmp = self.qmp.as_mut().ok_or(Error::ProcessNotRunning)?;
        self.migration = Some(MigrationSession::negotiate(qmp, true)?);

        self.qmp_command("system_reset", None)?;
        if !incoming {
            self.qmp_command("cont", None)?;
        }
        Ok(())
    }

    /// Best-effort kill and state reset; never fails.
    fn force_cleanup(&mut self) {
        if let Some(proc) = self.process.as_mut() {
            if proc.is_running() {
                proc.kill();
                let _ = proc.wait_timeout(DEFAULT_EXIT_TIMEOUT);
            }
        }
        let _ = fs::remove_file(&self.pid_file);
        self.qmp = None;
        self.shell = None;
        self.ssh_port = None;
        self.attached.clear();
        self.net_count = 0;
        self.migration = None;
        self.state = VmState::Dead;
    }

    /// Attach a user-mode netdev with a guest ssh forward and discover the
    /// host-side port via the monitor.
    fn hotplug_net_user(&mut self) -> Result<()> {
        let major = self.version_major();
        // The hostfwd argument became a list of wrappers in major 5.
        let hostfwd: Value = if major >= 5 {
            json!([{ "str": "tcp::0-:22" }])
        } else {
            json!("tcp::0-:22")
        };

        let netdev_id = format!("netdev{}", self.net_count);
        self.qmp_command(
            "netdev_add",
            Some(json!({
                "id": &netdev_id,
                "type": "user",
                "hostfwd": hostfwd,
            })),
        )?;

        let mut device_args = json!({
            "driver": "virtio-net-pci",
            "id": format!("net{}", self.net_count),
            "netdev": netdev_id,
            "mac": "aa:aa:aa:aa:aa:aa",
            "mq": "on",
            "disable-legacy": "off",
            "vectors": (self.sizing.cpu_count * 2 + 2).to_string(),
            // Network devices sit on the second expander's ports.
            "bus": format!("s{}", self.net_count + 8),
        });
        if major <= 2 {
            // event-idx is broken with user networking on these versions.
            device_args["event_idx"] = json!("off");
        }
        self.qmp_command("device_add", Some(device_args))?;
        self.net_count += 1;

        if self.ssh_port.is_some() {
            return Err(Error::Setup("ssh port already discovered".to_string()));
        }
        let info = self.qmp_command(
            "human-monitor-command",
            Some(json!({ "command-line": "info usernet" })),
        )?;
        let text = info
            .as_str()
            .ok_or_else(|| Error::Setup("info usernet returned a non-string".to_string()))?;

        let mut port: Option<u16> = None;
        for line in text.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.first() == Some(&"TCP[HOST_FORWARD]") && fields.get(5) == Some(&"22") {
                if port.is_some() {
                    return Err(Error::Setup(
                        "guest has multiple port 22 forwards".to_string(),
                    ));
                }
                port = Some(fields[3].parse().map_err(|e| {
                    Error::Setup(format!("bad forwarded port '{}': {e}", fields[3]))
                })?);
            }
        }
        let port =
            port.ok_or_else(|| Error::Setup("no host forward for guest port 22".to_string()))?;
        tracing::debug!(port, "guest ssh forwarded");
        self.shell = Some((self.shell_factory)(port));
        self.ssh_port = Some(port);
        Ok(())
    }

    /// Next free disk bus slot. Monotonic for the lifetime of the live
    /// instance; slots are never reused mid-run.
    pub fn next_disk_bus(&self) -> String {
        format!("s{}", self.attached.len())
    }

    fn attach_disk_commands(&mut self, disk: &DiskAttachment) -> Result<()> {
        if let Some((cmd, args)) = disk.connect_command() {
            self.qmp_command(cmd, Some(args))?;
        }
        if let Some(iothread_id) = disk.iothread_id() {
            self.add_iothread(&iothread_id)?;
        }
        let bus = self.next_disk_bus();
        let args = disk.hotplug_args(&bus, self.sizing.cpu_count, self.version_major());
        self.qmp_command("device_add", Some(args))?;
        self.attached.push(disk.clone());
        Ok(())
    }

    /// Hot-plug a disk into the running instance and register it for future
    /// starts.
    ///
    /// Not transactional: a failure after the backend attach leaves the VM
    /// partially configured; inspect with [`check`](Self::check) and decide
    /// at the scenario level.
    pub fn add_disk(&mut self, disk: DiskAttachment) -> Result<()> {
        self.ensure_state(&[VmState::Running, VmState::Paused])?;
        self.attach_disk_commands(&disk)?;
        self.registered.push(disk);
        Ok(())
    }

    fn add_iothread(&mut self, iothread_id: &str) -> Result<()> {
        self.qmp_command(
            "object-add",
            Some(json!({ "id": iothread_id, "qom-type": "iothread" })),
        )?;
        Ok(())
    }

    /// Hot-plug the reserved memory headroom as a DIMM.
    pub fn hotplug_memory(&mut self) -> Result<()> {
        self.ensure_state(&[VmState::Running, VmState::Paused])?;
        let mem_id = "ram-hot-plug";
        self.qmp_command(
            "object-add",
            Some(json!({
                "id": mem_id,
                "qom-type": "memory-backend-memfd",
                "props": {
                    "size": (self.sizing.hotplug_mem_gb as u64) << 30,
                    "policy": "bind",
                    "host-nodes": [0],
                },
            })),
        )?;
        self.qmp_command(
            "device_add",
            Some(json!({
                "driver": "pc-dimm",
                "id": "dimm10",
                "memdev": mem_id,
            })),
        )?;
        Ok(())
    }

    /// Issue a hardware reset.
    pub fn reboot(&mut self) -> Result<()> {
        self.qmp_command("system_reset", None)?;
        Ok(())
    }

    /// Pause guest execution. The process keeps running.
    pub fn pause(&mut self) -> Result<()> {
        self.ensure_state(&[VmState::Running])?;
        self.qmp_command("stop", None)?;
        self.state = VmState::Paused;
        Ok(())
    }

    /// Resume a paused guest.
    pub fn resume(&mut self) -> Result<()> {
        self.ensure_state(&[VmState::Paused])?;
        self.qmp_command("cont", None)?;
        self.state = VmState::Running;
        Ok(())
    }

    /// Health check. Fails with [`Error::ProcessNotRunning`] if no process
    /// was started, [`Error::ProcessExited`] if it has exited; optionally
    /// also verifies guest reachability.
    pub fn check(&mut self, check_guest: bool) -> Result<()> {
        let proc = self.process.as_mut().ok_or(Error::ProcessNotRunning)?;
        if let Some(code) = proc.try_wait() {
            return Err(Error::ProcessExited(code));
        }
        if check_guest {
            self.wait_guest_boot()?;
        }
        Ok(())
    }

    /// Stop the VM process: SIGINT (soft) or SIGKILL (hard), then wait for
    /// exit and clear connection, port, and disk state.
    pub fn kill(&mut self, hard: bool) -> Result<()> {
        self.check(false)?;
        let proc = self.process.as_mut().ok_or(Error::ProcessNotRunning)?;
        if hard {
            proc.kill();
        } else {
            proc.interrupt();
        }
        self.wait_exit(DEFAULT_EXIT_TIMEOUT)?;
        self.state = VmState::Dead;
        Ok(())
    }

    /// Graceful shutdown, either by asking the guest OS to power off or via
    /// the protocol-level power-down command.
    pub fn shutdown(&mut self, via_guest: bool) -> Result<()> {
        self.check(via_guest)?;
        let mut timeout = Duration::from_secs(60);
        if via_guest {
            // The connection may drop mid-poweroff; the exit wait below is
            // the authoritative check.
            match self.config.os_type {
                OsType::Windows => {
                    timeout = Duration::from_secs(180);
                    let _ = self.guest_exec(&["shutdown", "/s", "/f", "/t", "0"]);
                }
                OsType::Linux => {
                    let _ = self.guest_exec(&["shutdown", "--poweroff", "now"]);
                }
            }
        } else {
            self.qmp_command("system_powerdown", None)?;
        }
        self.wait_exit(timeout)?;
        self.state = VmState::Stopped;
        Ok(())
    }

    fn wait_exit(&mut self, timeout: Duration) -> Result<i32> {
        let code = self
            .process
            .as_mut()
            .ok_or(Error::ProcessNotRunning)?
            .wait_timeout(timeout)?;
        let _ = fs::remove_file(&self.pid_file);
        self.qmp = None;
        self.shell = None;
        self.ssh_port = None;
        self.attached.clear();
        self.net_count = 0;
        self.migration = None;
        Ok(code)
    }

    /// Run a command in the guest over the configured shell.
    pub fn guest_exec(&mut self, argv: &[&str]) -> Result<ExecOutput> {
        self.wait_guest_boot()?;
        let shell = self.shell.as_deref().ok_or(Error::ProcessNotRunning)?;
        shell.exec(argv, DEFAULT_EXEC_TIMEOUT)
    }

    /// Poll the guest until it answers or the boot deadline elapses.
    pub fn wait_guest_boot(&mut self) -> Result<()> {
        let shell = self.shell.as_deref().ok_or(Error::ProcessNotRunning)?;
        let probe: &[&str] = match self.config.os_type {
            OsType::Linux => &["true"],
            OsType::Windows => &["echo."],
        };
        guest::wait_reachable(
            shell,
            probe,
            self.config.boot_timeout,
            self.config.probe_interval,
        )
    }

    fn post_boot_setup(&mut self) -> Result<()> {
        let shell = self.shell.as_deref().ok_or(Error::ProcessNotRunning)?;
        for disk in &self.registered {
            disk.setup_guest(shell)?;
        }
        Ok(())
    }

    /// Stream the VM state into the work directory's migration file.
    ///
    /// Destructive on success: the source is not resumable and gets a soft
    /// kill. A migratability pre-check rejects attachments whose backend
    /// cannot migrate before any state change or protocol traffic.
    pub fn save_to_file(&mut self) -> Result<()> {
        self.ensure_state(&[VmState::Running, VmState::Paused])?;
        if let Some(disk) = self.attached.iter().find(|d| !d.caps().migratable) {
            return Err(Error::Migration(format!(
                "disk {} has a non-migratable backend",
                disk.id()
            )));
        }

        let prev = self.state;
        self.state = VmState::MigratingOut;
        match self.stream_out() {
            Ok(()) => {
                // Verify that a destination can load the stream before
                // declaring success; the source is done either way.
                self.kill(false)?;
                Ok(())
            }
            Err(e) => {
                self.state = prev;
                Err(e)
            }
        }
    }

    fn stream_out(&mut self) -> Result<()> {
        let session = self
            .migration
            .clone()
            .ok_or_else(|| Error::Migration("no negotiated session".to_string()))?;

        self.qmp_command(
            "trace-event-set-state",
            Some(json!({ "name": "migration_*", "enable": true })),
        )?;
        session.apply(self.qmp.as_mut().ok_or(Error::ProcessNotRunning)?)?;

        let uri = format!(
            "exec:dd if=/dev/stdin of={} bs=1M count=32768 iflag=fullblock",
            self.migrate_state.display()
        );
        self.qmp_command("migrate", Some(json!({ "uri": uri })))?;

        loop {
            let response = self.qmp_command("query-migrate", None)?;
            let status = MigrationStatus::parse(&response);
            tracing::info!(status = %status, "migration status");
            if !status.is_transient() {
                if status == MigrationStatus::Completed {
                    return Ok(());
                }
                return Err(Error::Migration(status.to_string()));
            }
            std::thread::sleep(STATUS_POLL_INTERVAL);
        }
    }

    /// Start a fresh process awaiting incoming state and load the saved
    /// migration stream into it.
    pub fn load_from_file(&mut self) -> Result<()> {
        self.launch(true)?;
        self.stream_in()?;
        self.state = VmState::Running;
        Ok(())
    }

    fn stream_in(&mut self) -> Result<()> {
        let session = self
            .migration
            .clone()
            .ok_or_else(|| Error::Migration("no negotiated session".to_string()))?;

        self.qmp_command(
            "trace-event-set-state",
            Some(json!({ "name": "migration_*", "enable": true })),
        )?;
        session.apply(self.qmp.as_mut().ok_or(Error::ProcessNotRunning)?)?;

        let uri = format!("exec:cat {}", self.migrate_state.display());
        self.qmp_command("migrate-incoming", Some(json!({ "uri": uri })))?;

        loop {
            let response = self.qmp_command("query-status", None)?;
            if response.get("status").and_then(Value::as_str) != Some("inmigrate") {
                break;
            }
            std::thread::sleep(STATUS_POLL_INTERVAL);
        }
        // Resume unconditionally once out of inmigrate.
        self.qmp_command("cont", None)?;
        Ok(())
    }

    /// Save to file, then load into a fresh process of this instance.
    pub fn migrate(&mut self) -> Result<()> {
        self.save_to_file()?;
        self.load_from_file()
    }

    fn qmp_command(&mut self, name: &str, arguments: Option<Value>) -> Result<Value> {
        let span = self.span.clone();
        let _guard = span.enter();
        self.qmp
            .as_mut()
            .ok_or(Error::ProcessNotRunning)?
            .command(name, arguments)
    }

    fn ensure_state(&self, allowed: &[VmState]) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(Error::InvalidState {
            expected: allowed
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(" or "),
            actual: self.state.to_string(),
        })
    }

    fn cpu_opts(&self) -> String {
        let mut opts =
            "Haswell-noTSX,l3-cache=on,+md-clear,+spec-ctrl,+ssbd,+stibp,+vmx".to_string();
        if self.config.os_type == OsType::Windows {
            opts.push_str(",hv_relaxed,hv_spinlocks=0x1fff,hv_vapic,hv_time,hv_crash");
            opts.push_str(",hv_reset,hv_vpindex,hv_runtime,hv_synic,hv_stimer");
        }
        opts
    }

    /// The deterministic launch command line: fixed PCI topology, sized CPU
    /// and memory, QMP and VNC sockets, serial and BIOS log chardevs.
    fn build_args(&self, incoming: bool) -> Vec<String> {
        let cpus = self.sizing.cpu_count;
        let mem = self.sizing.mem_size_gb;

        let mut args: Vec<String> = vec![
            "-uuid".into(),
            VM_UUID.into(),
            "-name".into(),
            format!("{},debug-threads=on", self.config.name),
            "-qmp".into(),
            format!("unix:{},server,nowait", self.qmp_sock.display()),
            "-msg".into(),
            "timestamp=on".into(),
            // Start stopped so devices can be attached before the guest runs.
            "-S".into(),
            "-M".into(),
            "q35,sata=false,usb=off,accel=kvm".into(),
            "-cpu".into(),
            self.cpu_opts(),
            "-smp".into(),
            format!("{},cores={},threads=2,sockets=1", cpus, cpus / 2),
            "-m".into(),
            format!(
                "size={}G,slots=2,maxmem={}G",
                mem,
                self.sizing.max_mem_gb()
            ),
            "-object".into(),
            format!(
                "memory-backend-memfd,id={MEM_ID},size={mem}G,policy=bind,host-nodes=0"
            ),
            "-numa".into(),
            format!("node,cpus=0-{},memdev={MEM_ID}", cpus - 1),
            "-vga".into(),
            "std".into(),
            "-device".into(),
            "usb-ehci".into(),
            "-device".into(),
            "usb-tablet".into(),
            "-nodefaults".into(),
        ];

        // Two PCIe expanders with eight root ports each: s0..s7 for disks,
        // s8..s15 for network devices.
        args.push("-device".into());
        args.push("pxb-pcie,bus_nr=128,bus=pcie.0,id=pcie.1,numa_node=0".into());
        for slot in 0..8 {
            args.push("-device".into());
            args.push(format!("pcie-root-port,id=s{slot},slot={slot},bus=pcie.1"));
        }
        args.push("-device".into());
        args.push("pxb-pcie,bus_nr=137,bus=pcie.0,id=pcie.2,numa_node=0".into());
        for slot in 8..16 {
            args.push("-device".into());
            args.push(format!("pcie-root-port,id=s{slot},slot={slot},bus=pcie.2"));
        }

        args.extend([
            "-vnc".into(),
            format!("unix:{}", self.vnc_sock.display()),
            "-chardev".into(),
            format!("file,path={},id=charserial0", self.serial_log.display()),
            "-device".into(),
            "isa-serial,chardev=charserial0,id=serial0".into(),
            "-chardev".into(),
            format!("file,path={},id=debugcon", self.bios_log.display()),
            "-device".into(),
            "isa-debugcon,iobase=0x402,chardev=debugcon".into(),
            "-boot".into(),
            "strict=on".into(),
            "-no-user-config".into(),
        ]);

        if incoming {
            args.extend(["-incoming".into(), "defer".into()]);
        }
        args
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // Guaranteed cleanup on every exit path.
        if let Some(proc) = self.process.as_mut() {
            if proc.is_running() {
                tracing::debug!(pid = proc.pid(), "killing VM process on drop");
                proc.kill();
                let _ = proc.wait_timeout(Duration::from_secs(5));
            }
        }
    }
}
