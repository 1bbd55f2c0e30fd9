//! Shared test support: a stub VM binary and a scripted QMP server.

#![allow(dead_code)]

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use vmharness::guest::{ExecOutput, GuestShell};
use vmharness::vm::{Vm, VmConfig};
use vmharness::Result;

/// Port the scripted server reports for the guest ssh forward.
pub const FORWARDED_SSH_PORT: u16 = 33445;

/// Honor RUST_LOG in test output. Safe to call from every test.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Write an executable stub that answers the probe flags and otherwise
/// sleeps in place of a real VM process, so signals and exit codes behave
/// like the real thing.
pub fn write_stub_binary(dir: &Path) -> PathBuf {
    let path = dir.join("qemu-stub");
    let script = "#!/bin/sh\n\
case \"$1\" in\n\
-version) echo \"QEMU emulator version 6.2.0\"; exit 0 ;;\n\
-device)\n\
    printf 'name \"virtio-blk-pci\", bus PCI\\n'\n\
    printf 'name \"vhost-user-blk-pci\", bus PCI\\n'\n\
    printf 'name \"vhost-user-fs-pci\", bus PCI\\n'\n\
    printf 'name \"virtio-net-pci\", bus PCI\\n'\n\
    exit 0 ;;\n\
*) exec sleep 600 ;;\n\
esac\n";
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Per-command override. Returns the frames to send, or `None` for the
/// default response.
pub type QmpHandler = dyn FnMut(&str, &Value) -> Option<Vec<Value>> + Send;

/// A scripted QMP server on a Unix socket.
///
/// Sends the greeting on accept, answers each command, and records every
/// command with its arguments for ordering assertions. Accepts sequential
/// connections so a VM can be restarted against the same socket.
pub struct FakeQmpServer {
    commands: Arc<Mutex<Vec<(String, Value)>>>,
}

impl FakeQmpServer {
    pub fn spawn(socket: &Path) -> Self {
        Self::spawn_with(socket, |_, _| None)
    }

    pub fn spawn_with(
        socket: &Path,
        handler: impl FnMut(&str, &Value) -> Option<Vec<Value>> + Send + 'static,
    ) -> Self {
        if let Some(parent) = socket.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let _ = fs::remove_file(socket);
        let listener = UnixListener::bind(socket).unwrap();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&commands);
        let mut handler = handler;
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let _ = serve(stream, &recorded, &mut handler);
            }
        });
        Self { commands }
    }

    /// All command names received so far, in arrival order.
    pub fn command_names(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Arguments of every received command with the given name.
    pub fn commands_named(&self, name: &str) -> Vec<Value> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

fn serve<F>(
    mut stream: UnixStream,
    recorded: &Arc<Mutex<Vec<(String, Value)>>>,
    handler: &mut F,
) -> std::io::Result<()>
where
    F: FnMut(&str, &Value) -> Option<Vec<Value>>,
{
    stream.write_all(
        concat!(
            r#"{"QMP": {"version": {"qemu": {"major": 6, "minor": 2, "micro": 0}}, "capabilities": []}}"#,
            "\n"
        )
        .as_bytes(),
    )?;

    let reader = BufReader::new(stream.try_clone()?);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: Value = serde_json::from_str(&line).unwrap();
        let name = request["execute"].as_str().unwrap_or_default().to_string();
        let args = request.get("arguments").cloned().unwrap_or(Value::Null);
        recorded.lock().unwrap().push((name.clone(), args.clone()));

        let frames = handler(&name, &args).unwrap_or_else(|| vec![default_response(&name)]);
        for frame in frames {
            let mut bytes = serde_json::to_vec(&frame).unwrap();
            bytes.push(b'\n');
            stream.write_all(&bytes)?;
        }
    }
    Ok(())
}

/// Canned responses matching a cooperative peer.
pub fn default_response(name: &str) -> Value {
    match name {
        "human-monitor-command" => json!({
            "return": format!(
                "VLAN 0 (netdev0):\r\n  \
                 Protocol[State]  FD  Source Address  Port  Dest. Address  Port  RcvBufSize  SndBufSize\r\n  \
                 TCP[HOST_FORWARD]  13  *  {FORWARDED_SSH_PORT}  10.0.2.15  22  0  0\r\n"
            )
        }),
        "query-migrate-capabilities" => json!({
            "return": [
                { "capability": "events", "state": false },
                { "capability": "auto-converge", "state": false },
                { "capability": "validate-uuid", "state": false },
            ]
        }),
        "query-migrate" => json!({ "return": { "status": "completed" } }),
        "query-status" => json!({ "return": { "status": "running" } }),
        _ => json!({ "return": {} }),
    }
}

/// Guest shell that answers every command immediately with success.
pub struct OkShell;

impl GuestShell for OkShell {
    fn exec(&self, _argv: &[&str], _timeout: Duration) -> Result<ExecOutput> {
        Ok(ExecOutput {
            code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// Guest shell that never connects.
pub struct UnreachableShell;

impl GuestShell for UnreachableShell {
    fn exec(&self, _argv: &[&str], _timeout: Duration) -> Result<ExecOutput> {
        Ok(ExecOutput {
            code: 255,
            stdout: String::new(),
            stderr: "Connection refused".to_string(),
        })
    }
}

/// A VM wired to the stub binary, a scripted server, and an always-up guest.
pub fn test_vm(dir: &Path) -> (Vm, FakeQmpServer) {
    test_vm_with(dir, |_, _| None)
}

pub fn test_vm_with(
    dir: &Path,
    handler: impl FnMut(&str, &Value) -> Option<Vec<Value>> + Send + 'static,
) -> (Vm, FakeQmpServer) {
    init_logging();
    let binary = write_stub_binary(dir);
    let work = dir.join("vm");
    let server = FakeQmpServer::spawn_with(&work.join("qmp.sock"), handler);

    let mut config = VmConfig::new(binary, &work, dir.join("id_rsa"));
    config.boot_timeout = Duration::from_secs(2);
    config.probe_interval = Duration::from_millis(20);
    config.qmp_connect_timeout = Duration::from_secs(10);

    let mut vm = Vm::new(config).unwrap();
    vm.set_shell_factory(Box::new(|_port| Box::new(OkShell)));
    (vm, server)
}
