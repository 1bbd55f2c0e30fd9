//! QMP client for the VM control socket.
//!
//! This module provides a blocking client for the QEMU Machine Protocol:
//! newline-delimited JSON over a Unix stream socket, with a one-time
//! greeting, synchronous command/response exchange, and asynchronous
//! events queued on the side.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Read timeout on the connected socket.
pub const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval between connection attempts while waiting for the socket file.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// An asynchronous QMP event.
#[derive(Debug, Clone)]
pub struct QmpEvent {
    /// Event name, e.g. "MIGRATION".
    pub name: String,
    /// Peer-side timestamp, passed through unparsed.
    pub timestamp: Value,
    /// Event payload.
    pub data: Value,
}

/// A decoded QMP frame, classified by its distinguishing top-level key.
#[derive(Debug, Clone)]
enum QmpFrame {
    /// The one-time `{"QMP": {...}}` greeting.
    Greeting(Value),
    /// A `{"return": ...}` command response.
    Return(Value),
    /// An `{"error": {"class": ..., "desc": ...}}` command failure.
    Error { class: String, desc: String },
    /// An `{"event": ...}` notification.
    Event(QmpEvent),
}

fn classify(value: Value) -> Result<QmpFrame> {
    let Value::Object(mut map) = value else {
        return Err(Error::UnexpectedMessage(format!(
            "non-object frame: {value}"
        )));
    };

    if let Some(greeting) = map.remove("QMP") {
        return Ok(QmpFrame::Greeting(greeting));
    }
    if let Some(ret) = map.remove("return") {
        return Ok(QmpFrame::Return(ret));
    }
    if let Some(err) = map.remove("error") {
        let class = err
            .get("class")
            .and_then(Value::as_str)
            .unwrap_or("GenericError")
            .to_string();
        let desc = err
            .get("desc")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Ok(QmpFrame::Error { class, desc });
    }
    if let Some(name) = map.get("event").and_then(Value::as_str) {
        let name = name.to_string();
        let timestamp = map.remove("timestamp").unwrap_or(Value::Null);
        let data = map.remove("data").unwrap_or(Value::Null);
        return Ok(QmpFrame::Event(QmpEvent {
            name,
            timestamp,
            data,
        }));
    }

    Err(Error::UnexpectedMessage(format!(
        "unknown frame type: {}",
        Value::Object(map)
    )))
}

/// Blocking QMP client owning a single connection to the control socket.
///
/// Commands are strictly synchronous: one request in flight at a time,
/// enforced by `&mut self`. To share a client across threads, wrap it in a
/// `Mutex` — interleaved callers then serialize instead of corrupting
/// response correlation.
#[derive(Debug)]
pub struct QmpClient {
    stream: UnixStream,
    events: VecDeque<QmpEvent>,
    greeting: Option<Value>,
}

impl QmpClient {
    /// Connect to the QMP socket, retrying until `deadline` elapses.
    ///
    /// The VM creates its socket asynchronously after launch, so early
    /// attempts may fail with `NotFound` or `ConnectionRefused`; those are
    /// retried at a fixed interval. Any other connect error propagates
    /// immediately. On success the greeting is consumed and the
    /// `qmp_capabilities` handshake is performed before returning.
    pub fn connect(path: &Path, deadline: Duration) -> Result<Self> {
        let start = Instant::now();
        let stream = loop {
            match UnixStream::connect(path) {
                Ok(s) => break s,
                Err(e) => {
                    if !matches!(
                        e.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                    ) {
                        return Err(e.into());
                    }
                    if start.elapsed() >= deadline {
                        tracing::debug!(path = %path.display(), "QMP connect timed out");
                        return Err(Error::ConnectionTimeout {
                            path: path.to_path_buf(),
                            waited: start.elapsed(),
                        });
                    }
                    tracing::debug!(path = %path.display(), error = %e, "QMP connect failed, retrying");
                    std::thread::sleep(CONNECT_RETRY_INTERVAL);
                }
            }
        };
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        let mut client = Self {
            stream,
            events: VecDeque::new(),
            greeting: None,
        };

        // The greeting arrives before the handshake response and is consumed
        // by the dispatch loop during this first command.
        client.command("qmp_capabilities", None)?;
        Ok(client)
    }

    /// The `{"QMP": {...}}` greeting payload, once received.
    pub fn greeting(&self) -> Option<&Value> {
        self.greeting.as_ref()
    }

    /// Issue a command and block until its response arrives.
    ///
    /// Returns the `return` payload. An error frame maps to
    /// [`Error::Protocol`]; event frames received while waiting are queued
    /// for [`wait_event`](Self::wait_event), never dropped.
    pub fn command(&mut self, name: &str, arguments: Option<Value>) -> Result<Value> {
        let mut cmd = json!({ "execute": name });
        if let Some(args) = arguments {
            cmd["arguments"] = args;
        }

        let mut line = serde_json::to_vec(&cmd)?;
        tracing::debug!(cmd = %String::from_utf8_lossy(&line), "QMP>");
        line.push(b'\n');
        self.stream.write_all(&line)?;

        loop {
            if let Some(result) = self.dispatch_frames(false)? {
                tracing::debug!(result = %result, "QMP<");
                return Ok(result);
            }
        }
    }

    /// Block until an event is available and return it.
    ///
    /// A response frame arriving while only events are expected is a fatal
    /// correlation violation.
    pub fn wait_event(&mut self) -> Result<QmpEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }
            self.dispatch_frames(true)?;
        }
    }

    /// Read one batch of frames and route them.
    ///
    /// Greetings are stored, events queued, error frames raised. Returns the
    /// payload of a response frame if one was present. A second response in
    /// the same batch, or any response when `events_only` is set, violates
    /// the single-flight invariant.
    fn dispatch_frames(&mut self, events_only: bool) -> Result<Option<Value>> {
        let mut result = None;
        for frame in self.recv_frames()? {
            match frame {
                QmpFrame::Greeting(greeting) => {
                    tracing::debug!(greeting = %greeting, "QMP greeting");
                    self.greeting = Some(greeting);
                }
                QmpFrame::Event(event) => self.events.push_back(event),
                QmpFrame::Error { class, desc } => return Err(Error::Protocol { class, desc }),
                QmpFrame::Return(value) => {
                    if result.is_some() || events_only {
                        return Err(Error::UnexpectedMessage(format!(
                            "unsolicited response: {value}"
                        )));
                    }
                    result = Some(value);
                }
            }
        }
        Ok(result)
    }

    /// Read complete newline-terminated messages off the socket.
    ///
    /// Bytes are accumulated until the buffer ends on a newline, then split
    /// on newlines and decoded line by line. A decode failure on any line
    /// aborts the whole read.
    fn recv_frames(&mut self) -> Result<Vec<QmpFrame>> {
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        while !data.ends_with(b"\n") {
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(Error::UnexpectedMessage(
                    "QMP connection closed by peer".to_string(),
                ));
            }
            data.extend_from_slice(&chunk[..n]);
        }

        let mut frames = Vec::new();
        for line in data.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_slice(line).map_err(|e| {
                tracing::error!(line = %String::from_utf8_lossy(line), error = %e, "failed to parse QMP message");
                e
            })?;
            frames.push(classify(value)?);
        }
        Ok(frames)
    }
}
