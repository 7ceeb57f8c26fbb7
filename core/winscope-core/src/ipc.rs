//! i3/Sway IPC transport.
//!
//! Every message is framed as `"i3-ipc"`, a u32 payload length and a u32
//! message type (both native endian), followed by a JSON payload. Event
//! messages use the same framing with the high bit of the type set.

use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ScopeError};
use crate::tree::RawNode;

const MAGIC: &[u8; 6] = b"i3-ipc";
const HEADER_LEN: usize = 14;
const MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

pub const MSG_RUN_COMMAND: u32 = 0;
pub const MSG_SUBSCRIBE: u32 = 2;
pub const MSG_GET_TREE: u32 = 4;

const EVENT_BIT: u32 = 0x8000_0000;
pub const EVENT_SHUTDOWN: u32 = EVENT_BIT | 6;
pub const EVENT_WINDOW: u32 = EVENT_BIT | 3;
pub const EVENT_TICK: u32 = EVENT_BIT | 7;

pub const SOCKET_ENV: &str = "WINSCOPE_WM_SOCKET";

/// Resolves the window manager socket from the environment.
pub fn socket_from_env() -> Option<PathBuf> {
    [SOCKET_ENV, "SWAYSOCK", "I3SOCK"]
        .iter()
        .find_map(|name| env::var(name).ok().filter(|value| !value.trim().is_empty()))
        .map(PathBuf::from)
}

/// Outcome of one command inside a RUN_COMMAND batch.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl CommandOutcome {
    /// The window manager reports a vanished criteria target this way.
    pub fn is_no_match(&self) -> bool {
        self.error
            .as_deref()
            .map(|error| {
                let lower = error.to_ascii_lowercase();
                lower.contains("no matching") || lower.contains("no window matches")
            })
            .unwrap_or(false)
    }
}

/// Window manager events that winscope reacts to.
#[derive(Debug, Clone)]
pub enum WmEvent {
    WindowNew(RawNode),
    WindowClose { window_id: i64 },
    Tick { payload: String },
    Shutdown,
    Other,
}

#[derive(Debug, Deserialize)]
struct RawWindowEvent {
    change: String,
    container: RawNode,
}

#[derive(Debug, Deserialize)]
struct RawTickEvent {
    #[serde(default)]
    first: bool,
    #[serde(default)]
    payload: String,
}

pub fn decode_event(message_type: u32, payload: &[u8]) -> Result<WmEvent> {
    match message_type {
        EVENT_WINDOW => {
            let event: RawWindowEvent = serde_json::from_slice(payload).map_err(|source| {
                ScopeError::Json {
                    context: "window event".to_string(),
                    source,
                }
            })?;
            Ok(match event.change.as_str() {
                "new" => WmEvent::WindowNew(event.container),
                "close" => WmEvent::WindowClose {
                    window_id: event.container.id,
                },
                _ => WmEvent::Other,
            })
        }
        EVENT_TICK => {
            let event: RawTickEvent =
                serde_json::from_slice(payload).map_err(|source| ScopeError::Json {
                    context: "tick event".to_string(),
                    source,
                })?;
            // The subscription handshake delivers a synthetic first tick.
            if event.first {
                return Ok(WmEvent::Other);
            }
            Ok(WmEvent::Tick {
                payload: event.payload,
            })
        }
        EVENT_SHUTDOWN => Ok(WmEvent::Shutdown),
        _ => Ok(WmEvent::Other),
    }
}

/// One connection to the window manager socket.
pub struct IpcConnection {
    stream: UnixStream,
}

impl IpcConnection {
    pub fn connect(path: &Path, timeout: Option<Duration>) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .map_err(|err| ScopeError::ipc(&format!("connect {}", path.display()), err))?;
        stream
            .set_read_timeout(timeout)
            .and_then(|_| stream.set_write_timeout(timeout))
            .map_err(|err| ScopeError::ipc("configure socket", err))?;
        Ok(Self { stream })
    }

    pub fn send(&mut self, message_type: u32, payload: &str) -> Result<()> {
        let frame = encode_frame(message_type, payload.as_bytes())?;
        self.stream
            .write_all(&frame)
            .and_then(|_| self.stream.flush())
            .map_err(|err| ScopeError::ipc("write message", err))
    }

    pub fn receive(&mut self) -> Result<(u32, Vec<u8>)> {
        let mut header = [0u8; HEADER_LEN];
        self.stream
            .read_exact(&mut header)
            .map_err(|err| ScopeError::ipc("read header", err))?;
        let (length, message_type) = decode_header(&header)?;
        let mut payload = vec![0u8; length];
        self.stream
            .read_exact(&mut payload)
            .map_err(|err| ScopeError::ipc("read payload", err))?;
        Ok((message_type, payload))
    }

    /// Sends a request and waits for its reply, skipping any interleaved events.
    pub fn request(&mut self, message_type: u32, payload: &str) -> Result<Vec<u8>> {
        self.send(message_type, payload)?;
        loop {
            let (reply_type, body) = self.receive()?;
            if reply_type & EVENT_BIT != 0 {
                continue;
            }
            if reply_type != message_type {
                return Err(ScopeError::ipc(
                    "reply",
                    format!("expected type {} but got {}", message_type, reply_type),
                ));
            }
            return Ok(body);
        }
    }

    pub fn run_command(&mut self, command: &str) -> Result<Vec<CommandOutcome>> {
        let body = self.request(MSG_RUN_COMMAND, command)?;
        serde_json::from_slice(&body).map_err(|source| ScopeError::Json {
            context: "command reply".to_string(),
            source,
        })
    }

    pub fn get_tree(&mut self) -> Result<RawNode> {
        let body = self.request(MSG_GET_TREE, "")?;
        serde_json::from_slice(&body).map_err(|source| ScopeError::Json {
            context: "tree reply".to_string(),
            source,
        })
    }

    /// Turns this connection into an event stream.
    pub fn subscribe(mut self, events: &[&str]) -> Result<EventStream> {
        let payload = serde_json::to_string(events).map_err(|source| ScopeError::Json {
            context: "subscribe payload".to_string(),
            source,
        })?;
        let body = self.request(MSG_SUBSCRIBE, &payload)?;
        let reply: Value = serde_json::from_slice(&body).map_err(|source| ScopeError::Json {
            context: "subscribe reply".to_string(),
            source,
        })?;
        if reply.get("success").and_then(Value::as_bool) != Some(true) {
            return Err(ScopeError::ipc("subscribe", "window manager refused subscription"));
        }
        // Events may be sparse; block until the next one arrives.
        self.stream
            .set_read_timeout(None)
            .map_err(|err| ScopeError::ipc("configure socket", err))?;
        Ok(EventStream { connection: self })
    }
}

/// Long-lived read side of a subscription.
pub struct EventStream {
    connection: IpcConnection,
}

impl EventStream {
    pub fn next_event(&mut self) -> Result<WmEvent> {
        loop {
            let (message_type, payload) = self.connection.receive()?;
            if message_type & EVENT_BIT == 0 {
                continue;
            }
            return decode_event(message_type, &payload);
        }
    }
}

pub fn encode_frame(message_type: u32, payload: &[u8]) -> Result<Vec<u8>> {
    let length = u32::try_from(payload.len())
        .map_err(|_| ScopeError::validation("payload", "message too large"))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(MAGIC);
    frame.extend_from_slice(&length.to_ne_bytes());
    frame.extend_from_slice(&message_type.to_ne_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(usize, u32)> {
    if &header[..6] != MAGIC {
        return Err(ScopeError::ipc("read header", "bad magic"));
    }
    let length = u32::from_ne_bytes([header[6], header[7], header[8], header[9]]) as usize;
    let message_type = u32::from_ne_bytes([header[10], header[11], header[12], header[13]]);
    if length > MAX_PAYLOAD_BYTES {
        return Err(ScopeError::ipc(
            "read header",
            format!("payload of {} bytes exceeds limit", length),
        ));
    }
    Ok((length, message_type))
}
