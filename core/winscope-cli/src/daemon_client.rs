//! Client for the winscope daemon socket.
//!
//! One request per connection. Only a failed connect is retried: a request
//! that reached the daemon may already have changed window state.

use chrono::Utc;
use rand::RngCore;
use serde_json::Value;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use winscope_daemon_protocol::{Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION};

const CONNECT_RETRY_DELAY_MS: u64 = 50;
const WRITE_TIMEOUT_MS: u64 = 600;
/// Layout restores wait for applications to start, so the default is generous.
const DEFAULT_READ_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Daemon socket path unavailable: {0}")]
    Socket(String),

    #[error("Failed to connect to daemon at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Daemon I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for daemon response")]
    Timeout,

    #[error("Invalid daemon response: {0}")]
    InvalidResponse(String),

    #[error("{code}: {message}")]
    Daemon { code: String, message: String },
}

pub struct DaemonClient {
    socket: PathBuf,
    read_timeout: Duration,
}

impl DaemonClient {
    /// Client for the socket named by `WINSCOPE_DAEMON_SOCKET` or the default.
    pub fn from_env() -> Result<Self, ClientError> {
        let socket = winscope_core::client_socket_path()
            .map_err(|err| ClientError::Socket(err.to_string()))?;
        Ok(Self::new(socket))
    }

    pub fn new(socket: PathBuf) -> Self {
        Self {
            socket,
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Sends one request and returns the response payload.
    pub fn call(&self, method: Method, params: Option<Value>) -> Result<Value, ClientError> {
        let request = Request {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: Some(make_request_id()),
            params,
        };
        tracing::debug!(method = ?method, id = ?request.id, "Sending daemon request");
        let response = self.send(&request)?;
        into_data(response)
    }

    fn connect(&self) -> Result<UnixStream, ClientError> {
        match UnixStream::connect(&self.socket) {
            Ok(stream) => Ok(stream),
            Err(err) => {
                tracing::warn!(error = %err, path = %self.socket.display(), "Daemon connect failed; retrying once");
                thread::sleep(Duration::from_millis(CONNECT_RETRY_DELAY_MS));
                UnixStream::connect(&self.socket).map_err(|source| ClientError::Connect {
                    path: self.socket.clone(),
                    source,
                })
            }
        }
    }

    fn send(&self, request: &Request) -> Result<Response, ClientError> {
        let mut stream = self.connect()?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)))?;

        serde_json::to_writer(&mut stream, request)
            .map_err(|err| ClientError::InvalidResponse(format!("failed to encode request: {}", err)))?;
        stream.write_all(b"\n")?;
        stream.flush()?;

        read_response(&mut stream)
    }
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ClientError::InvalidResponse(
                        "response exceeded maximum size".to_string(),
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ClientError::Timeout);
            }
            Err(err) => return Err(ClientError::Io(err)),
        }
    }

    let end = buffer
        .iter()
        .position(|b| *b == b'\n')
        .unwrap_or(buffer.len());
    if buffer[..end].is_empty() {
        return Err(ClientError::InvalidResponse("response was empty".to_string()));
    }

    serde_json::from_slice(&buffer[..end])
        .map_err(|err| ClientError::InvalidResponse(format!("not valid JSON: {}", err)))
}

fn into_data(response: Response) -> Result<Value, ClientError> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    let (code, message) = response
        .error
        .map(|err| (err.code, err.message))
        .unwrap_or_else(|| ("unknown".to_string(), "daemon returned no error detail".to_string()));
    Err(ClientError::Daemon { code, message })
}

fn make_request_id() -> String {
    let suffix = rand::thread_rng().next_u64();
    format!(
        "cli-{}-{}-{:x}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::net::UnixListener;
    use std::thread::JoinHandle;

    fn read_request(stream: &mut UnixStream) -> Option<Request> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if buffer.contains(&b'\n') {
                        break;
                    }
                }
                Err(_) => return None,
            }
        }
        let end = buffer.iter().position(|b| *b == b'\n')?;
        serde_json::from_slice(&buffer[..end]).ok()
    }

    /// Accepts one connection, records the request and answers with `response`.
    fn serve_once(listener: UnixListener, response: Option<Response>) -> JoinHandle<Option<Request>> {
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().ok()?;
            let request = read_request(&mut stream);
            match response {
                Some(response) => {
                    let mut payload = serde_json::to_vec(&response).ok()?;
                    payload.push(b'\n');
                    let _ = stream.write_all(&payload);
                }
                None => thread::sleep(Duration::from_millis(500)),
            }
            request
        })
    }

    #[test]
    fn call_returns_payload_and_sends_versioned_request() {
        let dir = tempfile::tempdir().expect("temp dir");
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).expect("bind");
        let server = serve_once(listener, Some(Response::ok(None, json!({"project": "alpha"}))));

        let data = DaemonClient::new(socket)
            .call(Method::GetActiveProject, None)
            .expect("call");
        assert_eq!(data, json!({"project": "alpha"}));

        let request = server.join().expect("server").expect("request");
        assert_eq!(request.protocol_version, PROTOCOL_VERSION);
        assert_eq!(request.method, Method::GetActiveProject);
        assert!(request.id.as_deref().is_some_and(|id| id.starts_with("cli-")));
    }

    #[test]
    fn daemon_error_keeps_code() {
        let dir = tempfile::tempdir().expect("temp dir");
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).expect("bind");
        let server = serve_once(
            listener,
            Some(Response::error(None, "ipc_failure", "window manager unreachable")),
        );

        let err = DaemonClient::new(socket)
            .call(Method::SwitchProject, Some(json!({"project": "alpha"})))
            .unwrap_err();
        match err {
            ClientError::Daemon { code, .. } => assert_eq!(code, "ipc_failure"),
            other => panic!("unexpected error: {other}"),
        }
        server.join().expect("server");
    }

    #[test]
    fn missing_socket_is_connect_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = DaemonClient::new(dir.path().join("absent.sock"))
            .call(Method::GetHealth, None)
            .unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }

    #[test]
    fn silent_daemon_times_out() {
        let dir = tempfile::tempdir().expect("temp dir");
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).expect("bind");
        let server = serve_once(listener, None);

        let err = DaemonClient::new(socket)
            .with_read_timeout(Duration::from_millis(100))
            .call(Method::GetHealth, None)
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        server.join().expect("server");
    }
}
