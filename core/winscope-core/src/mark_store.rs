//! Mark Store Adapter: marks and tree mutations over the window manager IPC.
//!
//! Every operation is a single logical round-trip. A vanished window is
//! reported as [`ScopeError::NotFound`] and is expected; any other channel
//! failure drops the connection, backs off briefly and retries once before
//! surfacing as [`ScopeError::Ipc`].

use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, ScopeError};
use crate::ipc::{CommandOutcome, IpcConnection};
use crate::marks::{parse_marks, StructuredMark};
use crate::tree::{flatten_tree, Geometry, WindowTreeSnapshot};

pub trait MarkStore {
    fn read_marks(&mut self, window_id: i64) -> Result<Vec<StructuredMark>>;
    fn apply_marks(&mut self, window_id: i64, marks: &[StructuredMark]) -> Result<()>;
    /// Removes every mark in `namespace` and returns how many were removed.
    fn remove_marks(&mut self, window_id: i64, namespace: &str) -> Result<usize>;
    fn query_tree(&mut self) -> Result<WindowTreeSnapshot>;

    fn move_to_scratchpad(&mut self, window_id: i64) -> Result<()>;
    /// Brings a hidden window back to `workspace`, tiled unless `floating`.
    fn restore_from_scratchpad(&mut self, window_id: i64, workspace: i32, floating: bool) -> Result<()>;
    /// Shows the scratchpad window carrying `mark` (floating, centered).
    fn show_marked_scratchpad(&mut self, mark: &StructuredMark) -> Result<()>;
    fn hide_marked(&mut self, mark: &StructuredMark) -> Result<()>;

    fn move_to_workspace(&mut self, window_id: i64, workspace: i32) -> Result<()>;
    fn set_geometry(&mut self, window_id: i64, geometry: &Geometry) -> Result<()>;
    fn float_centered(&mut self, window_id: i64, width_ppt: u8, height_ppt: u8) -> Result<()>;
    fn close_window(&mut self, window_id: i64) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct IpcSettings {
    pub socket_path: Option<PathBuf>,
    pub timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// [`MarkStore`] backed by an i3/Sway IPC socket.
///
/// The connection is opened lazily and re-opened after any failure, so a
/// window manager restart only costs the trigger that observed it.
pub struct SwayMarkStore {
    settings: IpcSettings,
    connection: Option<IpcConnection>,
}

impl SwayMarkStore {
    pub fn new(settings: IpcSettings) -> Self {
        Self {
            settings,
            connection: None,
        }
    }

    fn socket_path(&self) -> Result<PathBuf> {
        self.settings
            .socket_path
            .clone()
            .or_else(crate::ipc::socket_from_env)
            .ok_or_else(|| ScopeError::ipc("resolve socket", "no window manager socket configured"))
    }

    fn with_connection<T>(
        &mut self,
        context: &str,
        mut op: impl FnMut(&mut IpcConnection) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.connection_mut().and_then(|connection| op(connection));
            match result {
                Err(err) if err.is_transport() => {
                    self.connection = None;
                    if attempt >= 2 {
                        return Err(err);
                    }
                    warn!(context, error = %err, "IPC call failed; retrying once");
                    thread::sleep(self.settings.retry_backoff);
                }
                other => return other,
            }
        }
    }

    fn connection_mut(&mut self) -> Result<&mut IpcConnection> {
        if self.connection.is_none() {
            let path = self.socket_path()?;
            let connection = IpcConnection::connect(&path, Some(self.settings.timeout))?;
            debug!(path = %path.display(), "Connected to window manager");
            self.connection = Some(connection);
        }
        self.connection
            .as_mut()
            .ok_or_else(|| ScopeError::ipc("connect", "connection unavailable"))
    }

    /// Runs a command batch that targets one window (or one mark).
    fn run_targeted(&mut self, target: &str, command: &str) -> Result<()> {
        let outcomes = self.with_connection("run_command", |connection| {
            connection.run_command(command)
        })?;
        check_outcomes(target, command, &outcomes)
    }
}

/// A scratchpad window is floating by definition; only windows that were
/// tiled before hiding get `floating disable`.
fn restore_command(window_id: i64, workspace: i32, floating: bool) -> String {
    let target = con(window_id);
    let mut command = format!("{} move container to workspace number {}", target, workspace);
    if !floating {
        command.push_str(&format!("; {} floating disable", target));
    }
    command
}

fn check_outcomes(target: &str, command: &str, outcomes: &[CommandOutcome]) -> Result<()> {
    if outcomes.is_empty() {
        return Err(ScopeError::CommandRejected {
            command: command.to_string(),
            details: "no outcome returned".to_string(),
        });
    }
    if let Some(failed) = outcomes.iter().find(|outcome| !outcome.success) {
        if failed.is_no_match() {
            return Err(ScopeError::NotFound(target.to_string()));
        }
        return Err(ScopeError::CommandRejected {
            command: command.to_string(),
            details: failed.error.clone().unwrap_or_default(),
        });
    }
    Ok(())
}

fn con(window_id: i64) -> String {
    format!("[con_id={}]", window_id)
}

fn con_mark(mark: &StructuredMark) -> String {
    format!("[con_mark=\"^{}$\"]", regex::escape(&mark.to_string()))
}

impl MarkStore for SwayMarkStore {
    fn read_marks(&mut self, window_id: i64) -> Result<Vec<StructuredMark>> {
        let tree = self.query_tree()?;
        let window = tree
            .find(window_id)
            .ok_or_else(|| ScopeError::NotFound(format!("window {}", window_id)))?;
        Ok(parse_marks(&window.marks))
    }

    fn apply_marks(&mut self, window_id: i64, marks: &[StructuredMark]) -> Result<()> {
        if marks.is_empty() {
            return Ok(());
        }
        let command = marks
            .iter()
            .map(|mark| format!("{} mark --add \"{}\"", con(window_id), mark))
            .collect::<Vec<_>>()
            .join("; ");
        self.run_targeted(&format!("window {}", window_id), &command)
    }

    fn remove_marks(&mut self, window_id: i64, namespace: &str) -> Result<usize> {
        let owned: Vec<StructuredMark> = self
            .read_marks(window_id)?
            .into_iter()
            .filter(|mark| mark.in_namespace(namespace))
            .collect();
        if owned.is_empty() {
            return Ok(0);
        }
        let command = owned
            .iter()
            .map(|mark| format!("{} unmark \"{}\"", con(window_id), mark))
            .collect::<Vec<_>>()
            .join("; ");
        self.run_targeted(&format!("window {}", window_id), &command)?;
        Ok(owned.len())
    }

    fn query_tree(&mut self) -> Result<WindowTreeSnapshot> {
        let root = self.with_connection("get_tree", |connection| connection.get_tree())?;
        Ok(flatten_tree(&root))
    }

    fn move_to_scratchpad(&mut self, window_id: i64) -> Result<()> {
        self.run_targeted(
            &format!("window {}", window_id),
            &format!("{} move scratchpad", con(window_id)),
        )
    }

    fn restore_from_scratchpad(&mut self, window_id: i64, workspace: i32, floating: bool) -> Result<()> {
        self.run_targeted(
            &format!("window {}", window_id),
            &restore_command(window_id, workspace, floating),
        )
    }

    fn show_marked_scratchpad(&mut self, mark: &StructuredMark) -> Result<()> {
        let target = con_mark(mark);
        self.run_targeted(
            &mark.to_string(),
            &format!("{} scratchpad show; {} move position center", target, target),
        )
    }

    fn hide_marked(&mut self, mark: &StructuredMark) -> Result<()> {
        self.run_targeted(
            &mark.to_string(),
            &format!("{} move scratchpad", con_mark(mark)),
        )
    }

    fn move_to_workspace(&mut self, window_id: i64, workspace: i32) -> Result<()> {
        self.run_targeted(
            &format!("window {}", window_id),
            &format!(
                "{} move container to workspace number {}",
                con(window_id),
                workspace
            ),
        )
    }

    fn set_geometry(&mut self, window_id: i64, geometry: &Geometry) -> Result<()> {
        let target = con(window_id);
        self.run_targeted(
            &format!("window {}", window_id),
            &format!(
                "{t} floating enable; {t} resize set {w} px {h} px; {t} move position {x} px {y} px",
                t = target,
                w = geometry.width,
                h = geometry.height,
                x = geometry.x,
                y = geometry.y
            ),
        )
    }

    fn float_centered(&mut self, window_id: i64, width_ppt: u8, height_ppt: u8) -> Result<()> {
        let target = con(window_id);
        self.run_targeted(
            &format!("window {}", window_id),
            &format!(
                "{t} floating enable; {t} resize set width {w} ppt height {h} ppt; {t} move position center",
                t = target,
                w = width_ppt,
                h = height_ppt
            ),
        )
    }

    fn close_window(&mut self, window_id: i64) -> Result<()> {
        self.run_targeted(
            &format!("window {}", window_id),
            &format!("{} kill", con(window_id)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{decode_header, encode_frame, MSG_GET_TREE};
    use std::io::{Read, Write};
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::time::Instant;

    fn store_at(path: PathBuf, retry_backoff: Duration) -> SwayMarkStore {
        SwayMarkStore::new(IpcSettings {
            socket_path: Some(path),
            timeout: Duration::from_secs(2),
            retry_backoff,
        })
    }

    fn answer_get_tree(stream: &mut UnixStream) {
        let mut header = [0u8; 14];
        stream.read_exact(&mut header).expect("request header");
        let (length, message_type) = decode_header(&header).expect("header");
        assert_eq!(message_type, MSG_GET_TREE);
        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload).expect("request payload");

        let tree = br#"{"id":1,"type":"root","nodes":[{"id":2,"type":"workspace","num":1,"nodes":[{"id":3,"type":"con","pid":40,"app_id":"foot","nodes":[]}]}]}"#;
        let reply = encode_frame(MSG_GET_TREE, tree).expect("frame");
        stream.write_all(&reply).expect("reply");
    }

    #[test]
    fn dropped_connection_is_retried_once_after_backoff() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("wm.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        let server = thread::spawn(move || {
            let (first, _) = listener.accept().expect("first accept");
            drop(first);
            let (mut second, _) = listener.accept().expect("second accept");
            answer_get_tree(&mut second);
        });

        let backoff = Duration::from_millis(30);
        let mut store = store_at(path, backoff);
        let started = Instant::now();
        let tree = store.query_tree().expect("tree after retry");
        assert!(started.elapsed() >= backoff);
        assert_eq!(tree.windows.len(), 1);
        assert_eq!(tree.windows[0].pid, Some(40));
        server.join().expect("server");
    }

    #[test]
    fn second_failure_surfaces_without_a_third_attempt() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("wm.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        listener.set_nonblocking(true).expect("nonblocking");
        let server = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_millis(400);
            let mut accepted = 0;
            while Instant::now() < deadline {
                match listener.accept() {
                    Ok((stream, _)) => {
                        accepted += 1;
                        drop(stream);
                    }
                    Err(_) => thread::sleep(Duration::from_millis(1)),
                }
            }
            accepted
        });

        let mut store = store_at(path, Duration::from_millis(5));
        let err = store.query_tree().unwrap_err();
        assert_eq!(err.code(), "ipc_failure");
        assert_eq!(server.join().expect("server"), 2);
    }

    #[test]
    fn restore_keeps_floating_windows_floating() {
        assert_eq!(
            restore_command(7, 3, false),
            "[con_id=7] move container to workspace number 3; [con_id=7] floating disable"
        );
        assert_eq!(
            restore_command(7, 3, true),
            "[con_id=7] move container to workspace number 3"
        );
    }

    #[test]
    fn no_match_outcome_becomes_not_found() {
        let outcomes = vec![CommandOutcome {
            success: false,
            error: Some("No matching node.".to_string()),
        }];
        let err = check_outcomes("window 5", "[con_id=5] kill", &outcomes).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn other_failures_are_rejections() {
        let outcomes = vec![
            CommandOutcome {
                success: true,
                error: None,
            },
            CommandOutcome {
                success: false,
                error: Some("Unknown/invalid command".to_string()),
            },
        ];
        let err = check_outcomes("window 5", "bogus", &outcomes).unwrap_err();
        assert_eq!(err.code(), "command_rejected");
    }

    #[test]
    fn mark_criteria_are_anchored_and_escaped() {
        let mark = StructuredMark::parse("winscope_scoped:a.b:code:1").expect("mark");
        assert_eq!(con_mark(&mark), "[con_mark=\"^winscope_scoped:a\\.b:code:1$\"]");
    }

    #[test]
    fn missing_socket_is_an_ipc_failure() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut store = SwayMarkStore::new(IpcSettings {
            socket_path: Some(dir.path().join("absent.sock")),
            timeout: Duration::from_millis(50),
            retry_backoff: Duration::from_millis(1),
        });
        let err = store.query_tree().unwrap_err();
        assert_eq!(err.code(), "ipc_failure");
    }
}
