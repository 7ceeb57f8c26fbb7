//! In-memory stand-ins for the window manager, the process table and the
//! launcher.
//!
//! All three are cheap handles over shared state, so a test can keep one
//! clone for assertions while the engine owns another.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, ScopeError};
use crate::launcher::{LaunchRequest, Launcher};
use crate::mark_store::MarkStore;
use crate::marks::{parse_marks, StructuredMark};
use crate::process::{ProcessInspector, ProcessProbe};
use crate::tree::{Geometry, WindowNode, WindowTreeSnapshot};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─────────────────────────────────────────────────────────────────────
// Window manager
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct FakeWindow {
    pid: u32,
    app: String,
    marks: Vec<String>,
    workspace: i32,
    visible: bool,
    floating: bool,
    geometry: Geometry,
}

#[derive(Debug)]
struct PendingWindow {
    queries_left: u32,
    window: FakeWindow,
}

#[derive(Debug)]
struct FakeWmState {
    windows: BTreeMap<i64, FakeWindow>,
    pending: Vec<PendingWindow>,
    next_id: i64,
    focused_workspace: i32,
    commands: usize,
    tree_queries: usize,
    disconnected: bool,
    rejecting: Vec<i64>,
}

impl FakeWmState {
    fn insert(&mut self, window: FakeWindow) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        self.windows.insert(id, window);
        id
    }

    /// Lets windows of slow launches appear as the tree is polled.
    fn advance_pending(&mut self) {
        let mut ready = Vec::new();
        self.pending.retain_mut(|pending| {
            if pending.queries_left == 0 {
                ready.push(pending.window.clone());
                false
            } else {
                pending.queries_left -= 1;
                true
            }
        });
        for window in ready {
            self.insert(window);
        }
    }

    fn check_connected(&self, context: &str) -> Result<()> {
        if self.disconnected {
            Err(ScopeError::ipc(context, "connection refused"))
        } else {
            Ok(())
        }
    }

    fn command(&mut self, window_id: i64, command: &str) -> Result<&mut FakeWindow> {
        self.check_connected("run_command")?;
        self.commands += 1;
        if self.rejecting.contains(&window_id) {
            return Err(ScopeError::CommandRejected {
                command: command.to_string(),
                details: "rejected by fake window manager".to_string(),
            });
        }
        self.windows
            .get_mut(&window_id)
            .ok_or_else(|| ScopeError::NotFound(format!("window {}", window_id)))
    }

    fn holder_of(&self, mark: &StructuredMark) -> Option<i64> {
        let raw = mark.to_string();
        self.windows
            .iter()
            .find(|(_, window)| window.marks.contains(&raw))
            .map(|(id, _)| *id)
    }
}

/// [`MarkStore`] over an in-memory tree with the window manager's mark rules:
/// a mark sits on at most one window, and marks die with their window.
#[derive(Debug, Clone)]
pub struct FakeWindowManager {
    state: Arc<Mutex<FakeWmState>>,
}

impl Default for FakeWindowManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeWindowManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeWmState {
                windows: BTreeMap::new(),
                pending: Vec::new(),
                next_id: 1,
                focused_workspace: 1,
                commands: 0,
                tree_queries: 0,
                disconnected: false,
                rejecting: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeWmState> {
        lock(&self.state)
    }

    fn window<T>(&self, window_id: i64, read: impl FnOnce(&FakeWindow) -> T) -> Option<T> {
        self.state().windows.get(&window_id).map(read)
    }

    pub fn add_window(&self, pid: u32, app: &str, workspace: i32, marks: &[&str]) -> i64 {
        self.state().insert(FakeWindow {
            pid,
            app: app.to_string(),
            marks: marks.iter().map(|mark| mark.to_string()).collect(),
            workspace,
            visible: true,
            floating: false,
            geometry: Geometry::default(),
        })
    }

    pub fn add_hidden_window(&self, pid: u32, app: &str, marks: &[&str]) -> i64 {
        let id = self.add_window(pid, app, 0, marks);
        if let Some(window) = self.state().windows.get_mut(&id) {
            window.visible = false;
            window.floating = true;
        }
        id
    }

    /// Queues a window that appears after `queries` more tree polls.
    pub fn add_window_later(&self, pid: u32, app: &str, queries: u32) {
        let mut state = self.state();
        let workspace = state.focused_workspace;
        state.pending.push(PendingWindow {
            queries_left: queries,
            window: FakeWindow {
                pid,
                app: app.to_string(),
                marks: Vec::new(),
                workspace,
                visible: true,
                floating: false,
                geometry: Geometry::default(),
            },
        });
    }

    /// Closes a window the way a user would, outside the engine.
    pub fn close(&self, window_id: i64) -> bool {
        self.state().windows.remove(&window_id).is_some()
    }

    pub fn set_floating(&self, window_id: i64, floating: bool) {
        if let Some(window) = self.state().windows.get_mut(&window_id) {
            window.floating = floating;
        }
    }

    pub fn set_focused_workspace(&self, workspace: i32) {
        self.state().focused_workspace = workspace;
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.state().disconnected = disconnected;
    }

    pub fn reject_commands_for(&self, window_id: i64) {
        self.state().rejecting.push(window_id);
    }

    pub fn is_visible(&self, window_id: i64) -> bool {
        self.window(window_id, |window| window.visible).unwrap_or(false)
    }

    pub fn is_floating(&self, window_id: i64) -> bool {
        self.window(window_id, |window| window.floating).unwrap_or(false)
    }

    pub fn exists(&self, window_id: i64) -> bool {
        self.state().windows.contains_key(&window_id)
    }

    pub fn workspace_of(&self, window_id: i64) -> Option<i32> {
        self.window(window_id, |window| window.visible.then_some(window.workspace))
            .flatten()
    }

    pub fn geometry_of(&self, window_id: i64) -> Option<Geometry> {
        self.window(window_id, |window| window.geometry)
    }

    pub fn pid_of(&self, window_id: i64) -> Option<u32> {
        self.window(window_id, |window| window.pid)
    }

    pub fn marks_of(&self, window_id: i64) -> Vec<String> {
        self.window(window_id, |window| window.marks.clone())
            .unwrap_or_default()
    }

    pub fn window_count(&self) -> usize {
        self.state().windows.len()
    }

    pub fn windows_of_app(&self, app: &str) -> Vec<i64> {
        self.state()
            .windows
            .iter()
            .filter(|(_, window)| window.app == app)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn count_with_mark(&self, mark: &str) -> usize {
        self.state()
            .windows
            .values()
            .filter(|window| window.marks.iter().any(|value| value == mark))
            .count()
    }

    /// Mutating commands issued so far, failed ones included.
    pub fn command_count(&self) -> usize {
        self.state().commands
    }

    pub fn tree_queries(&self) -> usize {
        self.state().tree_queries
    }
}

impl MarkStore for FakeWindowManager {
    fn read_marks(&mut self, window_id: i64) -> Result<Vec<StructuredMark>> {
        let mut state = self.state();
        state.check_connected("read_marks")?;
        state.advance_pending();
        let window = state
            .windows
            .get(&window_id)
            .ok_or_else(|| ScopeError::NotFound(format!("window {}", window_id)))?;
        Ok(parse_marks(&window.marks))
    }

    fn apply_marks(&mut self, window_id: i64, marks: &[StructuredMark]) -> Result<()> {
        if marks.is_empty() {
            return Ok(());
        }
        let mut state = self.state();
        state.command(window_id, "mark --add")?;
        for mark in marks {
            let raw = mark.to_string();
            for window in state.windows.values_mut() {
                window.marks.retain(|value| value != &raw);
            }
            if let Some(window) = state.windows.get_mut(&window_id) {
                window.marks.push(raw);
            }
        }
        Ok(())
    }

    fn remove_marks(&mut self, window_id: i64, namespace: &str) -> Result<usize> {
        let mut state = self.state();
        let window = state.command(window_id, "unmark")?;
        let before = window.marks.len();
        window.marks.retain(|raw| {
            !parse_marks(std::slice::from_ref(raw))
                .first()
                .map(|mark| mark.in_namespace(namespace))
                .unwrap_or(false)
        });
        Ok(before - window.marks.len())
    }

    fn query_tree(&mut self) -> Result<WindowTreeSnapshot> {
        let mut state = self.state();
        state.check_connected("get_tree")?;
        state.tree_queries += 1;
        state.advance_pending();
        let windows = state
            .windows
            .iter()
            .map(|(id, window)| WindowNode {
                id: *id,
                pid: Some(window.pid),
                app_hint: Some(window.app.clone()),
                marks: window.marks.clone(),
                workspace: window.visible.then_some(window.workspace),
                visible: window.visible,
                floating: window.floating,
                geometry: window.geometry,
            })
            .collect();
        Ok(WindowTreeSnapshot {
            captured_at: Utc::now(),
            windows,
            focused_workspace: Some(state.focused_workspace),
        })
    }

    fn move_to_scratchpad(&mut self, window_id: i64) -> Result<()> {
        let mut state = self.state();
        let window = state.command(window_id, "move scratchpad")?;
        window.visible = false;
        window.floating = true;
        Ok(())
    }

    fn restore_from_scratchpad(&mut self, window_id: i64, workspace: i32, floating: bool) -> Result<()> {
        let mut state = self.state();
        let window = state.command(window_id, "move container to workspace")?;
        window.visible = true;
        window.floating = floating;
        window.workspace = workspace;
        Ok(())
    }

    fn show_marked_scratchpad(&mut self, mark: &StructuredMark) -> Result<()> {
        let mut state = self.state();
        let holder = state
            .holder_of(mark)
            .ok_or_else(|| ScopeError::NotFound(mark.to_string()))?;
        let focused = state.focused_workspace;
        let window = state.command(holder, "scratchpad show")?;
        window.visible = true;
        window.floating = true;
        window.workspace = focused;
        Ok(())
    }

    fn hide_marked(&mut self, mark: &StructuredMark) -> Result<()> {
        let mut state = self.state();
        let holder = state
            .holder_of(mark)
            .ok_or_else(|| ScopeError::NotFound(mark.to_string()))?;
        let window = state.command(holder, "move scratchpad")?;
        window.visible = false;
        window.floating = true;
        Ok(())
    }

    fn move_to_workspace(&mut self, window_id: i64, workspace: i32) -> Result<()> {
        let mut state = self.state();
        let window = state.command(window_id, "move container to workspace")?;
        window.visible = true;
        window.workspace = workspace;
        Ok(())
    }

    fn set_geometry(&mut self, window_id: i64, geometry: &Geometry) -> Result<()> {
        let mut state = self.state();
        let window = state.command(window_id, "resize set")?;
        window.floating = true;
        window.geometry = *geometry;
        Ok(())
    }

    fn float_centered(&mut self, window_id: i64, _width_ppt: u8, _height_ppt: u8) -> Result<()> {
        let mut state = self.state();
        let window = state.command(window_id, "floating enable")?;
        window.floating = true;
        Ok(())
    }

    fn close_window(&mut self, window_id: i64) -> Result<()> {
        let mut state = self.state();
        state.command(window_id, "kill")?;
        state.windows.remove(&window_id);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Processes
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct FakeProcess {
    environment: HashMap<String, String>,
    command_line: Vec<String>,
    working_directory: Option<PathBuf>,
    started: u64,
    alive: bool,
}

#[derive(Debug)]
struct FakeProcessTable {
    next_pid: u32,
    clock: u64,
    processes: HashMap<u32, FakeProcess>,
}

/// Process table implementing both [`ProcessProbe`] and [`ProcessInspector`].
#[derive(Debug, Clone)]
pub struct FakeProcesses {
    table: Arc<Mutex<FakeProcessTable>>,
}

impl Default for FakeProcesses {
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(FakeProcessTable {
                next_pid: 40_000,
                clock: 1_700_000_000,
                processes: HashMap::new(),
            })),
        }
    }
}

impl FakeProcesses {
    pub fn spawn(&self, vars: &[(&str, &str)]) -> u32 {
        self.spawn_inherited(
            vars.iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        )
    }

    pub fn spawn_with_pid(&self, pid: u32, vars: &[(&str, &str)]) {
        self.spawn_owned(
            pid,
            vars.iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        );
    }

    /// Starts `pid` with an environment built elsewhere, such as the
    /// variables of a launch request or another process.
    pub fn spawn_owned(&self, pid: u32, vars: Vec<(String, String)>) {
        let mut table = lock(&self.table);
        table.clock += 10;
        let started = table.clock;
        table.processes.insert(
            pid,
            FakeProcess {
                environment: vars.into_iter().collect(),
                started,
                alive: true,
                ..FakeProcess::default()
            },
        );
    }

    /// Starts a process on a fresh pid with an owned environment.
    pub fn spawn_inherited(&self, vars: Vec<(String, String)>) -> u32 {
        let pid = {
            let mut table = lock(&self.table);
            let pid = table.next_pid;
            table.next_pid += 1;
            pid
        };
        self.spawn_owned(pid, vars);
        pid
    }

    pub fn set_command_line(&self, pid: u32, args: &[&str]) {
        if let Some(process) = lock(&self.table).processes.get_mut(&pid) {
            process.command_line = args.iter().map(|arg| arg.to_string()).collect();
        }
    }

    pub fn set_working_directory(&self, pid: u32, dir: &Path) {
        if let Some(process) = lock(&self.table).processes.get_mut(&pid) {
            process.working_directory = Some(dir.to_path_buf());
        }
    }

    pub fn kill(&self, pid: u32) {
        if let Some(process) = lock(&self.table).processes.get_mut(&pid) {
            process.alive = false;
        }
    }

    /// Reuses `pid` for an unrelated process with a later start time.
    pub fn recycle(&self, pid: u32) {
        self.spawn_with_pid(pid, &[]);
    }

    fn with_process<T>(&self, pid: u32, read: impl FnOnce(&FakeProcess) -> Option<T>) -> Option<T> {
        lock(&self.table)
            .processes
            .get(&pid)
            .filter(|process| process.alive)
            .and_then(read)
    }
}

impl ProcessProbe for FakeProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        self.with_process(pid, |_| Some(())).is_some()
    }

    fn start_time(&self, pid: u32) -> Option<u64> {
        self.with_process(pid, |process| Some(process.started))
    }
}

impl ProcessInspector for FakeProcesses {
    fn environment(&self, pid: u32) -> Option<HashMap<String, String>> {
        self.with_process(pid, |process| Some(process.environment.clone()))
    }

    fn command_line(&self, pid: u32) -> Option<Vec<String>> {
        self.with_process(pid, |process| {
            (!process.command_line.is_empty()).then(|| process.command_line.clone())
        })
    }

    fn working_directory(&self, pid: u32) -> Option<PathBuf> {
        self.with_process(pid, |process| process.working_directory.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Launcher
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchBehavior {
    /// The window is in the tree by the next query.
    Immediate,
    /// The window shows up after this many additional tree queries.
    Delayed(u32),
    /// The process starts but never maps a window.
    NoWindow,
    /// The program cannot be spawned.
    Fail,
}

#[derive(Debug, Default)]
struct FakeLauncherState {
    behaviors: HashMap<String, LaunchBehavior>,
    launches: Vec<LaunchRequest>,
}

/// Launcher that "starts" programs as fake processes whose windows appear
/// in a [`FakeWindowManager`] under the program's base name.
#[derive(Debug, Clone)]
pub struct FakeLauncher {
    wm: FakeWindowManager,
    processes: FakeProcesses,
    state: Arc<Mutex<FakeLauncherState>>,
}

impl FakeLauncher {
    pub fn new(wm: FakeWindowManager, processes: FakeProcesses) -> Self {
        Self {
            wm,
            processes,
            state: Arc::new(Mutex::new(FakeLauncherState::default())),
        }
    }

    pub fn set_behavior(&self, program: &str, behavior: LaunchBehavior) {
        lock(&self.state)
            .behaviors
            .insert(program.to_string(), behavior);
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        lock(&self.state).launches.clone()
    }

    pub fn launch_count(&self) -> usize {
        lock(&self.state).launches.len()
    }
}

fn base_name(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

impl Launcher for FakeLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<u32> {
        let behavior = {
            let mut state = lock(&self.state);
            state.launches.push(request.clone());
            state
                .behaviors
                .get(request.program())
                .copied()
                .unwrap_or(LaunchBehavior::Immediate)
        };
        if behavior == LaunchBehavior::Fail {
            return Err(ScopeError::LaunchFailed {
                command: request.display(),
                details: "No such file or directory (os error 2)".to_string(),
            });
        }

        let pid = self.processes.spawn_inherited(request.environment.clone());
        let args: Vec<&str> = request.command.iter().map(String::as_str).collect();
        self.processes.set_command_line(pid, &args);
        if let Some(dir) = &request.working_directory {
            self.processes.set_working_directory(pid, dir);
        }

        let app = base_name(request.program());
        match behavior {
            LaunchBehavior::Immediate => self.wm.add_window_later(pid, app, 0),
            LaunchBehavior::Delayed(queries) => self.wm.add_window_later(pid, app, queries),
            LaunchBehavior::NoWindow | LaunchBehavior::Fail => {}
        }
        Ok(pid)
    }
}
