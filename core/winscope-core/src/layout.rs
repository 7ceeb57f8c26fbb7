//! Saved layouts and the Layout Restoration Engine.
//!
//! Layouts live at `<layouts_dir>/<project>/<name>.json`. Restoring a layout
//! first claims windows that already exist, launches only the deficit, then
//! moves every claimed window into place, so repeated restores converge
//! instead of stacking duplicates.

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use winscope_daemon_protocol::{validate_name, validate_project_name};

use crate::error::{Result, ScopeError};
use crate::identity::{IdentityResolver, IdentitySource, Scope, WindowIdentity};
use crate::launcher::{LaunchRequest, Launcher};
use crate::mark_store::MarkStore;
use crate::marks::{StructuredMark, MARK_NAMESPACE};
use crate::tree::{Geometry, WindowNode, WindowTreeSnapshot};
use crate::visibility::{decide, Decision};

pub const MIN_WORKSPACE: i32 = 1;
pub const MAX_WORKSPACE: i32 = 99;

fn default_launch_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    500
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutWindowSpec {
    pub app_name: String,
    pub launch_command: String,
    #[serde(default)]
    pub launch_environment: BTreeMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    pub workspace: i32,
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default = "default_launch_timeout_ms")]
    pub launch_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Extra marks (outside the winscope namespace) applied after restore.
    #[serde(default)]
    pub expected_marks: Vec<String>,
    #[serde(default)]
    pub scope: Scope,
}

impl LayoutWindowSpec {
    pub fn new(app_name: &str, launch_command: &str, workspace: i32) -> Self {
        Self {
            app_name: app_name.to_string(),
            launch_command: launch_command.to_string(),
            launch_environment: BTreeMap::new(),
            working_directory: None,
            workspace,
            geometry: None,
            launch_timeout_ms: default_launch_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            expected_marks: Vec::new(),
            scope: Scope::Scoped,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.app_name, "app_name")?;
        if self.launch_command.trim().is_empty() {
            return Err(ScopeError::validation("launch_command", "is required"));
        }
        shell_words::split(&self.launch_command)
            .map_err(|err| ScopeError::validation("launch_command", err.to_string()))?;
        if !(MIN_WORKSPACE..=MAX_WORKSPACE).contains(&self.workspace) {
            return Err(ScopeError::validation(
                "workspace",
                format!(
                    "{} is outside {}..={}",
                    self.workspace, MIN_WORKSPACE, MAX_WORKSPACE
                ),
            ));
        }
        if let Some(dir) = &self.working_directory {
            if !dir.is_absolute() {
                return Err(ScopeError::validation(
                    "working_directory",
                    format!("{} is not absolute", dir.display()),
                ));
            }
        }
        if let Some(geometry) = &self.geometry {
            if geometry.width <= 0 || geometry.height <= 0 {
                return Err(ScopeError::validation("geometry", "width and height must be positive"));
            }
        }
        for raw in &self.expected_marks {
            let mark = StructuredMark::parse(raw)?;
            if mark.in_namespace(MARK_NAMESPACE) {
                return Err(ScopeError::validation(
                    "expected_marks",
                    format!("'{}' uses the reserved namespace", raw),
                ));
            }
        }
        Ok(())
    }

    /// Project that owns windows of this spec, if any.
    pub fn owner<'p>(&self, layout_project: &'p str) -> Option<&'p str> {
        match self.scope {
            Scope::Scoped => Some(layout_project),
            Scope::Global => None,
        }
    }

    fn identity(&self, layout_project: &str) -> Result<WindowIdentity> {
        match self.owner(layout_project) {
            Some(project) => WindowIdentity::scoped(&self.app_name, project, IdentitySource::Environment),
            None => WindowIdentity::global(&self.app_name, IdentitySource::Environment),
        }
    }

    fn matches(&self, identity: &WindowIdentity, layout_project: &str) -> bool {
        !identity.is_scratchpad && identity.belongs_to(&self.app_name, self.owner(layout_project))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedLayout {
    pub name: String,
    pub project: String,
    pub created_at: DateTime<Utc>,
    pub windows: Vec<LayoutWindowSpec>,
}

impl SavedLayout {
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name, "layout")?;
        validate_project_name(&self.project)?;
        for spec in &self.windows {
            spec.validate()?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Storage
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LayoutStore {
    root: PathBuf,
}

impl LayoutStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, project: &str, name: &str) -> Result<PathBuf> {
        validate_project_name(project)?;
        validate_name(name, "layout")?;
        Ok(self.root.join(project).join(format!("{}.json", name)))
    }

    pub fn load(&self, project: &str, name: &str) -> Result<SavedLayout> {
        let path = self.path_for(project, name)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ScopeError::LayoutNotFound(path))
            }
            Err(source) => {
                return Err(ScopeError::Io {
                    context: format!("read {}", path.display()),
                    source,
                })
            }
        };
        let layout: SavedLayout = serde_json::from_slice(&data).map_err(|source| ScopeError::Json {
            context: format!("parse {}", path.display()),
            source,
        })?;
        layout.validate()?;
        Ok(layout)
    }

    /// Writes the layout through a temp file and rename.
    pub fn save(&self, layout: &SavedLayout) -> Result<PathBuf> {
        layout.validate()?;
        let path = self.path_for(&layout.project, &layout.name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ScopeError::Io {
                context: "create layout dir".to_string(),
                source,
            })?;
        }
        let payload = serde_json::to_vec_pretty(layout).map_err(|source| ScopeError::Json {
            context: "serialize layout".to_string(),
            source,
        })?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, payload).map_err(|source| ScopeError::Io {
            context: "write layout".to_string(),
            source,
        })?;
        fs::rename(&tmp_path, &path).map_err(|source| ScopeError::Io {
            context: "commit layout".to_string(),
            source,
        })?;
        Ok(path)
    }

    pub fn list(&self, project: &str) -> Result<Vec<String>> {
        validate_project_name(project)?;
        let dir = self.root.join(project);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ScopeError::Io {
                    context: format!("list {}", dir.display()),
                    source,
                })
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
            .filter_map(|path| path.file_stem().and_then(|stem| stem.to_str()).map(String::from))
            .collect();
        names.sort();
        Ok(names)
    }
}

// ─────────────────────────────────────────────────────────────────────
// Capture
// ─────────────────────────────────────────────────────────────────────

/// Snapshots the windows owned by `project` (and global windows when asked)
/// into a layout. Windows whose command line cannot be read are skipped.
pub fn capture(
    tree: &WindowTreeSnapshot,
    resolver: &IdentityResolver,
    project: &str,
    name: &str,
    include_global: bool,
) -> Result<SavedLayout> {
    validate_project_name(project)?;
    validate_name(name, "layout")?;
    let inspector = resolver.inspector();

    let mut windows = Vec::new();
    for node in &tree.windows {
        let identity = resolver.resolve_node(node);
        let wanted = match identity.scope {
            Scope::Scoped => !identity.is_scratchpad && identity.project.as_deref() == Some(project),
            Scope::Global => include_global && identity.source != IdentitySource::None,
        };
        if !wanted {
            continue;
        }
        let Some(workspace) = node.workspace.filter(|ws| (MIN_WORKSPACE..=MAX_WORKSPACE).contains(ws))
        else {
            debug!(window_id = node.id, "Skipping window without a restorable workspace");
            continue;
        };
        let Some(argv) = node.pid.and_then(|pid| inspector.command_line(pid)) else {
            warn!(window_id = node.id, app = %identity.app_name, "Cannot read launch command; skipping");
            continue;
        };

        let mut spec = LayoutWindowSpec::new(&identity.app_name, &shell_words::join(&argv), workspace);
        spec.scope = identity.scope;
        spec.working_directory = node.pid.and_then(|pid| inspector.working_directory(pid));
        spec.geometry = node.floating.then_some(node.geometry);
        spec.expected_marks = foreign_marks(node);
        windows.push(spec);
    }

    if windows.is_empty() {
        return Err(ScopeError::validation(
            "layout",
            format!("project '{}' has no capturable windows", project),
        ));
    }
    info!(project, layout = name, windows = windows.len(), "Captured layout");
    Ok(SavedLayout {
        name: name.to_string(),
        project: project.to_string(),
        created_at: Utc::now(),
        windows,
    })
}

fn foreign_marks(node: &WindowNode) -> Vec<String> {
    node.marks
        .iter()
        .filter(|raw| {
            StructuredMark::parse(raw)
                .map(|mark| !mark.in_namespace(MARK_NAMESPACE))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

// ─────────────────────────────────────────────────────────────────────
// Restore
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecStatus {
    AlreadyRunning,
    Launched,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpecOutcome {
    pub app_name: String,
    pub workspace: i32,
    pub window_id: Option<i64>,
    pub status: SpecStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreFailure {
    pub app_name: String,
    pub workspace: i32,
    pub reason: String,
}

/// A restored window that the active project keeps hidden, with the place
/// it takes once its project becomes active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParkedWindow {
    pub window_id: i64,
    pub workspace: i32,
    pub floating: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub layout: String,
    pub project: String,
    pub launched: usize,
    pub repositioned: usize,
    pub parked: Vec<ParkedWindow>,
    pub failed: Vec<RestoreFailure>,
    pub specs: Vec<SpecOutcome>,
}

impl RestoreReport {
    fn fail(&mut self, spec: &LayoutWindowSpec, reason: impl Into<String>) {
        self.failed.push(RestoreFailure {
            app_name: spec.app_name.clone(),
            workspace: spec.workspace,
            reason: reason.into(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Unchanged,
    Moved,
    Parked,
}

pub struct LayoutRestorer<'a> {
    pub store: &'a mut dyn MarkStore,
    pub resolver: &'a IdentityResolver,
    pub launcher: &'a dyn Launcher,
    /// Project whose windows may be on screen; everything else scoped is
    /// marked and parked in the scratchpad instead of placed.
    pub active_project: Option<&'a str>,
    pub poll_interval: Duration,
}

impl<'a> LayoutRestorer<'a> {
    pub fn restore(&mut self, layout: &SavedLayout) -> Result<RestoreReport> {
        layout.validate()?;
        info!(project = %layout.project, layout = %layout.name, specs = layout.windows.len(), "Restoring layout");

        let mut report = RestoreReport {
            layout: layout.name.clone(),
            project: layout.project.clone(),
            launched: 0,
            repositioned: 0,
            parked: Vec::new(),
            failed: Vec::new(),
            specs: Vec::new(),
        };

        let tree = self.store.query_tree()?;
        let mut claimed = HashSet::new();
        let mut assigned = self.claim_existing(layout, &tree, &mut claimed);
        let mut status: Vec<SpecStatus> = assigned
            .iter()
            .map(|slot| match slot {
                Some(_) => SpecStatus::AlreadyRunning,
                None => SpecStatus::Failed,
            })
            .collect();

        for (index, spec) in layout.windows.iter().enumerate() {
            if assigned[index].is_some() {
                continue;
            }
            match self.launch_spec(layout, spec, &mut claimed)? {
                Ok(window_id) => {
                    assigned[index] = Some(window_id);
                    status[index] = SpecStatus::Launched;
                    report.launched += 1;
                }
                Err(reason) => report.fail(spec, reason),
            }
        }

        let tree = self.store.query_tree()?;
        for (index, spec) in layout.windows.iter().enumerate() {
            let Some(window_id) = assigned[index] else {
                continue;
            };
            let Some(node) = tree.find(window_id) else {
                report.fail(spec, "window vanished before it could be positioned");
                assigned[index] = None;
                status[index] = SpecStatus::Failed;
                continue;
            };
            match self.place(layout, spec, node) {
                Ok(Placement::Moved) => report.repositioned += 1,
                Ok(Placement::Unchanged) => {}
                Ok(Placement::Parked) => report.parked.push(ParkedWindow {
                    window_id,
                    workspace: spec.workspace,
                    floating: spec.geometry.is_some(),
                }),
                Err(err) if err.is_transport() => return Err(err),
                Err(err) => {
                    warn!(window_id, app = %spec.app_name, error = %err, "Failed to position window");
                    report.fail(spec, err.to_string());
                }
            }
        }

        report.specs = layout
            .windows
            .iter()
            .zip(assigned.iter().zip(status))
            .map(|(spec, (window_id, status))| SpecOutcome {
                app_name: spec.app_name.clone(),
                workspace: spec.workspace,
                window_id: *window_id,
                status,
            })
            .collect();

        info!(
            project = %layout.project,
            layout = %layout.name,
            launched = report.launched,
            repositioned = report.repositioned,
            parked = report.parked.len(),
            failed = report.failed.len(),
            "Layout restored"
        );
        Ok(report)
    }

    /// Assigns running windows to specs: first windows already on the spec's
    /// workspace, then matching windows anywhere else (including hidden).
    fn claim_existing(
        &self,
        layout: &SavedLayout,
        tree: &WindowTreeSnapshot,
        claimed: &mut HashSet<i64>,
    ) -> Vec<Option<i64>> {
        let identities: Vec<WindowIdentity> = tree
            .windows
            .iter()
            .map(|node| self.resolver.resolve_node(node))
            .collect();
        let mut assigned = vec![None; layout.windows.len()];

        for exact_workspace in [true, false] {
            for (index, spec) in layout.windows.iter().enumerate() {
                if assigned[index].is_some() {
                    continue;
                }
                let found = tree
                    .windows
                    .iter()
                    .zip(&identities)
                    .find(|(node, identity)| {
                        !claimed.contains(&node.id)
                            && spec.matches(identity, &layout.project)
                            && (!exact_workspace || node.workspace == Some(spec.workspace))
                    })
                    .map(|(node, _)| node.id);
                if let Some(window_id) = found {
                    debug!(window_id, app = %spec.app_name, workspace = spec.workspace, "Claimed running window");
                    claimed.insert(window_id);
                    assigned[index] = Some(window_id);
                }
            }
        }
        assigned
    }

    /// Launches one spec with retries. The outer error is a transport failure;
    /// the inner one is the per-spec failure reason.
    fn launch_spec(
        &mut self,
        layout: &SavedLayout,
        spec: &LayoutWindowSpec,
        claimed: &mut HashSet<i64>,
    ) -> Result<std::result::Result<i64, String>> {
        let identity = spec.identity(&layout.project)?;
        let mut environment = spec.launch_environment.clone();
        environment.extend(self.resolver.begin_launch(&identity));
        let request = LaunchRequest::from_command_line(
            &spec.launch_command,
            environment.into_iter().collect(),
            spec.working_directory.clone(),
        )?;

        let timeout = Duration::from_millis(spec.launch_timeout_ms);
        let mut pids = Vec::new();
        let mut reason = String::new();
        for attempt in 0..=spec.max_retries {
            if attempt > 0 {
                thread::sleep(Duration::from_millis(spec.retry_delay_ms));
                // A window from an earlier attempt may have shown up late.
                if let Some(window_id) = self.find_launched(layout, spec, &pids, claimed)? {
                    claimed.insert(window_id);
                    return Ok(Ok(window_id));
                }
            }

            match self.launcher.launch(&request) {
                Ok(pid) => {
                    debug!(pid, app = %spec.app_name, attempt, "Launched layout window");
                    pids.push(pid);
                }
                Err(err) => {
                    warn!(app = %spec.app_name, attempt, error = %err, "Launch failed");
                    reason = err.to_string();
                    continue;
                }
            }

            let started = Instant::now();
            loop {
                if let Some(window_id) = self.find_launched(layout, spec, &pids, claimed)? {
                    claimed.insert(window_id);
                    return Ok(Ok(window_id));
                }
                if started.elapsed() >= timeout {
                    break;
                }
                thread::sleep(self.poll_interval);
            }
            reason = ScopeError::LaunchTimeout {
                app: spec.app_name.clone(),
                waited_ms: started.elapsed().as_millis() as u64,
            }
            .to_string();
            warn!(app = %spec.app_name, attempt, "No window appeared before the launch timeout");
        }
        Ok(Err(reason))
    }

    fn find_launched(
        &mut self,
        layout: &SavedLayout,
        spec: &LayoutWindowSpec,
        pids: &[u32],
        claimed: &HashSet<i64>,
    ) -> Result<Option<i64>> {
        let tree = self.store.query_tree()?;
        Ok(tree
            .windows
            .iter()
            .filter(|node| !claimed.contains(&node.id))
            .find(|node| {
                node.pid.map(|pid| pids.contains(&pid)).unwrap_or(false)
                    || spec.matches(&self.resolver.resolve_node(node), &layout.project)
            })
            .map(|node| node.id))
    }

    /// Refreshes marks, then moves the window into place, or parks it when
    /// the active project would hide it.
    fn place(&mut self, layout: &SavedLayout, spec: &LayoutWindowSpec, node: &WindowNode) -> Result<Placement> {
        let identity = spec.identity(&layout.project)?;
        let mut wanted = identity.marks(node.id)?;
        for raw in &spec.expected_marks {
            wanted.push(StructuredMark::parse(raw)?);
        }
        let missing = wanted
            .iter()
            .any(|mark| !node.marks.contains(&mark.to_string()));
        if missing {
            self.store.remove_marks(node.id, MARK_NAMESPACE)?;
            self.store.apply_marks(node.id, &wanted)?;
            self.resolver.settle_launch(node.pid);
            debug!(window_id = node.id, identity = %identity, "Layout marks applied");
        }

        if decide(self.active_project, &identity) == Decision::Hide {
            if node.visible {
                self.store.move_to_scratchpad(node.id)?;
            }
            debug!(window_id = node.id, identity = %identity, "Parked window of inactive project");
            return Ok(Placement::Parked);
        }

        let mut placement = Placement::Unchanged;
        if !node.visible || node.workspace != Some(spec.workspace) {
            self.store.move_to_workspace(node.id, spec.workspace)?;
            placement = Placement::Moved;
        }
        if let Some(geometry) = &spec.geometry {
            if !node.floating || node.geometry != *geometry {
                self.store.set_geometry(node.id, geometry)?;
                placement = Placement::Moved;
            }
        }
        Ok(placement)
    }
}
