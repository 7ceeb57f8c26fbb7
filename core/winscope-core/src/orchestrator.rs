//! Filtering Orchestrator.
//!
//! Converges every trigger source on [`crate::visibility::explain`]:
//!
//! ```text
//! Trigger ──► Querying ──► Deciding ──► Applying ──► Idle
//!  (tick / direct: full tree; window-created: that window only)
//! ```
//!
//! Only commands that change state are issued, and each evaluated window
//! leaves one audit record tagged with the trigger path that produced it.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, TriggerPath, VisibilityDecision};
use crate::error::Result;
use crate::identity::{IdentityResolver, IdentitySource, Scope, WindowIdentity};
use crate::mark_store::MarkStore;
use crate::tree::WindowNode;
use crate::visibility::{explain, Decision};

const FALLBACK_WORKSPACE: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    TickSwitch {
        project: String,
    },
    DirectSwitch {
        project: String,
    },
    /// Fast path for one new window. `marks` is filled in when the event
    /// already carried them, saving a lookup.
    WindowCreated {
        window_id: i64,
        pid: Option<u32>,
        marks: Option<Vec<String>>,
    },
}

impl Trigger {
    pub fn path(&self) -> TriggerPath {
        match self {
            Trigger::TickSwitch { .. } => TriggerPath::Tick,
            Trigger::DirectSwitch { .. } => TriggerPath::Direct,
            Trigger::WindowCreated { .. } => TriggerPath::WindowEvent,
        }
    }

    pub fn is_switch(&self) -> bool {
        matches!(
            self,
            Trigger::TickSwitch { .. } | Trigger::DirectSwitch { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorState {
    Idle,
    Querying,
    Deciding,
    Applying,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub window_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterReport {
    pub trigger: TriggerPath,
    pub active_project: Option<String>,
    pub evaluated: usize,
    pub hidden: Vec<i64>,
    pub shown: Vec<i64>,
    pub failed: Vec<ItemFailure>,
}

impl FilterReport {
    fn new(trigger: TriggerPath, active_project: Option<String>) -> Self {
        Self {
            trigger,
            active_project,
            evaluated: 0,
            hidden: Vec::new(),
            shown: Vec::new(),
            failed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Hide,
    Show { workspace: i32, floating: bool },
}

/// Where a hidden window was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Parked {
    workspace: i32,
    floating: bool,
}

struct Planned {
    window_id: i64,
    action: Action,
}

pub struct FilteringOrchestrator {
    state: OrchestratorState,
    active_project: Option<String>,
    last_workspace: HashMap<i64, Parked>,
    audit: AuditLog,
}

impl FilteringOrchestrator {
    pub fn new(active_project: Option<String>, audit_capacity: usize) -> Self {
        Self {
            state: OrchestratorState::Idle,
            active_project,
            last_workspace: HashMap::new(),
            audit: AuditLog::new(audit_capacity),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn active_project(&self) -> Option<&str> {
        self.active_project.as_deref()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn forget_window(&mut self, window_id: i64) {
        self.last_workspace.remove(&window_id);
    }

    /// Records where a window hidden outside a switch belongs, so the next
    /// matching switch brings it back there.
    pub fn remember_workspace(&mut self, window_id: i64, workspace: i32, floating: bool) {
        self.last_workspace
            .insert(window_id, Parked { workspace, floating });
    }

    pub fn run(
        &mut self,
        trigger: Trigger,
        store: &mut dyn MarkStore,
        resolver: &IdentityResolver,
    ) -> Result<FilterReport> {
        let result = match trigger {
            Trigger::TickSwitch { project } => {
                self.switch(project, TriggerPath::Tick, store, resolver)
            }
            Trigger::DirectSwitch { project } => {
                self.switch(project, TriggerPath::Direct, store, resolver)
            }
            Trigger::WindowCreated {
                window_id,
                pid,
                marks,
            } => self.window_created(window_id, pid, marks, store, resolver),
        };
        self.transition(OrchestratorState::Idle);
        result
    }

    fn transition(&mut self, next: OrchestratorState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Orchestrator transition");
            self.state = next;
        }
    }

    fn switch(
        &mut self,
        project: String,
        path: TriggerPath,
        store: &mut dyn MarkStore,
        resolver: &IdentityResolver,
    ) -> Result<FilterReport> {
        info!(project = %project, trigger = ?path, "Project switch");
        self.active_project = Some(project);
        let mut report = FilterReport::new(path, self.active_project.clone());

        self.transition(OrchestratorState::Querying);
        let tree = store.query_tree()?;

        self.transition(OrchestratorState::Deciding);
        let mut planned = Vec::new();
        let mut to_mark = Vec::new();
        for node in &tree.windows {
            let identity = resolver.resolve_node(node);
            let decision = self.evaluate(node.id, &identity, path);
            report.evaluated += 1;
            if identity.source == IdentitySource::Environment {
                to_mark.push((node.id, node.pid, identity.clone()));
            }
            if let Some(action) = self.plan(node, &identity, decision, tree.focused_workspace) {
                if action == Action::Hide {
                    if let Some(workspace) = node.workspace {
                        self.remember_workspace(node.id, workspace, node.floating);
                    }
                }
                planned.push(Planned {
                    window_id: node.id,
                    action,
                });
            }
        }

        self.transition(OrchestratorState::Applying);
        for (window_id, pid, identity) in &to_mark {
            mark_launched(store, resolver, *window_id, *pid, identity)?;
        }
        for item in planned {
            apply(store, &item, &mut report)?;
            if matches!(item.action, Action::Show { .. }) {
                self.last_workspace.remove(&item.window_id);
            }
        }

        info!(
            project = ?report.active_project,
            evaluated = report.evaluated,
            hidden = report.hidden.len(),
            shown = report.shown.len(),
            failed = report.failed.len(),
            "Project switch applied"
        );
        Ok(report)
    }

    fn window_created(
        &mut self,
        window_id: i64,
        pid: Option<u32>,
        marks: Option<Vec<String>>,
        store: &mut dyn MarkStore,
        resolver: &IdentityResolver,
    ) -> Result<FilterReport> {
        let mut report = FilterReport::new(TriggerPath::WindowEvent, self.active_project.clone());

        self.transition(OrchestratorState::Querying);
        let marks = match marks {
            Some(marks) => marks,
            None => match store.read_marks(window_id) {
                Ok(parsed) => parsed.iter().map(ToString::to_string).collect(),
                Err(err) if err.is_not_found() => {
                    debug!(window_id, "Window closed before it could be classified");
                    return Ok(report);
                }
                Err(err) => return Err(err),
            },
        };

        self.transition(OrchestratorState::Deciding);
        let identity = resolver.resolve(window_id, &marks, pid);
        let decision = self.evaluate(window_id, &identity, TriggerPath::WindowEvent);
        report.evaluated = 1;

        self.transition(OrchestratorState::Applying);
        if identity.source == IdentitySource::Environment {
            mark_launched(store, resolver, window_id, pid, &identity)?;
        }
        if decision == Decision::Hide {
            let item = Planned {
                window_id,
                action: Action::Hide,
            };
            apply(store, &item, &mut report)?;
        }
        Ok(report)
    }

    fn evaluate(&mut self, window_id: i64, identity: &WindowIdentity, path: TriggerPath) -> Decision {
        let (decision, reason) = explain(self.active_project.as_deref(), identity);
        debug!(
            window_id,
            identity = %identity,
            decision = ?decision,
            reason,
            trigger = ?path,
            "Visibility decision"
        );
        self.audit.record(VisibilityDecision {
            window_id,
            identity: identity.clone(),
            active_project: self.active_project.clone(),
            decision,
            reason,
            trigger_path: path,
            timestamp: Utc::now(),
        });
        decision
    }

    /// Turns a decision into a command, or nothing when the window is
    /// already in the decided state.
    fn plan(
        &self,
        node: &WindowNode,
        identity: &WindowIdentity,
        decision: Decision,
        focused_workspace: Option<i32>,
    ) -> Option<Action> {
        match decision {
            Decision::Hide if node.visible => Some(Action::Hide),
            // Only project windows come back out of the scratchpad: global
            // windows parked by the user and scratchpad terminals waiting for
            // a toggle stay where they are.
            Decision::Show
                if !node.visible && identity.scope == Scope::Scoped && !identity.is_scratchpad =>
            {
                let parked = self.last_workspace.get(&node.id).copied();
                let workspace = parked
                    .map(|parked| parked.workspace)
                    .or(focused_workspace)
                    .unwrap_or(FALLBACK_WORKSPACE);
                let floating = parked.map(|parked| parked.floating).unwrap_or(false);
                Some(Action::Show { workspace, floating })
            }
            _ => None,
        }
    }
}

/// Persists a launch-vouched identity as marks and retires the launch id.
///
/// Scratchpad terminals are left alone: their mark is only ever placed by
/// the scratchpad manager, which also registers the window.
fn mark_launched(
    store: &mut dyn MarkStore,
    resolver: &IdentityResolver,
    window_id: i64,
    pid: Option<u32>,
    identity: &WindowIdentity,
) -> Result<()> {
    if identity.is_scratchpad {
        debug!(window_id, identity = %identity, "Leaving scratchpad terminal to its manager");
        return Ok(());
    }
    if refresh_marks(store, window_id, identity)? {
        resolver.settle_launch(pid);
    }
    Ok(())
}

/// Replaces stale winscope marks with the marks for `identity`. `false`
/// means the window could not be marked.
fn refresh_marks(store: &mut dyn MarkStore, window_id: i64, identity: &WindowIdentity) -> Result<bool> {
    let marks = match identity.marks(window_id) {
        Ok(marks) => marks,
        Err(err) => {
            warn!(window_id, error = %err, "Cannot encode identity as marks");
            return Ok(false);
        }
    };
    let result = store
        .remove_marks(window_id, crate::marks::MARK_NAMESPACE)
        .and_then(|_| store.apply_marks(window_id, &marks));
    match result {
        Ok(()) => {
            debug!(window_id, identity = %identity, "Identity marks refreshed");
            Ok(true)
        }
        Err(err) if err.is_transport() => Err(err),
        Err(err) => {
            debug!(window_id, error = %err, "Mark refresh skipped");
            Ok(false)
        }
    }
}

fn apply(store: &mut dyn MarkStore, item: &Planned, report: &mut FilterReport) -> Result<()> {
    let result = match item.action {
        Action::Hide => store.move_to_scratchpad(item.window_id),
        Action::Show {
            workspace,
            floating,
        } => store.restore_from_scratchpad(item.window_id, workspace, floating),
    };
    match result {
        Ok(()) => {
            match item.action {
                Action::Hide => report.hidden.push(item.window_id),
                Action::Show { .. } => report.shown.push(item.window_id),
            }
            Ok(())
        }
        Err(err) if err.is_not_found() => {
            debug!(window_id = item.window_id, "Window vanished before command");
            Ok(())
        }
        Err(err) if err.is_transport() => Err(err),
        Err(err) => {
            warn!(window_id = item.window_id, error = %err, "Visibility command failed");
            report.failed.push(ItemFailure {
                window_id: item.window_id,
                reason: err.to_string(),
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessInspector;
    use crate::testing::{FakeProcesses, FakeWindowManager};
    use crate::visibility::REASON_MISMATCH;

    fn resolver(processes: &FakeProcesses) -> IdentityResolver {
        IdentityResolver::new(Box::new(processes.clone()))
    }

    #[test]
    fn switch_hides_mismatched_and_restores_matching() {
        let wm = FakeWindowManager::new();
        let alpha = wm.add_window(100, "code", 2, &["winscope_scoped:alpha:code:1"]);
        let beta = wm.add_window(101, "code", 3, &["winscope_scoped:beta:code:2"]);
        let global = wm.add_window(102, "firefox", 1, &["winscope_global:firefox:3"]);
        let processes = FakeProcesses::default();
        let resolver = resolver(&processes);
        let mut store = wm.clone();
        let mut orchestrator = FilteringOrchestrator::new(None, 64);

        let report = orchestrator
            .run(
                Trigger::DirectSwitch {
                    project: "alpha".to_string(),
                },
                &mut store,
                &resolver,
            )
            .expect("switch");
        assert_eq!(report.hidden, vec![beta]);
        assert!(report.shown.is_empty());
        assert!(wm.is_visible(alpha));
        assert!(wm.is_visible(global));
        assert!(!wm.is_visible(beta));

        let report = orchestrator
            .run(
                Trigger::TickSwitch {
                    project: "beta".to_string(),
                },
                &mut store,
                &resolver,
            )
            .expect("switch");
        assert_eq!(report.hidden, vec![alpha]);
        assert_eq!(report.shown, vec![beta]);
        assert_eq!(wm.workspace_of(beta), Some(3));
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
    }

    #[test]
    fn repeated_switch_issues_no_commands() {
        let wm = FakeWindowManager::new();
        wm.add_window(100, "code", 2, &["winscope_scoped:alpha:code:1"]);
        wm.add_window(101, "code", 3, &["winscope_scoped:beta:code:2"]);
        let processes = FakeProcesses::default();
        let resolver = resolver(&processes);
        let mut store = wm.clone();
        let mut orchestrator = FilteringOrchestrator::new(None, 64);
        let switch = Trigger::DirectSwitch {
            project: "alpha".to_string(),
        };

        orchestrator
            .run(switch.clone(), &mut store, &resolver)
            .expect("first switch");
        let commands_after_first = wm.command_count();
        let report = orchestrator
            .run(switch, &mut store, &resolver)
            .expect("second switch");
        assert!(report.hidden.is_empty());
        assert!(report.shown.is_empty());
        assert_eq!(wm.command_count(), commands_after_first);
    }

    #[test]
    fn audit_records_mismatch_reason() {
        let wm = FakeWindowManager::new();
        let w1 = wm.add_window(100, "code", 2, &["winscope_scoped:alpha:code:1"]);
        let processes = FakeProcesses::default();
        let resolver = resolver(&processes);
        let mut store = wm.clone();
        let mut orchestrator = FilteringOrchestrator::new(Some("alpha".to_string()), 64);

        orchestrator
            .run(
                Trigger::DirectSwitch {
                    project: "beta".to_string(),
                },
                &mut store,
                &resolver,
            )
            .expect("switch");
        let record = orchestrator.audit().latest_for(w1).expect("audit record");
        assert_eq!(record.decision, Decision::Hide);
        assert_eq!(record.reason, REASON_MISMATCH);
        assert_eq!(record.trigger_path, TriggerPath::Direct);
    }

    #[test]
    fn ipc_failure_aborts_the_trigger() {
        let wm = FakeWindowManager::new();
        wm.add_window(100, "code", 2, &["winscope_scoped:beta:code:1"]);
        wm.set_disconnected(true);
        let processes = FakeProcesses::default();
        let resolver = resolver(&processes);
        let mut store = wm.clone();
        let mut orchestrator = FilteringOrchestrator::new(None, 64);

        let err = orchestrator
            .run(
                Trigger::DirectSwitch {
                    project: "alpha".to_string(),
                },
                &mut store,
                &resolver,
            )
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
    }

    #[test]
    fn new_window_from_environment_is_hidden_and_marked() {
        let wm = FakeWindowManager::new();
        let processes = FakeProcesses::default();
        let resolver = resolver(&processes);
        let code = WindowIdentity::scoped("code", "beta", IdentitySource::Environment)
            .expect("identity");
        let pid = processes.spawn_inherited(resolver.begin_launch(&code));
        let window = wm.add_window(pid, "code", 1, &[]);
        let mut store = wm.clone();
        let mut orchestrator = FilteringOrchestrator::new(Some("alpha".to_string()), 64);

        let report = orchestrator
            .run(
                Trigger::WindowCreated {
                    window_id: window,
                    pid: Some(pid),
                    marks: None,
                },
                &mut store,
                &resolver,
            )
            .expect("fast path");
        assert_eq!(report.hidden, vec![window]);
        assert_eq!(
            wm.marks_of(window),
            vec![format!("winscope_scoped:beta:code:{}", window)]
        );
        assert_eq!(wm.tree_queries(), 0);
        assert_eq!(resolver.pending_launches(), 0);
    }

    #[test]
    fn inherited_scratchpad_environment_never_moves_the_mark() {
        let wm = FakeWindowManager::new();
        let processes = FakeProcesses::default();
        let resolver = resolver(&processes);
        let pad = WindowIdentity::scratchpad("alpha", IdentitySource::Environment).expect("pad");
        let terminal_pid = processes.spawn_inherited(resolver.begin_launch(&pad));
        let terminal = wm.add_window(terminal_pid, "foot", 1, &["winscope_scratchpad:alpha"]);
        resolver.settle_launch(Some(terminal_pid));

        // A browser started from the terminal's shell.
        let inherited = processes.environment(terminal_pid).expect("terminal env");
        let browser_pid = processes.spawn_inherited(inherited.into_iter().collect());
        let browser = wm.add_window(browser_pid, "firefox", 1, &[]);
        let mut store = wm.clone();
        let mut orchestrator = FilteringOrchestrator::new(Some("beta".to_string()), 64);

        let report = orchestrator
            .run(
                Trigger::WindowCreated {
                    window_id: browser,
                    pid: Some(browser_pid),
                    marks: None,
                },
                &mut store,
                &resolver,
            )
            .expect("fast path");
        assert!(report.hidden.is_empty());
        assert!(wm.marks_of(browser).is_empty());
        assert_eq!(wm.marks_of(terminal), vec!["winscope_scratchpad:alpha"]);
        let record = orchestrator.audit().latest_for(browser).expect("audit record");
        assert_eq!(record.identity.source, IdentitySource::None);
    }

    #[test]
    fn unsettled_scratchpad_launch_is_not_marked_by_filtering() {
        let wm = FakeWindowManager::new();
        let processes = FakeProcesses::default();
        let resolver = resolver(&processes);
        let pad = WindowIdentity::scratchpad("alpha", IdentitySource::Environment).expect("pad");
        let pid = processes.spawn_inherited(resolver.begin_launch(&pad));
        let window = wm.add_window(pid, "foot", 1, &[]);
        let mut store = wm.clone();
        let mut orchestrator = FilteringOrchestrator::new(None, 64);

        orchestrator
            .run(
                Trigger::DirectSwitch {
                    project: "alpha".to_string(),
                },
                &mut store,
                &resolver,
            )
            .expect("switch");
        assert!(wm.marks_of(window).is_empty());
        assert_eq!(resolver.pending_launches(), 1);
    }

    #[test]
    fn floating_window_comes_back_floating() {
        let wm = FakeWindowManager::new();
        let tiled = wm.add_window(100, "code", 2, &["winscope_scoped:alpha:code:1"]);
        let floating = wm.add_window(101, "pavucontrol", 2, &["winscope_scoped:alpha:pavucontrol:2"]);
        wm.set_floating(floating, true);
        let processes = FakeProcesses::default();
        let resolver = resolver(&processes);
        let mut store = wm.clone();
        let mut orchestrator = FilteringOrchestrator::new(Some("alpha".to_string()), 64);

        for project in ["beta", "alpha"] {
            orchestrator
                .run(
                    Trigger::DirectSwitch {
                        project: project.to_string(),
                    },
                    &mut store,
                    &resolver,
                )
                .expect("switch");
        }
        assert!(wm.is_visible(floating));
        assert!(wm.is_floating(floating));
        assert_eq!(wm.workspace_of(floating), Some(2));
        assert!(wm.is_visible(tiled));
        assert!(!wm.is_floating(tiled));
    }

    #[test]
    fn vanished_new_window_is_not_an_error() {
        let wm = FakeWindowManager::new();
        let processes = FakeProcesses::default();
        let resolver = resolver(&processes);
        let mut store = wm.clone();
        let mut orchestrator = FilteringOrchestrator::new(Some("alpha".to_string()), 64);

        let report = orchestrator
            .run(
                Trigger::WindowCreated {
                    window_id: 999,
                    pid: None,
                    marks: None,
                },
                &mut store,
                &resolver,
            )
            .expect("fast path");
        assert_eq!(report.evaluated, 0);
    }
}
