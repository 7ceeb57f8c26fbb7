//! Scratchpad Lifecycle Manager.
//!
//! Keeps at most one floating terminal per project. The registry lookup and
//! liveness check always run before any launch decision, and a launch only
//! happens after the live tree has been searched for an existing terminal
//! of the same project.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use winscope_daemon_protocol::validate_project_name;

use crate::error::{Result, ScopeError};
use crate::identity::{IdentityResolver, IdentitySource, WindowIdentity};
use crate::launcher::{LaunchRequest, Launcher};
use crate::mark_store::MarkStore;
use crate::marks::{find_scratchpad, parse_marks, scratchpad_mark, MarkIdentity, MARK_NAMESPACE};
use crate::process::ProcessProbe;
use crate::tree::{WindowNode, WindowTreeSnapshot};

#[derive(Debug, Clone)]
pub struct ScratchpadConfig {
    pub command: String,
    pub width_ppt: u8,
    pub height_ppt: u8,
    pub launch_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ScratchpadConfig {
    fn default() -> Self {
        Self {
            command: "foot".to_string(),
            width_ppt: 80,
            height_ppt: 70,
            launch_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScratchpadRegistryEntry {
    pub project: String,
    pub window_id: i64,
    pub pid: u32,
    pub working_directory: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub last_shown_at: Option<DateTime<Utc>>,
    /// Process start time, used to tell a recycled pid from the terminal.
    pub process_started: Option<u64>,
}

/// Project name → live scratchpad terminal.
#[derive(Debug, Default)]
pub struct ScratchpadRegistry {
    entries: BTreeMap<String, ScratchpadRegistryEntry>,
}

impl ScratchpadRegistry {
    pub fn get(&self, project: &str) -> Option<&ScratchpadRegistryEntry> {
        self.entries.get(project)
    }

    pub fn insert(&mut self, entry: ScratchpadRegistryEntry) -> Option<ScratchpadRegistryEntry> {
        self.entries.insert(entry.project.clone(), entry)
    }

    pub fn remove(&mut self, project: &str) -> Option<ScratchpadRegistryEntry> {
        self.entries.remove(project)
    }

    pub fn remove_window(&mut self, window_id: i64) -> Option<ScratchpadRegistryEntry> {
        let project = self
            .entries
            .values()
            .find(|entry| entry.window_id == window_id)
            .map(|entry| entry.project.clone())?;
        self.entries.remove(&project)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ScratchpadRegistryEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-registers every live window carrying a scratchpad mark.
    pub fn rebuild_from_tree(&mut self, tree: &WindowTreeSnapshot, probe: &dyn ProcessProbe) -> usize {
        let mut restored = 0;
        for window in &tree.windows {
            let Some(MarkIdentity::Scratchpad { project }) = find_scratchpad(&parse_marks(&window.marks))
            else {
                continue;
            };
            let Some(pid) = window.pid.filter(|pid| probe.is_alive(*pid)) else {
                debug!(window_id = window.id, project = %project, "Skipping scratchpad with dead process");
                continue;
            };
            if self.entries.contains_key(&project) {
                continue;
            }
            self.insert(ScratchpadRegistryEntry {
                project,
                window_id: window.id,
                pid,
                working_directory: None,
                created_at: Utc::now(),
                last_shown_at: window.visible.then(Utc::now),
                process_started: probe.start_time(pid),
            });
            restored += 1;
        }
        restored
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToggleOutcome {
    Created { window_id: i64, pid: u32 },
    Shown { window_id: i64 },
    Hidden { window_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CloseOutcome {
    Closed { window_id: i64 },
    NotFound,
}

pub struct ScratchpadManager<'a> {
    pub store: &'a mut dyn MarkStore,
    pub resolver: &'a IdentityResolver,
    pub probe: &'a dyn ProcessProbe,
    pub launcher: &'a dyn Launcher,
    pub config: &'a ScratchpadConfig,
}

impl<'a> ScratchpadManager<'a> {
    pub fn toggle(
        &mut self,
        registry: &mut ScratchpadRegistry,
        project: &str,
        working_directory: Option<&Path>,
    ) -> Result<ToggleOutcome> {
        validate_project_name(project)?;

        if let Some(entry) = registry.get(project).cloned() {
            if self.probe.is_alive_verified(entry.pid, entry.process_started) {
                match self.flip(registry, &entry)? {
                    Some(outcome) => return Ok(outcome),
                    None => {
                        debug!(project, window_id = entry.window_id, "Registered scratchpad window is gone");
                    }
                }
            } else {
                info!(project, pid = entry.pid, "Scratchpad process is dead; replacing it");
            }
            registry.remove(project);
        }

        let tree = self.store.query_tree()?;
        if let Some(entry) = self.adopt(&tree, project)? {
            registry.insert(entry.clone());
            if let Some(outcome) = self.flip(registry, &entry)? {
                return Ok(outcome);
            }
            registry.remove(project);
        }

        let entry = self.launch(project, working_directory)?;
        let outcome = ToggleOutcome::Created {
            window_id: entry.window_id,
            pid: entry.pid,
        };
        registry.insert(entry);
        Ok(outcome)
    }

    pub fn close(&mut self, registry: &mut ScratchpadRegistry, project: &str) -> Result<CloseOutcome> {
        validate_project_name(project)?;
        let mark = scratchpad_mark(project)?;
        let entry = registry.remove(project);

        let tree = self.store.query_tree()?;
        let target = tree
            .with_mark(&mark.to_string())
            .map(|window| window.id)
            .next()
            .or_else(|| {
                entry
                    .as_ref()
                    .map(|entry| entry.window_id)
                    .filter(|id| tree.find(*id).is_some())
            });

        let Some(window_id) = target else {
            return Ok(CloseOutcome::NotFound);
        };
        match self.store.close_window(window_id) {
            Ok(()) => {
                info!(project, window_id, "Closed scratchpad");
                Ok(CloseOutcome::Closed { window_id })
            }
            Err(err) if err.is_not_found() => Ok(CloseOutcome::NotFound),
            Err(err) => Err(err),
        }
    }

    /// Shows or hides the registered terminal. `None` means its window is
    /// no longer in the tree.
    fn flip(
        &mut self,
        registry: &mut ScratchpadRegistry,
        entry: &ScratchpadRegistryEntry,
    ) -> Result<Option<ToggleOutcome>> {
        let mark = scratchpad_mark(&entry.project)?;
        let tree = self.store.query_tree()?;
        let Some(window) = tree.find(entry.window_id) else {
            return Ok(None);
        };
        let on_screen = window.visible && window.workspace == tree.focused_workspace;

        let result = if on_screen {
            self.store.hide_marked(&mark)
        } else {
            self.store.show_marked_scratchpad(&mark)
        };
        match result {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        }

        if on_screen {
            debug!(project = %entry.project, window_id = window.id, "Scratchpad hidden");
            Ok(Some(ToggleOutcome::Hidden { window_id: window.id }))
        } else {
            if let Some(registered) = registry.entries.get_mut(&entry.project) {
                registered.last_shown_at = Some(Utc::now());
            }
            debug!(project = %entry.project, window_id = window.id, "Scratchpad shown");
            Ok(Some(ToggleOutcome::Shown { window_id: window.id }))
        }
    }

    /// Finds an unregistered terminal of `project` already in the tree and
    /// closes any duplicates beyond the first.
    fn adopt(&mut self, tree: &WindowTreeSnapshot, project: &str) -> Result<Option<ScratchpadRegistryEntry>> {
        let mut candidates: Vec<&WindowNode> = tree
            .windows
            .iter()
            .filter(|window| {
                let identity = self.resolver.resolve_node(window);
                identity.is_scratchpad && identity.project.as_deref() == Some(project)
            })
            .filter(|window| window.pid.map(|pid| self.probe.is_alive(pid)).unwrap_or(false))
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        // Prefer the window that already holds the mark.
        let mark = scratchpad_mark(project)?.to_string();
        candidates.sort_by_key(|window| !window.marks.contains(&mark));
        let keep = candidates[0];
        for duplicate in &candidates[1..] {
            warn!(project, window_id = duplicate.id, "Closing duplicate scratchpad");
            match self.store.close_window(duplicate.id) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        if !keep.marks.contains(&mark) {
            self.mark_terminal(keep.id, project)?;
            self.resolver.settle_launch(keep.pid);
        }

        let pid = keep.pid.unwrap_or_default();
        info!(project, window_id = keep.id, pid, "Adopted existing scratchpad");
        Ok(Some(ScratchpadRegistryEntry {
            project: project.to_string(),
            window_id: keep.id,
            pid,
            working_directory: self.resolver.inspector().working_directory(pid),
            created_at: Utc::now(),
            last_shown_at: None,
            process_started: self.probe.start_time(pid),
        }))
    }

    fn launch(&mut self, project: &str, working_directory: Option<&Path>) -> Result<ScratchpadRegistryEntry> {
        let identity = WindowIdentity::scratchpad(project, IdentitySource::Environment)?;
        let request = LaunchRequest::from_command_line(
            &self.config.command,
            self.resolver.begin_launch(&identity),
            working_directory.map(Path::to_path_buf),
        )?;
        let pid = self.launcher.launch(&request)?;
        info!(project, pid, command = %request.display(), "Launched scratchpad");

        let (window_id, window_pid) = self.wait_for_window(pid, project)?;
        self.mark_terminal(window_id, project)?;
        self.resolver.settle_launch(window_pid);
        self.store
            .float_centered(window_id, self.config.width_ppt, self.config.height_ppt)?;

        let now = Utc::now();
        Ok(ScratchpadRegistryEntry {
            project: project.to_string(),
            window_id,
            pid,
            working_directory: working_directory.map(Path::to_path_buf),
            created_at: now,
            last_shown_at: Some(now),
            process_started: self.probe.start_time(pid),
        })
    }

    /// Polls for the launched terminal's window. Terminals that hand off to
    /// a server process are found through the launch's environment.
    fn wait_for_window(&mut self, pid: u32, project: &str) -> Result<(i64, Option<u32>)> {
        let started = Instant::now();
        loop {
            let tree = self.store.query_tree()?;
            let found = tree.windows.iter().find(|window| {
                window.pid == Some(pid) || {
                    let identity = self.resolver.resolve_node(window);
                    identity.is_scratchpad
                        && identity.source == IdentitySource::Environment
                        && identity.project.as_deref() == Some(project)
                }
            });
            if let Some(window) = found {
                return Ok((window.id, window.pid));
            }
            if started.elapsed() >= self.config.launch_timeout {
                return Err(ScopeError::LaunchTimeout {
                    app: crate::identity::SCRATCHPAD_APP_NAME.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    fn mark_terminal(&mut self, window_id: i64, project: &str) -> Result<()> {
        self.store.remove_marks(window_id, MARK_NAMESPACE)?;
        self.store
            .apply_marks(window_id, &[scratchpad_mark(project)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessInspector;
    use crate::testing::{FakeLauncher, FakeProcesses, FakeWindowManager, LaunchBehavior};

    struct Fixture {
        wm: FakeWindowManager,
        processes: FakeProcesses,
        launcher: FakeLauncher,
        resolver: IdentityResolver,
        config: ScratchpadConfig,
        registry: ScratchpadRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let wm = FakeWindowManager::new();
            let processes = FakeProcesses::default();
            let launcher = FakeLauncher::new(wm.clone(), processes.clone());
            Self {
                resolver: IdentityResolver::new(Box::new(processes.clone())),
                wm,
                processes,
                launcher,
                config: ScratchpadConfig {
                    command: "foot".to_string(),
                    launch_timeout: Duration::from_millis(30),
                    poll_interval: Duration::from_millis(1),
                    ..ScratchpadConfig::default()
                },
                registry: ScratchpadRegistry::default(),
            }
        }

        fn toggle(&mut self, project: &str) -> Result<ToggleOutcome> {
            let mut store = self.wm.clone();
            let mut manager = ScratchpadManager {
                store: &mut store,
                resolver: &self.resolver,
                probe: &self.processes,
                launcher: &self.launcher,
                config: &self.config,
            };
            manager.toggle(&mut self.registry, project, None)
        }

        fn close(&mut self, project: &str) -> Result<CloseOutcome> {
            let mut store = self.wm.clone();
            let mut manager = ScratchpadManager {
                store: &mut store,
                resolver: &self.resolver,
                probe: &self.processes,
                launcher: &self.launcher,
                config: &self.config,
            };
            manager.close(&mut self.registry, project)
        }
    }

    #[test]
    fn first_toggle_creates_then_flips_visibility() {
        let mut fx = Fixture::new();
        let ToggleOutcome::Created { window_id, .. } = fx.toggle("alpha").expect("create") else {
            panic!("expected a new scratchpad");
        };
        assert!(fx.wm.is_floating(window_id));
        assert_eq!(fx.wm.marks_of(window_id), vec!["winscope_scratchpad:alpha"]);

        assert_eq!(fx.toggle("alpha").expect("hide"), ToggleOutcome::Hidden { window_id });
        assert!(!fx.wm.is_visible(window_id));
        assert_eq!(fx.toggle("alpha").expect("show"), ToggleOutcome::Shown { window_id });
        assert!(fx.wm.is_visible(window_id));
        assert_eq!(fx.launcher.launch_count(), 1);
    }

    #[test]
    fn launch_injects_identity_environment() {
        let mut fx = Fixture::new();
        fx.toggle("alpha").expect("create");
        let launches = fx.launcher.launches();
        assert!(launches[0]
            .environment
            .contains(&("WINSCOPE_SCRATCHPAD".to_string(), "1".to_string())));
        assert!(launches[0]
            .environment
            .contains(&("WINSCOPE_PROJECT".to_string(), "alpha".to_string())));
        assert!(launches[0]
            .environment
            .iter()
            .any(|(key, _)| key == "WINSCOPE_LAUNCH_ID"));
        assert_eq!(fx.resolver.pending_launches(), 0);
    }

    #[test]
    fn child_of_scratchpad_shell_is_never_adopted() {
        let mut fx = Fixture::new();
        let ToggleOutcome::Created { window_id: terminal, pid } = fx.toggle("alpha").expect("create")
        else {
            panic!("expected a new scratchpad");
        };
        fx.toggle("alpha").expect("hide");

        // A GUI app started from the terminal inherits its environment.
        let inherited = fx.processes.environment(pid).expect("terminal env");
        let browser_pid = fx.processes.spawn_inherited(inherited.into_iter().collect());
        let browser = fx.wm.add_window(browser_pid, "firefox", 1, &[]);

        // The terminal exits; the next toggle must start a new one.
        fx.processes.kill(pid);
        fx.wm.close(terminal);
        let outcome = fx.toggle("alpha").expect("recreate");
        let ToggleOutcome::Created { window_id, .. } = outcome else {
            panic!("expected a relaunch, got {:?}", outcome);
        };
        assert_ne!(window_id, browser);
        assert!(fx.wm.marks_of(browser).is_empty());
        assert_eq!(fx.wm.count_with_mark("winscope_scratchpad:alpha"), 1);
        assert_eq!(fx.launcher.launch_count(), 2);
    }

    #[test]
    fn dead_process_is_replaced() {
        let mut fx = Fixture::new();
        let ToggleOutcome::Created { window_id, pid } = fx.toggle("alpha").expect("create") else {
            panic!("expected a new scratchpad");
        };
        fx.processes.kill(pid);
        fx.wm.close(window_id);

        let outcome = fx.toggle("alpha").expect("recreate");
        assert!(matches!(outcome, ToggleOutcome::Created { .. }));
        assert_eq!(fx.registry.len(), 1);
        assert_eq!(fx.wm.count_with_mark("winscope_scratchpad:alpha"), 1);
    }

    #[test]
    fn unregistered_marked_terminal_is_adopted() {
        let mut fx = Fixture::new();
        let pid = fx.processes.spawn(&[]);
        let window = fx.wm.add_window(pid, "foot", 1, &["winscope_scratchpad:alpha"]);

        assert_eq!(
            fx.toggle("alpha").expect("adopt"),
            ToggleOutcome::Hidden { window_id: window }
        );
        assert_eq!(fx.launcher.launch_count(), 0);
        assert_eq!(fx.registry.get("alpha").map(|entry| entry.window_id), Some(window));
    }

    #[test]
    fn late_terminal_from_timed_out_launch_is_adopted_not_duplicated() {
        let mut fx = Fixture::new();
        fx.launcher.set_behavior("foot", LaunchBehavior::Delayed(1_000));
        let err = fx.toggle("alpha").unwrap_err();
        assert_eq!(err.code(), "launch_timeout");
        assert!(fx.registry.is_empty());

        // The terminal maps late, from a helper process of the same launch.
        let launch_env = fx.launcher.launches()[0].environment.clone();
        let pid = fx.processes.spawn_inherited(launch_env);
        let late = fx.wm.add_window(pid, "foot", 1, &[]);
        fx.launcher.set_behavior("foot", LaunchBehavior::Immediate);

        fx.toggle("alpha").expect("adopt");
        assert_eq!(fx.launcher.launch_count(), 1);
        assert_eq!(fx.wm.marks_of(late), vec!["winscope_scratchpad:alpha"]);
        assert_eq!(fx.resolver.pending_launches(), 0);
    }

    #[test]
    fn close_removes_entry_and_window() {
        let mut fx = Fixture::new();
        let ToggleOutcome::Created { window_id, .. } = fx.toggle("alpha").expect("create") else {
            panic!("expected a new scratchpad");
        };
        assert_eq!(fx.close("alpha").expect("close"), CloseOutcome::Closed { window_id });
        assert!(!fx.wm.exists(window_id));
        assert!(fx.registry.is_empty());
        assert_eq!(fx.close("alpha").expect("close again"), CloseOutcome::NotFound);
    }

    #[test]
    fn invalid_project_is_rejected_before_launch() {
        let mut fx = Fixture::new();
        let err = fx.toggle("bad name").unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert_eq!(fx.launcher.launch_count(), 0);
    }

    #[test]
    fn rebuild_skips_dead_processes() {
        let fx = Fixture::new();
        let live = fx.processes.spawn(&[]);
        let dead = fx.processes.spawn(&[]);
        fx.processes.kill(dead);
        fx.wm.add_hidden_window(live, "foot", &["winscope_scratchpad:alpha"]);
        fx.wm.add_hidden_window(dead, "foot", &["winscope_scratchpad:beta"]);

        let mut store = fx.wm.clone();
        let tree = store.query_tree().expect("tree");
        let mut registry = ScratchpadRegistry::default();
        assert_eq!(registry.rebuild_from_tree(&tree, &fx.processes), 1);
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("beta").is_none());
    }
}
