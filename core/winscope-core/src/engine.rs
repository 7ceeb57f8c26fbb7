//! ScopeEngine - the single owner of all winscope runtime state.
//!
//! The engine is designed to be:
//! - **Synchronous**: every call runs to completion on the caller's thread
//! - **Single-writer**: the daemon's event loop is the only caller, so the
//!   scratchpad registry and the audit trail need no locking
//! - **Injectable**: the window manager, process table and launcher are
//!   trait objects, so tests run against the fakes in [`crate::testing`]
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use winscope_core::{load_config, ScopeEngine, Trigger};
//!
//! let config = load_config(None)?;
//! let mut engine = ScopeEngine::with_system(&config)?;
//! engine.startup()?;
//! let report = engine.dispatch(Trigger::DirectSwitch { project: "alpha".into() })?;
//! ```

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use winscope_daemon_protocol::{validate_name, validate_project_name};

use crate::audit::VisibilityDecision;
use crate::config::ScopeConfig;
use crate::error::{Result, ScopeError};
use crate::identity::IdentityResolver;
use crate::launcher::{CommandLauncher, Launcher};
use crate::layout::{capture, LayoutRestorer, LayoutStore, RestoreReport};
use crate::mark_store::{MarkStore, SwayMarkStore};
use crate::marks::MARK_NAMESPACE;
use crate::orchestrator::{FilterReport, FilteringOrchestrator, Trigger};
use crate::process::{ProcessInspector, ProcessProbe, SystemProcesses};
use crate::scratchpad::{
    CloseOutcome, ScratchpadConfig, ScratchpadManager, ScratchpadRegistry,
    ScratchpadRegistryEntry, ToggleOutcome,
};

/// Collaborators the engine drives.
pub struct EngineParts {
    pub store: Box<dyn MarkStore>,
    pub inspector: Box<dyn ProcessInspector>,
    pub probe: Box<dyn ProcessProbe>,
    pub launcher: Box<dyn Launcher>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowClosedReport {
    pub window_id: i64,
    pub marks_removed: usize,
    pub scratchpad_released: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SavedLayoutSummary {
    pub project: String,
    pub layout: String,
    pub path: PathBuf,
    pub windows: usize,
}

pub struct ScopeEngine {
    store: Box<dyn MarkStore>,
    resolver: IdentityResolver,
    probe: Box<dyn ProcessProbe>,
    launcher: Box<dyn Launcher>,
    orchestrator: FilteringOrchestrator,
    registry: ScratchpadRegistry,
    layouts: LayoutStore,
    scratchpad: ScratchpadConfig,
    layout_poll_interval: Duration,
}

impl ScopeEngine {
    pub fn new(config: &ScopeConfig, parts: EngineParts) -> Result<Self> {
        Self::with_layouts(config, parts, LayoutStore::new(config.layouts_dir()?))
    }

    /// Like [`ScopeEngine::new`] with an explicit layout store, for callers
    /// (mostly tests) that should not touch the home directory.
    pub fn with_layouts(config: &ScopeConfig, parts: EngineParts, layouts: LayoutStore) -> Result<Self> {
        if let Some(project) = &config.orchestrator.initial_project {
            validate_project_name(project)?;
        }
        Ok(Self {
            store: parts.store,
            resolver: IdentityResolver::new(parts.inspector),
            probe: parts.probe,
            launcher: parts.launcher,
            orchestrator: FilteringOrchestrator::new(
                config.orchestrator.initial_project.clone(),
                config.audit.capacity,
            ),
            registry: ScratchpadRegistry::default(),
            layouts,
            scratchpad: config.scratchpad_config(),
            layout_poll_interval: config.layout_poll_interval(),
        })
    }

    /// Engine wired to the real window manager, `/proc` and process spawning.
    pub fn with_system(config: &ScopeConfig) -> Result<Self> {
        Self::new(
            config,
            EngineParts {
                store: Box::new(SwayMarkStore::new(config.ipc_settings())),
                inspector: Box::new(SystemProcesses),
                probe: Box::new(SystemProcesses),
                launcher: Box::new(CommandLauncher),
            },
        )
    }

    /// Rebuilds the scratchpad registry from marks in the live tree.
    pub fn startup(&mut self) -> Result<usize> {
        let tree = self.store.query_tree()?;
        let restored = self.registry.rebuild_from_tree(&tree, self.probe.as_ref());
        info!(
            windows = tree.windows.len(),
            scratchpads = restored,
            "Engine state rebuilt from window tree"
        );
        Ok(restored)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Filtering
    // ─────────────────────────────────────────────────────────────────────────────

    /// The one entry point for tick, direct and window-created triggers.
    pub fn dispatch(&mut self, trigger: Trigger) -> Result<FilterReport> {
        if let Trigger::TickSwitch { project } | Trigger::DirectSwitch { project } = &trigger {
            validate_project_name(project)?;
        }
        self.orchestrator
            .run(trigger, self.store.as_mut(), &self.resolver)
    }

    pub fn active_project(&self) -> Option<&str> {
        self.orchestrator.active_project()
    }

    /// Drops every trace of a closed window: its winscope marks, its
    /// scratchpad registration and its cached workspace.
    pub fn window_closed(&mut self, window_id: i64) -> Result<WindowClosedReport> {
        let marks_removed = match self.store.remove_marks(window_id, MARK_NAMESPACE) {
            Ok(count) => count,
            Err(err) if err.is_not_found() => {
                debug!(window_id, "Closed window already gone from tree");
                0
            }
            Err(err) => return Err(err),
        };
        let released = self.registry.remove_window(window_id);
        if let Some(entry) = &released {
            info!(window_id, project = %entry.project, "Scratchpad window closed");
        }
        self.orchestrator.forget_window(window_id);
        Ok(WindowClosedReport {
            window_id,
            marks_removed,
            scratchpad_released: released.map(|entry| entry.project),
        })
    }

    pub fn audit(&self, window_id: Option<i64>, limit: usize) -> Vec<VisibilityDecision> {
        self.orchestrator.audit().recent(window_id, limit)
    }

    pub fn audit_len(&self) -> usize {
        self.orchestrator.audit().len()
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Scratchpads
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn toggle_scratchpad(
        &mut self,
        project: &str,
        working_directory: Option<&Path>,
    ) -> Result<ToggleOutcome> {
        if let Some(dir) = working_directory {
            if !dir.is_absolute() {
                return Err(ScopeError::validation(
                    "working_directory",
                    format!("{} is not absolute", dir.display()),
                ));
            }
        }
        let mut manager = ScratchpadManager {
            store: self.store.as_mut(),
            resolver: &self.resolver,
            probe: self.probe.as_ref(),
            launcher: self.launcher.as_ref(),
            config: &self.scratchpad,
        };
        let outcome = manager.toggle(&mut self.registry, project, working_directory)?;
        info!(project, outcome = ?outcome, "Scratchpad toggled");
        Ok(outcome)
    }

    pub fn close_scratchpad(&mut self, project: &str) -> Result<CloseOutcome> {
        let mut manager = ScratchpadManager {
            store: self.store.as_mut(),
            resolver: &self.resolver,
            probe: self.probe.as_ref(),
            launcher: self.launcher.as_ref(),
            config: &self.scratchpad,
        };
        manager.close(&mut self.registry, project)
    }

    pub fn scratchpads(&self) -> Vec<ScratchpadRegistryEntry> {
        self.registry.entries().cloned().collect()
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Layouts
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn restore_layout(&mut self, project: &str, name: &str) -> Result<RestoreReport> {
        let layout = self.layouts.load(project, name)?;
        if layout.project != project || layout.name != name {
            return Err(ScopeError::validation(
                "layout",
                format!(
                    "file for {}/{} describes {}/{}",
                    project, name, layout.project, layout.name
                ),
            ));
        }
        let mut restorer = LayoutRestorer {
            store: self.store.as_mut(),
            resolver: &self.resolver,
            launcher: self.launcher.as_ref(),
            active_project: self.orchestrator.active_project(),
            poll_interval: self.layout_poll_interval,
        };
        let report = restorer.restore(&layout)?;
        for parked in &report.parked {
            self.orchestrator
                .remember_workspace(parked.window_id, parked.workspace, parked.floating);
        }
        Ok(report)
    }

    pub fn save_layout(
        &mut self,
        project: &str,
        name: &str,
        include_global: bool,
    ) -> Result<SavedLayoutSummary> {
        validate_project_name(project)?;
        validate_name(name, "layout")?;
        let tree = self.store.query_tree()?;
        let layout = capture(&tree, &self.resolver, project, name, include_global)?;
        let path = self.layouts.save(&layout)?;
        info!(project, layout = name, path = %path.display(), "Layout saved");
        Ok(SavedLayoutSummary {
            project: project.to_string(),
            layout: name.to_string(),
            path,
            windows: layout.windows.len(),
        })
    }

    pub fn list_layouts(&self, project: &str) -> Result<Vec<String>> {
        self.layouts.list(project).map_err(|err| {
            warn!(project, error = %err, "Failed to list layouts");
            err
        })
    }
}
