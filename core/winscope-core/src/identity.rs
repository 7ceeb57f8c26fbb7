//! Window Identity Resolver.
//!
//! Classification order, first match wins:
//!
//! 1. a scratchpad mark
//! 2. a scoped/global ownership mark
//! 3. the reserved `WINSCOPE_*` variables in the owning process environment
//! 4. an unclassified global identity
//!
//! Marks come for free with the tree query; the environment costs a
//! filesystem read per window and only matters for windows that have not
//! been marked yet (typically right after launch).
//!
//! Environment variables are inherited by every descendant of a launched
//! process, so the environment step only trusts variables that carry the
//! [`ENV_LAUNCH_ID`] of a launch this resolver issued and has not settled,
//! and only for the first window that presents it. Anything else (a browser
//! opened from a scratchpad shell, a stale id from an earlier daemon) is
//! unclassified.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use winscope_daemon_protocol::validate_name;

use crate::error::{Result, ScopeError};
use crate::marks::{
    find_ownership, find_scratchpad, global_mark, parse_marks, scoped_mark, scratchpad_mark,
    MarkIdentity, StructuredMark,
};
use crate::process::ProcessInspector;
use crate::tree::WindowNode;

pub const ENV_APP_NAME: &str = "WINSCOPE_APP_NAME";
pub const ENV_SCOPE: &str = "WINSCOPE_SCOPE";
pub const ENV_PROJECT: &str = "WINSCOPE_PROJECT";
pub const ENV_SCRATCHPAD: &str = "WINSCOPE_SCRATCHPAD";
pub const ENV_LAUNCH_ID: &str = "WINSCOPE_LAUNCH_ID";

/// How long an unsettled launch id keeps vouching for its environment.
const LAUNCH_TTL: Duration = Duration::from_secs(300);

/// Application name every scratchpad terminal is classified under.
pub const SCRATCHPAD_APP_NAME: &str = "scratchpad-terminal";
pub const UNKNOWN_APP_NAME: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Scoped,
    Global,
}

impl Scope {
    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "scoped" => Some(Scope::Scoped),
            "global" => Some(Scope::Global),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Scoped => "scoped",
            Scope::Global => "global",
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::Scoped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentitySource {
    Mark,
    Environment,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowIdentity {
    pub app_name: String,
    pub scope: Scope,
    pub project: Option<String>,
    pub workspace: Option<i32>,
    pub is_scratchpad: bool,
    pub source: IdentitySource,
}

impl WindowIdentity {
    pub fn scoped(app_name: &str, project: &str, source: IdentitySource) -> Result<Self> {
        validate_name(app_name, "app_name")?;
        validate_name(project, "project")?;
        Ok(Self {
            app_name: app_name.to_string(),
            scope: Scope::Scoped,
            project: Some(project.to_string()),
            workspace: None,
            is_scratchpad: false,
            source,
        })
    }

    pub fn global(app_name: &str, source: IdentitySource) -> Result<Self> {
        validate_name(app_name, "app_name")?;
        Ok(Self {
            app_name: app_name.to_string(),
            scope: Scope::Global,
            project: None,
            workspace: None,
            is_scratchpad: false,
            source,
        })
    }

    pub fn scratchpad(project: &str, source: IdentitySource) -> Result<Self> {
        let mut identity = Self::scoped(SCRATCHPAD_APP_NAME, project, source)?;
        identity.is_scratchpad = true;
        Ok(identity)
    }

    pub fn unclassified(app_name: Option<&str>) -> Self {
        let app_name = app_name
            .filter(|name| validate_name(name, "app_name").is_ok())
            .unwrap_or(UNKNOWN_APP_NAME);
        Self {
            app_name: app_name.to_string(),
            scope: Scope::Global,
            project: None,
            workspace: None,
            is_scratchpad: false,
            source: IdentitySource::None,
        }
    }

    pub fn belongs_to(&self, app_name: &str, project: Option<&str>) -> bool {
        self.app_name == app_name && self.project.as_deref() == project
    }

    /// Environment variables that make a launched process resolve to this
    /// identity through the environment fallback.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            (ENV_APP_NAME.to_string(), self.app_name.clone()),
            (ENV_SCOPE.to_string(), self.scope.as_str().to_string()),
        ];
        if let Some(project) = &self.project {
            vars.push((ENV_PROJECT.to_string(), project.clone()));
        }
        if self.is_scratchpad {
            vars.push((ENV_SCRATCHPAD.to_string(), "1".to_string()));
        }
        vars
    }

    /// Marks that encode this identity on `window_id`.
    pub fn marks(&self, window_id: i64) -> Result<Vec<StructuredMark>> {
        match (self.is_scratchpad, self.scope, self.project.as_deref()) {
            (true, _, Some(project)) => Ok(vec![scratchpad_mark(project)?]),
            (false, Scope::Scoped, Some(project)) => {
                Ok(vec![scoped_mark(project, &self.app_name, window_id)?])
            }
            (false, Scope::Global, _) => Ok(vec![global_mark(&self.app_name, window_id)?]),
            _ => Err(ScopeError::validation(
                "identity",
                "scoped identity is missing its project",
            )),
        }
    }
}

impl fmt::Display for WindowIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.project {
            Some(project) => write!(f, "{}@{} ({})", self.app_name, project, self.scope.as_str()),
            None => write!(f, "{} ({})", self.app_name, self.scope.as_str()),
        }
    }
}

#[derive(Debug)]
struct PendingLaunch {
    identity: WindowIdentity,
    issued: Instant,
    /// The one window this launch vouches for, bound on first sight.
    window_id: Option<i64>,
}

#[derive(Debug, Default)]
struct LaunchLedger {
    issued: u64,
    pending: HashMap<String, PendingLaunch>,
}

impl LaunchLedger {
    fn prune(&mut self) {
        self.pending
            .retain(|_, launch| launch.issued.elapsed() < LAUNCH_TTL);
    }
}

fn same_identity(a: &WindowIdentity, b: &WindowIdentity) -> bool {
    a.app_name == b.app_name
        && a.scope == b.scope
        && a.project == b.project
        && a.is_scratchpad == b.is_scratchpad
}

pub struct IdentityResolver {
    inspector: Box<dyn ProcessInspector>,
    launches: Mutex<LaunchLedger>,
}

impl IdentityResolver {
    pub fn new(inspector: Box<dyn ProcessInspector>) -> Self {
        Self {
            inspector,
            launches: Mutex::new(LaunchLedger::default()),
        }
    }

    pub fn inspector(&self) -> &dyn ProcessInspector {
        self.inspector.as_ref()
    }

    fn ledger(&self) -> MutexGuard<'_, LaunchLedger> {
        self.launches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a launch of `identity` and returns the variables to start
    /// it with. Windows of the launched process tree resolve through the
    /// environment until [`IdentityResolver::settle_launch`] is called.
    pub fn begin_launch(&self, identity: &WindowIdentity) -> Vec<(String, String)> {
        let mut ledger = self.ledger();
        ledger.prune();
        ledger.issued += 1;
        let launch_id = format!(
            "{}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_millis(),
            ledger.issued
        );
        ledger.pending.insert(
            launch_id.clone(),
            PendingLaunch {
                identity: identity.clone(),
                issued: Instant::now(),
                window_id: None,
            },
        );
        debug!(launch_id = %launch_id, identity = %identity, "Issued launch id");

        let mut vars = identity.environment();
        vars.push((ENV_LAUNCH_ID.to_string(), launch_id));
        vars
    }

    /// Retires the launch id carried by `pid`, once its window holds marks.
    /// Later windows of the same process tree no longer classify through
    /// the environment.
    pub fn settle_launch(&self, pid: Option<u32>) -> bool {
        let Some(launch_id) = pid
            .filter(|pid| *pid > 0)
            .and_then(|pid| self.inspector.environment(pid))
            .and_then(|mut env| env.remove(ENV_LAUNCH_ID))
        else {
            return false;
        };
        let settled = self.ledger().pending.remove(launch_id.trim()).is_some();
        if settled {
            debug!(launch_id = %launch_id, "Settled launch id");
        }
        settled
    }

    pub fn pending_launches(&self) -> usize {
        let mut ledger = self.ledger();
        ledger.prune();
        ledger.pending.len()
    }

    fn vouches_for(&self, env: &HashMap<String, String>, identity: &WindowIdentity, window_id: i64) -> bool {
        let Some(launch_id) = env.get(ENV_LAUNCH_ID).map(|value| value.trim()) else {
            return false;
        };
        let mut ledger = self.ledger();
        ledger.prune();
        let Some(launch) = ledger.pending.get_mut(launch_id) else {
            return false;
        };
        if !same_identity(&launch.identity, identity) {
            return false;
        }
        match launch.window_id {
            Some(bound) => bound == window_id,
            None => {
                launch.window_id = Some(window_id);
                true
            }
        }
    }

    pub fn resolve(&self, window_id: i64, marks: &[String], pid: Option<u32>) -> WindowIdentity {
        let parsed = parse_marks(marks);

        if let Some(MarkIdentity::Scratchpad { project }) = find_scratchpad(&parsed) {
            if let Ok(identity) = WindowIdentity::scratchpad(&project, IdentitySource::Mark) {
                return identity;
            }
        }

        if let Some(identity) = find_ownership(&parsed).and_then(|found| match found {
            MarkIdentity::Scoped { project, app_name } => {
                WindowIdentity::scoped(&app_name, &project, IdentitySource::Mark).ok()
            }
            MarkIdentity::Global { app_name } => {
                WindowIdentity::global(&app_name, IdentitySource::Mark).ok()
            }
            MarkIdentity::Scratchpad { .. } => None,
        }) {
            return identity;
        }

        if let Some(pid) = pid.filter(|pid| *pid > 0) {
            match self.inspector.environment(pid) {
                Some(env) => match identity_from_environment(&env) {
                    Ok(Some(identity)) if self.vouches_for(&env, &identity, window_id) => return identity,
                    Ok(Some(identity)) => {
                        debug!(window_id, pid, identity = %identity, "Ignored inherited identity environment");
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(window_id, pid, error = %err, "Rejected malformed identity environment");
                    }
                },
                None => debug!(window_id, pid, "Process environment unavailable"),
            }
        }

        WindowIdentity::unclassified(None)
    }

    /// Resolves a tree window, filling in workspace and a best-effort app name.
    pub fn resolve_node(&self, node: &WindowNode) -> WindowIdentity {
        let mut identity = self.resolve(node.id, &node.marks, node.pid);
        if identity.source == IdentitySource::None {
            identity = WindowIdentity::unclassified(node.app_hint.as_deref());
        }
        identity.workspace = node.workspace;
        identity
    }
}

/// Builds an identity from the reserved variables.
///
/// `Ok(None)` means the process carries no identity at all; `Err` means it
/// carries one that is malformed.
pub fn identity_from_environment(env: &HashMap<String, String>) -> Result<Option<WindowIdentity>> {
    let project = env
        .get(ENV_PROJECT)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty());
    let is_scratchpad = env
        .get(ENV_SCRATCHPAD)
        .map(|value| matches!(value.trim(), "1" | "true"))
        .unwrap_or(false);

    if is_scratchpad {
        let project = project
            .ok_or_else(|| ScopeError::validation(ENV_PROJECT, "scratchpad without project"))?;
        return WindowIdentity::scratchpad(project, IdentitySource::Environment).map(Some);
    }

    let Some(app_name) = env.get(ENV_APP_NAME).map(|value| value.trim()) else {
        return Ok(None);
    };

    let scope = match env.get(ENV_SCOPE) {
        Some(raw) => Scope::parse(raw)
            .ok_or_else(|| ScopeError::validation(ENV_SCOPE, format!("unknown scope '{}'", raw)))?,
        None if project.is_some() => Scope::Scoped,
        None => Scope::Global,
    };

    match scope {
        Scope::Scoped => {
            let project = project
                .ok_or_else(|| ScopeError::validation(ENV_PROJECT, "scoped without project"))?;
            WindowIdentity::scoped(app_name, project, IdentitySource::Environment).map(Some)
        }
        Scope::Global => WindowIdentity::global(app_name, IdentitySource::Environment).map(Some),
    }
}
