//! Structured window marks.
//!
//! A mark is a string of the form `<namespace>_<key>:<value>`. Identity marks
//! written by winscope live in the [`MARK_NAMESPACE`] namespace:
//!
//! - `winscope_scratchpad:<project>` tags the scratchpad terminal of a project
//! - `winscope_scoped:<project>:<app>:<window_id>` tags a project-owned window
//! - `winscope_global:<app>:<window_id>` tags a window visible in every project
//!
//! The window manager lets a mark sit on only one window at a time, so the
//! per-window identity marks carry the window id as their last segment.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use winscope_daemon_protocol::validate_name;

use crate::error::{Result, ScopeError};

pub const MARK_NAMESPACE: &str = "winscope";
pub const KEY_SCRATCHPAD: &str = "scratchpad";
pub const KEY_SCOPED: &str = "scoped";
pub const KEY_GLOBAL: &str = "global";

static RE_MARK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-z][a-z0-9-]*)_([a-z][a-z0-9-]*):(.+)$").unwrap());

/// Characters that would let a mark escape a quoted window-manager command.
static RE_UNSAFE_VALUE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[\s"'\\,;\[\]]"#).unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructuredMark {
    pub namespace: String,
    pub key: String,
    pub value: String,
}

impl StructuredMark {
    pub fn new(namespace: &str, key: &str, value: &str) -> Result<Self> {
        Self::parse(&format!("{}_{}:{}", namespace, key, value))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let captures = RE_MARK.captures(raw).ok_or_else(|| {
            ScopeError::validation("mark", format!("'{}' is not <namespace>_<key>:<value>", raw))
        })?;
        let value = &captures[3];
        if RE_UNSAFE_VALUE.is_match(value) {
            return Err(ScopeError::validation(
                "mark",
                format!("'{}' contains whitespace, quotes or separators", raw),
            ));
        }
        Ok(Self {
            namespace: captures[1].to_string(),
            key: captures[2].to_string(),
            value: value.to_string(),
        })
    }

    pub fn in_namespace(&self, namespace: &str) -> bool {
        self.namespace == namespace
    }

    fn is_own(&self, key: &str) -> bool {
        self.namespace == MARK_NAMESPACE && self.key == key
    }
}

impl fmt::Display for StructuredMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}:{}", self.namespace, self.key, self.value)
    }
}

/// Identity facts decoded from winscope marks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkIdentity {
    Scratchpad { project: String },
    Scoped { project: String, app_name: String },
    Global { app_name: String },
}

pub fn scratchpad_mark(project: &str) -> Result<StructuredMark> {
    validate_name(project, "project")?;
    StructuredMark::new(MARK_NAMESPACE, KEY_SCRATCHPAD, project)
}

pub fn scoped_mark(project: &str, app_name: &str, window_id: i64) -> Result<StructuredMark> {
    validate_name(project, "project")?;
    validate_name(app_name, "app_name")?;
    StructuredMark::new(
        MARK_NAMESPACE,
        KEY_SCOPED,
        &format!("{}:{}:{}", project, app_name, window_id),
    )
}

pub fn global_mark(app_name: &str, window_id: i64) -> Result<StructuredMark> {
    validate_name(app_name, "app_name")?;
    StructuredMark::new(
        MARK_NAMESPACE,
        KEY_GLOBAL,
        &format!("{}:{}", app_name, window_id),
    )
}

/// Parses raw mark strings, dropping (and logging) malformed ones.
///
/// Malformed marks are rejected here so they never reach the decision engine.
pub fn parse_marks(raw: &[String]) -> Vec<StructuredMark> {
    raw.iter()
        .filter_map(|value| match StructuredMark::parse(value) {
            Ok(mark) => Some(mark),
            Err(err) => {
                tracing::debug!(mark = %value, error = %err, "Ignoring malformed mark");
                None
            }
        })
        .collect()
}

pub fn find_scratchpad(marks: &[StructuredMark]) -> Option<MarkIdentity> {
    marks
        .iter()
        .filter(|mark| mark.is_own(KEY_SCRATCHPAD))
        .find_map(|mark| {
            validate_name(&mark.value, "project").ok()?;
            Some(MarkIdentity::Scratchpad {
                project: mark.value.clone(),
            })
        })
}

/// Finds the first well-formed scoped or global ownership mark.
pub fn find_ownership(marks: &[StructuredMark]) -> Option<MarkIdentity> {
    marks.iter().find_map(|mark| {
        if mark.is_own(KEY_SCOPED) {
            let mut parts = mark.value.splitn(3, ':');
            let project = parts.next()?;
            let app_name = parts.next()?;
            validate_name(project, "project").ok()?;
            validate_name(app_name, "app_name").ok()?;
            return Some(MarkIdentity::Scoped {
                project: project.to_string(),
                app_name: app_name.to_string(),
            });
        }
        if mark.is_own(KEY_GLOBAL) {
            let app_name = mark.value.split(':').next()?;
            validate_name(app_name, "app_name").ok()?;
            return Some(MarkIdentity::Global {
                app_name: app_name.to_string(),
            });
        }
        None
    })
}
