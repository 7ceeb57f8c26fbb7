//! IPC protocol types and validation for winscope-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const ERROR_TOO_MANY_CONNECTIONS: &str = "too_many_connections";
pub const ERROR_SUPERSEDED: &str = "superseded";

/// Prefix of window-manager tick payloads that request a project switch.
pub const TICK_SWITCH_PREFIX: &str = "project:switch:";

const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    SwitchProject,
    GetActiveProject,
    WindowEvent,
    ToggleScratchpad,
    CloseScratchpad,
    ListScratchpads,
    RestoreLayout,
    SaveLayout,
    ListLayouts,
    GetAudit,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Method params
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SwitchProjectParams {
    pub project: String,
}

impl SwitchProjectParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        validate_project_name(&self.project)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScratchpadParams {
    pub project: String,
    #[serde(default)]
    pub working_directory: Option<String>,
}

impl ScratchpadParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        validate_project_name(&self.project)?;
        if let Some(dir) = &self.working_directory {
            if !dir.starts_with('/') {
                return Err(ErrorInfo::new(
                    "validation_error",
                    "working_directory must be an absolute path",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LayoutParams {
    pub project: String,
    pub layout: String,
    /// Only consulted by `save_layout`: also capture global windows.
    #[serde(default)]
    pub include_global: bool,
}

impl LayoutParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        validate_project_name(&self.project)?;
        validate_name(&self.layout, "layout")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ListLayoutsParams {
    pub project: String,
}

impl ListLayoutsParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        validate_project_name(&self.project)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindowChange {
    Created,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WindowEventParams {
    pub change: WindowChange,
    pub window_id: i64,
    #[serde(default)]
    pub pid: Option<u32>,
}

impl WindowEventParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.window_id <= 0 {
            return Err(ErrorInfo::new(
                "validation_error",
                "window_id must be positive",
            ));
        }
        if self.pid == Some(0) {
            return Err(ErrorInfo::new("validation_error", "pid must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AuditParams {
    #[serde(default)]
    pub window_id: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Decodes and validates method params in one step.
pub fn parse_params<T>(params: Option<Value>) -> Result<T, ErrorInfo>
where
    T: for<'de> Deserialize<'de>,
{
    let params = params.ok_or_else(|| ErrorInfo::new("invalid_params", "params are required"))?;
    serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("params are invalid: {}", err)))
}

// ─────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────

static RE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

/// Project names end up inside window marks and window-manager commands,
/// so the accepted alphabet is deliberately narrow.
pub fn validate_project_name(name: &str) -> Result<(), ErrorInfo> {
    validate_name(name, "project")
}

pub fn validate_name(name: &str, field: &str) -> Result<(), ErrorInfo> {
    if name.trim().is_empty() {
        return Err(ErrorInfo::new(
            "validation_error",
            format!("{} is required", field),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ErrorInfo::new(
            "validation_error",
            format!("{} must be {} characters or fewer", field, MAX_NAME_LEN),
        ));
    }
    if !RE_NAME.is_match(name) {
        return Err(ErrorInfo::new(
            "validation_error",
            format!(
                "{} must start with a letter or digit and contain only letters, digits, '.', '_' or '-'",
                field
            ),
        ));
    }
    Ok(())
}

/// Extracts the project from a `project:switch:<name>` tick payload.
///
/// Returns `Ok(None)` for ticks that are not switch requests.
pub fn parse_tick_payload(payload: &str) -> Result<Option<String>, ErrorInfo> {
    let Some(project) = payload.trim().strip_prefix(TICK_SWITCH_PREFIX) else {
        return Ok(None);
    };
    validate_project_name(project)?;
    Ok(Some(project.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_simple_project_names() {
        assert!(validate_project_name("alpha").is_ok());
        assert!(validate_project_name("nixos-config").is_ok());
        assert!(validate_project_name("v1.2_rc").is_ok());
    }

    #[test]
    fn rejects_names_that_would_break_marks() {
        assert!(validate_project_name("").is_err());
        assert!(validate_project_name("  ").is_err());
        assert!(validate_project_name("a:b").is_err());
        assert!(validate_project_name("a b").is_err());
        assert!(validate_project_name("-leading").is_err());
        assert!(validate_project_name("quote\"d").is_err());
        assert!(validate_project_name(&"a".repeat(65)).is_err());
        assert!(validate_project_name("ålpha").is_err());
        assert!(validate_project_name("alpha\n").is_err());
    }

    #[test]
    fn tick_payload_yields_project() {
        let parsed = parse_tick_payload("project:switch:beta").expect("valid payload");
        assert_eq!(parsed.as_deref(), Some("beta"));
    }

    #[test]
    fn unrelated_tick_payload_is_ignored() {
        assert_eq!(parse_tick_payload("bar:refresh").expect("ignored"), None);
        assert_eq!(parse_tick_payload("").expect("ignored"), None);
    }

    #[test]
    fn malformed_tick_project_is_rejected() {
        let err = parse_tick_payload("project:switch:").expect_err("empty project");
        assert_eq!(err.code, "validation_error");
    }

    #[test]
    fn window_event_requires_positive_id() {
        let params = WindowEventParams {
            change: WindowChange::Created,
            window_id: 0,
            pid: Some(10),
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn parse_params_rejects_unknown_fields() {
        let result: Result<SwitchProjectParams, _> =
            parse_params(Some(json!({"project": "alpha", "extra": true})));
        assert_eq!(result.expect_err("unknown field").code, "invalid_params");
    }

    #[test]
    fn scratchpad_params_require_absolute_directory() {
        let params = ScratchpadParams {
            project: "alpha".to_string(),
            working_directory: Some("relative/dir".to_string()),
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn method_round_trips_as_snake_case() {
        let value = serde_json::to_value(Method::ToggleScratchpad).expect("serialize");
        assert_eq!(value, json!("toggle_scratchpad"));
    }
}
