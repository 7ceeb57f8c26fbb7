//! Error types for winscope-core operations.

use std::path::PathBuf;

use winscope_daemon_protocol::ErrorInfo;

/// All errors that can occur in winscope-core operations.
///
/// The variants follow how far a failure is allowed to travel: `NotFound`
/// and `CommandRejected` stay local to one window, `LaunchTimeout` stays
/// local to one layout spec, and `Ipc` aborts the current trigger.
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    // ─────────────────────────────────────────────────────────────────────
    // Window manager errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IPC failure: {context}: {details}")]
    Ipc { context: String, details: String },

    #[error("Command rejected: {command}: {details}")]
    CommandRejected { command: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Launch errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Launch timed out: {app} did not present a window within {waited_ms}ms")]
    LaunchTimeout { app: String, waited_ms: u64 },

    #[error("Launch failed: {command}: {details}")]
    LaunchFailed { command: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Input errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Validation failed: {field}: {reason}")]
    Validation { field: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────
    // I/O errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Layout not found: {0}")]
    LayoutNotFound(PathBuf),
}

/// Convenience type alias for Results using ScopeError.
pub type Result<T> = std::result::Result<T, ScopeError>;

impl ScopeError {
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        ScopeError::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn ipc(context: &str, details: impl ToString) -> Self {
        ScopeError::Ipc {
            context: context.to_string(),
            details: details.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ScopeError::NotFound(_) | ScopeError::LayoutNotFound(_))
    }

    /// Transport-level failures end the current trigger; everything else is
    /// isolated to the window or spec being processed.
    pub fn is_transport(&self) -> bool {
        matches!(self, ScopeError::Ipc { .. })
    }

    /// Stable code used in daemon error responses.
    pub fn code(&self) -> &'static str {
        match self {
            ScopeError::NotFound(_) | ScopeError::LayoutNotFound(_) => "not_found",
            ScopeError::Ipc { .. } => "ipc_failure",
            ScopeError::CommandRejected { .. } => "command_rejected",
            ScopeError::LaunchTimeout { .. } => "launch_timeout",
            ScopeError::LaunchFailed { .. } => "launch_failed",
            ScopeError::Validation { .. } => "validation_error",
            ScopeError::Io { .. } => "io_error",
            ScopeError::Json { .. } => "json_error",
        }
    }
}

impl From<ScopeError> for ErrorInfo {
    fn from(err: ScopeError) -> Self {
        ErrorInfo::new(err.code(), err.to_string())
    }
}

impl From<ErrorInfo> for ScopeError {
    fn from(info: ErrorInfo) -> Self {
        ScopeError::Validation {
            field: "input".to_string(),
            reason: info.message,
        }
    }
}

// Conversion for string error compatibility
impl From<ScopeError> for String {
    fn from(err: ScopeError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ScopeError::NotFound("w".into()).code(), "not_found");
        assert_eq!(ScopeError::ipc("tree", "closed").code(), "ipc_failure");
        assert_eq!(
            ScopeError::validation("mark", "empty").code(),
            "validation_error"
        );
    }

    #[test]
    fn only_ipc_is_transport() {
        assert!(ScopeError::ipc("tree", "closed").is_transport());
        assert!(!ScopeError::NotFound("w".into()).is_transport());
        assert!(!ScopeError::CommandRejected {
            command: "kill".into(),
            details: "nope".into()
        }
        .is_transport());
    }
}
