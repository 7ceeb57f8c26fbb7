//! Runtime configuration loaded from `~/.config/winscope/config.toml`.
//!
//! Every key is optional; a missing file yields the defaults.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::audit::DEFAULT_AUDIT_CAPACITY;
use crate::error::{Result, ScopeError};
use crate::mark_store::IpcSettings;
use crate::scratchpad::ScratchpadConfig;

pub const CONFIG_ENV: &str = "WINSCOPE_CONFIG";
pub const DAEMON_SOCKET_ENV: &str = "WINSCOPE_DAEMON_SOCKET";
const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".config/winscope/config.toml";
const STATE_DIR_NAME: &str = ".winscope";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ScopeConfig {
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub scratchpad: ScratchpadSection,
    #[serde(default)]
    pub layouts: LayoutsConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub socket_path: Option<PathBuf>,
    pub timeout_ms: u64,
    pub retry_backoff_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            timeout_ms: 2_000,
            retry_backoff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScratchpadSection {
    pub command: String,
    pub width_ppt: u8,
    pub height_ppt: u8,
    pub launch_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ScratchpadSection {
    fn default() -> Self {
        let defaults = ScratchpadConfig::default();
        Self {
            command: defaults.command,
            width_ppt: defaults.width_ppt,
            height_ppt: defaults.height_ppt,
            launch_timeout_ms: defaults.launch_timeout.as_millis() as u64,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LayoutsConfig {
    pub directory: Option<PathBuf>,
    pub poll_interval_ms: u64,
}

impl Default for LayoutsConfig {
    fn default() -> Self {
        Self {
            directory: None,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub initial_project: Option<String>,
}

impl ScopeConfig {
    pub fn ipc_settings(&self) -> IpcSettings {
        IpcSettings {
            socket_path: self.ipc.socket_path.clone(),
            timeout: Duration::from_millis(self.ipc.timeout_ms.max(1)),
            retry_backoff: Duration::from_millis(self.ipc.retry_backoff_ms),
        }
    }

    pub fn scratchpad_config(&self) -> ScratchpadConfig {
        ScratchpadConfig {
            command: self.scratchpad.command.clone(),
            width_ppt: self.scratchpad.width_ppt.clamp(10, 100),
            height_ppt: self.scratchpad.height_ppt.clamp(10, 100),
            launch_timeout: Duration::from_millis(self.scratchpad.launch_timeout_ms),
            poll_interval: Duration::from_millis(self.scratchpad.poll_interval_ms.max(1)),
        }
    }

    pub fn layout_poll_interval(&self) -> Duration {
        Duration::from_millis(self.layouts.poll_interval_ms.max(1))
    }

    pub fn layouts_dir(&self) -> Result<PathBuf> {
        match &self.layouts.directory {
            Some(dir) => Ok(dir.clone()),
            None => Ok(state_dir()?.join("layouts")),
        }
    }
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| ScopeError::validation("home", "home directory not found"))
}

/// `~/.winscope`, the root for sockets, logs and saved layouts.
pub fn state_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(STATE_DIR_NAME))
}

pub fn default_daemon_socket_path() -> Result<PathBuf> {
    Ok(state_dir()?.join("daemon.sock"))
}

/// Daemon socket as seen by clients, honoring `WINSCOPE_DAEMON_SOCKET`.
pub fn client_socket_path() -> Result<PathBuf> {
    match std::env::var_os(DAEMON_SOCKET_ENV).filter(|value| !value.is_empty()) {
        Some(path) => Ok(PathBuf::from(path)),
        None => default_daemon_socket_path(),
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    Ok(home_dir()?.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: Option<PathBuf>) -> Result<ScopeConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(ScopeConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| ScopeError::Io {
        context: format!("read config {}", config_path.display()),
        source,
    })?;
    let config = toml::from_str::<ScopeConfig>(&content).map_err(|err| {
        ScopeError::validation(
            "config",
            format!("failed to parse {}: {}", config_path.display(), err),
        )
    })?;
    if let Some(project) = &config.orchestrator.initial_project {
        winscope_daemon_protocol::validate_project_name(project)?;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(Some(temp_dir.path().join("missing.toml"))).expect("load config");
        assert_eq!(config.ipc.timeout_ms, 2_000);
        assert_eq!(config.audit.capacity, DEFAULT_AUDIT_CAPACITY);
        assert!(config.orchestrator.initial_project.is_none());
    }

    #[test]
    fn load_config_parses_sections() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
[ipc]
socket_path = "/run/user/1000/sway-ipc.sock"
retry_backoff_ms = 250

[scratchpad]
command = "alacritty --class scratch"
width_ppt = 60

[layouts]
directory = "/srv/layouts"

[audit]
capacity = 32

[orchestrator]
initial_project = "alpha"
"#,
        )
        .expect("write config");

        let config = load_config(Some(path)).expect("load config");
        let ipc = config.ipc_settings();
        assert_eq!(
            ipc.socket_path.as_deref(),
            Some(std::path::Path::new("/run/user/1000/sway-ipc.sock"))
        );
        assert_eq!(ipc.retry_backoff, Duration::from_millis(250));
        assert_eq!(ipc.timeout, Duration::from_millis(2_000));

        let scratchpad = config.scratchpad_config();
        assert_eq!(scratchpad.command, "alacritty --class scratch");
        assert_eq!(scratchpad.width_ppt, 60);
        assert_eq!(scratchpad.height_ppt, ScratchpadConfig::default().height_ppt);

        assert_eq!(config.layouts_dir().expect("dir"), PathBuf::from("/srv/layouts"));
        assert_eq!(config.audit.capacity, 32);
        assert_eq!(config.orchestrator.initial_project.as_deref(), Some("alpha"));
    }

    #[test]
    fn load_config_rejects_malformed_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[ipc\ntimeout_ms = 'soon'").expect("write config");
        let err = load_config(Some(path)).unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn invalid_initial_project_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[orchestrator]\ninitial_project = \"has space\"\n")
            .expect("write config");
        assert!(load_config(Some(path)).is_err());
    }
}
