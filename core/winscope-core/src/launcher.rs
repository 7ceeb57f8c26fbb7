//! Process launching for layout restoration and scratchpad terminals.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, warn};

use crate::error::{Result, ScopeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// argv; the first element is the program.
    pub command: Vec<String>,
    pub environment: Vec<(String, String)>,
    pub working_directory: Option<PathBuf>,
}

impl LaunchRequest {
    /// Splits a shell-style command line into argv.
    pub fn from_command_line(
        command_line: &str,
        environment: Vec<(String, String)>,
        working_directory: Option<PathBuf>,
    ) -> Result<Self> {
        let command = shell_words::split(command_line)
            .map_err(|err| ScopeError::validation("launch_command", err.to_string()))?;
        if command.is_empty() {
            return Err(ScopeError::validation("launch_command", "empty command"));
        }
        Ok(Self {
            command,
            environment,
            working_directory,
        })
    }

    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    pub fn display(&self) -> String {
        shell_words::join(&self.command)
    }
}

pub trait Launcher {
    /// Starts the process and returns its pid without waiting for a window.
    fn launch(&self, request: &LaunchRequest) -> Result<u32>;
}

/// Spawns detached children with null stdio.
///
/// Each child gets a reaper thread so exited launches do not linger as
/// zombies for the daemon's lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

impl Launcher for CommandLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<u32> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| ScopeError::validation("launch_command", "empty command"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(request.environment.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &request.working_directory {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|err| ScopeError::LaunchFailed {
            command: request.display(),
            details: err.to_string(),
        })?;
        let pid = child.id();
        debug!(pid, command = %request.display(), "Launched process");

        let label = request.program().to_string();
        let spawned = thread::Builder::new()
            .name(format!("reap-{}", pid))
            .spawn(move || match child.wait() {
                Ok(status) => debug!(pid, program = %label, %status, "Launched process exited"),
                Err(err) => warn!(pid, program = %label, error = %err, "Failed to reap process"),
            });
        if let Err(err) = spawned {
            warn!(pid, error = %err, "Failed to start reaper thread");
        }
        Ok(pid)
    }
}
