//! winscope: command-line client for the winscope daemon.
//!
//! Every subcommand is one daemon request. Results are printed to stdout as
//! pretty JSON; failures print the error code and exit non-zero.
//!
//! ## Subcommands
//!
//! - `switch-project`, `active-project`: project scoping
//! - `toggle-scratchpad`, `close-scratchpad`, `list-scratchpads`: per-project terminals
//! - `restore-layout`, `save-layout`, `list-layouts`: saved layouts
//! - `health`, `audit`: diagnostics

mod daemon_client;
mod logging;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

use daemon_client::{ClientError, DaemonClient};
use winscope_daemon_protocol::{
    AuditParams, ErrorInfo, LayoutParams, ListLayoutsParams, Method, ScratchpadParams,
    SwitchProjectParams,
};

const HEALTH_TIMEOUT_SECS: u64 = 2;

#[derive(Parser)]
#[command(name = "winscope")]
#[command(about = "Project-scoped window visibility for i3/Sway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Make PROJECT active: hide other projects' windows, show its own
    SwitchProject {
        #[arg(value_name = "PROJECT")]
        project: String,
    },

    /// Print the active project
    ActiveProject,

    /// Show or hide the project's scratchpad terminal, launching it if needed
    ToggleScratchpad {
        #[arg(value_name = "PROJECT")]
        project: String,

        /// Directory for a newly launched terminal (absolute)
        #[arg(long, value_name = "DIR")]
        working_directory: Option<PathBuf>,
    },

    /// Close the project's scratchpad terminal
    CloseScratchpad {
        #[arg(value_name = "PROJECT")]
        project: String,
    },

    /// List registered scratchpad terminals
    ListScratchpads,

    /// Launch or reposition windows to match a saved layout
    RestoreLayout {
        #[arg(value_name = "PROJECT")]
        project: String,

        #[arg(value_name = "LAYOUT")]
        layout: String,
    },

    /// Capture the project's current windows as a layout
    SaveLayout {
        #[arg(value_name = "PROJECT")]
        project: String,

        #[arg(value_name = "LAYOUT")]
        layout: String,

        /// Also capture global windows
        #[arg(long)]
        include_global: bool,
    },

    /// List saved layouts for a project
    ListLayouts {
        #[arg(value_name = "PROJECT")]
        project: String,
    },

    /// Daemon health
    Health,

    /// Recent visibility decisions
    Audit {
        /// Only decisions about this window
        #[arg(long)]
        window_id: Option<i64>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{}: {}", .0.code, .0.message)]
    Invalid(ErrorInfo),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl Commands {
    /// Builds the daemon request, validating arguments before they leave the
    /// process.
    fn request(&self) -> Result<(Method, Option<Value>), ErrorInfo> {
        let request = match self {
            Commands::SwitchProject { project } => {
                let params = SwitchProjectParams {
                    project: project.clone(),
                };
                params.validate()?;
                (Method::SwitchProject, Some(to_params(&params)?))
            }
            Commands::ActiveProject => (Method::GetActiveProject, None),
            Commands::ToggleScratchpad {
                project,
                working_directory,
            } => {
                let params = ScratchpadParams {
                    project: project.clone(),
                    working_directory: working_directory
                        .as_ref()
                        .map(|dir| dir.to_string_lossy().into_owned()),
                };
                params.validate()?;
                (Method::ToggleScratchpad, Some(to_params(&params)?))
            }
            Commands::CloseScratchpad { project } => {
                let params = ScratchpadParams {
                    project: project.clone(),
                    working_directory: None,
                };
                params.validate()?;
                (Method::CloseScratchpad, Some(to_params(&params)?))
            }
            Commands::ListScratchpads => (Method::ListScratchpads, None),
            Commands::RestoreLayout { project, layout } => {
                let params = LayoutParams {
                    project: project.clone(),
                    layout: layout.clone(),
                    include_global: false,
                };
                params.validate()?;
                (Method::RestoreLayout, Some(to_params(&params)?))
            }
            Commands::SaveLayout {
                project,
                layout,
                include_global,
            } => {
                let params = LayoutParams {
                    project: project.clone(),
                    layout: layout.clone(),
                    include_global: *include_global,
                };
                params.validate()?;
                (Method::SaveLayout, Some(to_params(&params)?))
            }
            Commands::ListLayouts { project } => {
                let params = ListLayoutsParams {
                    project: project.clone(),
                };
                params.validate()?;
                (Method::ListLayouts, Some(to_params(&params)?))
            }
            Commands::Health => (Method::GetHealth, None),
            Commands::Audit { window_id, limit } => {
                let params = AuditParams {
                    window_id: *window_id,
                    limit: Some(*limit),
                };
                (Method::GetAudit, Some(to_params(&params)?))
            }
        };
        Ok(request)
    }
}

fn to_params<T: serde::Serialize>(params: &T) -> Result<Value, ErrorInfo> {
    serde_json::to_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("failed to encode params: {}", err)))
}

fn run(command: &Commands) -> Result<Value, CliError> {
    let (method, params) = command.request().map_err(CliError::Invalid)?;
    let mut client = DaemonClient::from_env()?;
    if method == Method::GetHealth {
        client = client.with_read_timeout(Duration::from_secs(HEALTH_TIMEOUT_SECS));
    }
    Ok(client.call(method, params)?)
}

fn error_payload(err: &CliError) -> Value {
    match err {
        CliError::Invalid(info) => json!({ "ok": false, "error": info }),
        CliError::Client(ClientError::Daemon { code, message }) => {
            json!({ "ok": false, "error": { "code": code, "message": message } })
        }
        CliError::Client(other) => {
            json!({ "ok": false, "error": { "code": "daemon_unreachable", "message": other.to_string() } })
        }
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match run(&cli.command) {
        Ok(data) => print_json(&data),
        Err(err) => {
            tracing::error!(command = ?cli.command, error = %err, "winscope command failed");
            print_json(&error_payload(&err));
            std::process::exit(1);
        }
    }
}
