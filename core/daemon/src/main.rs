//! winscope daemon entrypoint.
//!
//! A single-writer service: connection threads and the window-manager
//! listener feed one event loop that owns all visibility, scratchpad and
//! layout state.

use fs_err as fs;
use std::env;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use winscope_core::{default_daemon_socket_path, load_config, state_dir, ScopeConfig, ScopeEngine};
use winscope_daemon_protocol::{
    Method, Request, Response, ERROR_TOO_MANY_CONNECTIONS, PROTOCOL_VERSION,
};

mod backoff;
mod dispatch;
mod event_loop;
mod events;
mod server;

use backoff::StartupBackoff;
use event_loop::Job;
use server::{read_request, write_response, ConnectionLimiter};

struct Shared {
    jobs: Sender<Job>,
    limiter: Arc<ConnectionLimiter>,
    backoff: Option<StartupBackoff>,
}

fn main() {
    init_logging();

    let backoff = match daemon_backoff_path() {
        Ok(path) => {
            let backoff = StartupBackoff::new(path);
            backoff.apply();
            Some(backoff)
        }
        Err(err) => {
            warn!(error = %err, "Failed to resolve daemon backoff path");
            None
        }
    };

    let config = match load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            ScopeConfig::default()
        }
    };

    let socket_path = match default_daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    let engine_config = config.clone();
    let jobs = match event_loop::spawn(move || ScopeEngine::with_system(&engine_config)) {
        Ok((jobs, _handle)) => jobs,
        Err(err) => {
            error!(error = %err, "Failed to start event loop");
            std::process::exit(1);
        }
    };

    if let Err(err) = events::spawn_listener(config.ipc_settings(), jobs.clone()) {
        warn!(error = %err, "Failed to start window manager listener; only direct requests will be served");
    }

    info!(
        path = %socket_path.display(),
        initial_project = ?config.orchestrator.initial_project,
        "winscope daemon started"
    );

    let shared = Arc::new(Shared {
        jobs,
        limiter: Arc::new(ConnectionLimiter::default()),
        backoff,
    });

    for stream in listener.incoming() {
        match stream {
            Ok(mut stream) => {
                let Some(permit) = shared.limiter.try_acquire() else {
                    warn!("Connection limit reached; rejecting client");
                    let response = Response::error(
                        None,
                        ERROR_TOO_MANY_CONNECTIONS,
                        "daemon is serving too many connections",
                    );
                    let _ = write_response(&mut stream, &response);
                    continue;
                };
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    let _permit = permit;
                    handle_connection(stream, &shared);
                });
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("WINSCOPE_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_backoff_path() -> winscope_core::Result<PathBuf> {
    Ok(state_dir()?.join("daemon").join("daemon-backoff.json"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, shared: &Shared) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let _ = write_response(&mut stream, &Response::error_with_info(None, err));
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, shared);
    let _ = write_response(&mut stream, &response);
}

fn handle_request(request: Request, shared: &Shared) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id.clone();
    let is_health = request.method == Method::GetHealth;
    let (reply, response) = mpsc::channel();
    if shared.jobs.send(Job::Request { request, reply }).is_err() {
        return Response::error(id, "daemon_unavailable", "event loop is not running");
    }
    let mut response = match response.recv() {
        Ok(response) => response,
        Err(_) => {
            return Response::error(id, "daemon_unavailable", "event loop dropped the request")
        }
    };

    if is_health {
        if let Some(data) = response.data.as_mut() {
            if let Ok(value) = serde_json::to_value(shared.limiter.stats()) {
                data["security"] = value;
            }
            if let Some(snapshot) = shared.backoff.as_ref().and_then(StartupBackoff::snapshot) {
                if let Ok(value) = serde_json::to_value(snapshot) {
                    data["backoff"] = value;
                }
            }
        }
    }
    response
}
