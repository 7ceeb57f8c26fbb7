//! Crash-loop guard for daemon restarts.
//!
//! The service manager may restart the daemon immediately after a crash. Each
//! start is recorded; once more than [`BackoffPolicy::max_starts`] starts fall
//! inside the window, startup sleeps a growing amount before binding the
//! socket.

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub window_secs: i64,
    pub max_starts: usize,
    pub step_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            window_secs: 120,
            max_starts: 3,
            step_secs: 10,
            max_delay_secs: 60,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StartHistory {
    starts: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackoffSnapshot {
    pub recent_starts: usize,
    pub last_start: Option<DateTime<Utc>>,
    pub engaged: bool,
}

pub struct StartupBackoff {
    path: PathBuf,
    policy: BackoffPolicy,
}

impl StartupBackoff {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            policy: BackoffPolicy::default(),
        }
    }

    /// Records this start and sleeps if the daemon is restarting too often.
    pub fn apply(&self) {
        let now = Utc::now();
        let mut history = load_history(&self.path).unwrap_or_else(|err| {
            warn!(error = %err, "Ignoring unreadable backoff state");
            StartHistory::default()
        });
        let delay = record_start(&self.policy, now, &mut history);

        if let Err(err) = save_history(&self.path, &history) {
            warn!(error = %err, "Failed to persist daemon backoff state");
        }

        if let Some(delay) = delay {
            warn!(
                recent_starts = history.starts.len(),
                delay_secs = delay.as_secs(),
                "Daemon start backoff engaged"
            );
            thread::sleep(delay);
        }
    }

    pub fn snapshot(&self) -> Option<BackoffSnapshot> {
        let history = load_history(&self.path).ok()?;
        Some(BackoffSnapshot {
            recent_starts: history.starts.len(),
            last_start: history.starts.last().copied(),
            engaged: history.starts.len() > self.policy.max_starts,
        })
    }
}

fn record_start(
    policy: &BackoffPolicy,
    now: DateTime<Utc>,
    history: &mut StartHistory,
) -> Option<Duration> {
    history
        .starts
        .retain(|start| now.signed_duration_since(*start).num_seconds() <= policy.window_secs);
    history.starts.push(now);

    let excess = history.starts.len().checked_sub(policy.max_starts + 1)? as u64 + 1;
    let secs = policy
        .step_secs
        .saturating_mul(excess)
        .min(policy.max_delay_secs);
    Some(Duration::from_secs(secs))
}

fn load_history(path: &Path) -> Result<StartHistory, String> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(StartHistory::default())
        }
        Err(err) => return Err(err.to_string()),
    };
    serde_json::from_slice(&data).map_err(|err| format!("invalid backoff state: {}", err))
}

fn save_history(path: &Path, history: &StartHistory) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| err.to_string())?;
    }
    let payload = serde_json::to_vec_pretty(history).map_err(|err| err.to_string())?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload).map_err(|err| err.to_string())?;
    fs::rename(&tmp_path, path).map_err(|err| err.to_string())
}
