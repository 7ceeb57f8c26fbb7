//! Bounded in-memory audit trail of visibility decisions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

use crate::identity::WindowIdentity;
use crate::visibility::Decision;

pub const DEFAULT_AUDIT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPath {
    Tick,
    Direct,
    WindowEvent,
}

#[derive(Debug, Clone, Serialize)]
pub struct VisibilityDecision {
    pub window_id: i64,
    pub identity: WindowIdentity,
    pub active_project: Option<String>,
    pub decision: Decision,
    pub reason: &'static str,
    pub trigger_path: TriggerPath,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AuditLog {
    capacity: usize,
    entries: VecDeque<VisibilityDecision>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, entry: VisibilityDecision) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest-last slice of the trail, optionally for one window.
    pub fn recent(&self, window_id: Option<i64>, limit: usize) -> Vec<VisibilityDecision> {
        let matching: Vec<&VisibilityDecision> = self
            .entries
            .iter()
            .filter(|entry| window_id.map(|id| entry.window_id == id).unwrap_or(true))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn latest_for(&self, window_id: i64) -> Option<&VisibilityDecision> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.window_id == window_id)
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}
