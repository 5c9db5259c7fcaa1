//! Per-source worker state and the aggregate health snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::event::Position;

/// Lifecycle status of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Worker spawned, loading checkpoint / connecting.
    Starting,
    /// Connected and streaming.
    Running,
    /// Waiting to reconnect.
    Backoff,
    /// Not running: disabled, or stopped on request.
    Stopped,
    /// Crash-looping or unusable. Not restarted until the config is re-touched.
    Failed,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Backoff => write!(f, "backoff"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Health of one source as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub source_id: String,
    pub chain_type: String,
    pub status: WorkerStatus,
    pub last_error: Option<String>,
    /// Restarts and reconnects inside the current crash-loop window.
    pub restart_count: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// The bus has been failing for this source longer than the staleness bound.
    pub degraded: bool,
    /// Last position handed to the publisher.
    pub position: Option<Position>,
    pub events_published: u64,
    pub decode_errors: u64,
    pub duplicates_skipped: u64,
}

impl WorkerState {
    pub fn new(source_id: impl Into<String>, chain_type: impl Into<String>, status: WorkerStatus) -> Self {
        Self {
            source_id: source_id.into(),
            chain_type: chain_type.into(),
            status,
            last_error: None,
            restart_count: 0,
            last_heartbeat: None,
            degraded: false,
            position: None,
            events_published: 0,
            decode_errors: 0,
            duplicates_skipped: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            WorkerStatus::Starting | WorkerStatus::Running | WorkerStatus::Backoff
        )
    }
}

/// Point-in-time copy of every source's state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub generated_at: Option<DateTime<Utc>>,
    pub sources: BTreeMap<String, WorkerState>,
}

impl HealthSnapshot {
    pub fn get(&self, source_id: &str) -> Option<&WorkerState> {
        self.sources.get(source_id)
    }

    pub fn count(&self, status: WorkerStatus) -> usize {
        self.sources.values().filter(|s| s.status == status).count()
    }

    pub fn degraded(&self) -> impl Iterator<Item = &WorkerState> {
        self.sources.values().filter(|s| s.degraded)
    }
}
