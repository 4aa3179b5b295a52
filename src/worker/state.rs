//! Worker state machine states and status reporting

use crate::agent::AgentStatus;
use crate::error::Result;
use crate::persist;
use crate::process::is_process_alive;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Polling,
    Replaying,
    Executing,
    /// Sleeping out the poll interval
    Backoff,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Polling => "polling",
            Self::Replaying => "replaying",
            Self::Executing => "executing",
            Self::Backoff => "backoff",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// What happened during one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollCycleResult {
    /// Queue entries delivered and removed
    pub replayed: usize,
    /// Queue entries dropped after a 4xx
    #[serde(default)]
    pub discarded: usize,
    pub fetched: usize,
    pub executed: usize,
    pub failures: usize,
    pub backend_reachable: bool,
}

impl PollCycleResult {
    pub fn is_idle(&self) -> bool {
        self.replayed == 0 && self.discarded == 0 && self.fetched == 0
    }
}

/// Snapshot written to `status.json` after every cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    /// Process that wrote the snapshot
    #[serde(default)]
    pub pid: Option<u32>,
    pub queue_len: usize,
    #[serde(default)]
    pub agents: Vec<AgentStatus>,
    #[serde(default)]
    pub last_cycle: Option<PollCycleResult>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerStatus {
    pub fn write(&self, path: &Path) -> Result<()> {
        persist::write_json_atomic(path, self)
    }

    pub fn read(path: &Path) -> Result<Option<Self>> {
        persist::read_json(path)
    }

    /// Whether the worker that wrote this snapshot is still running
    pub fn is_live(&self) -> bool {
        self.state != WorkerState::Stopped && self.pid.is_some_and(is_process_alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(WorkerState::Backoff).unwrap(),
            serde_json::json!("backoff")
        );
        assert_eq!(WorkerState::Replaying.to_string(), "replaying");
    }

    #[test]
    fn test_status_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        assert!(WorkerStatus::read(&path).unwrap().is_none());

        let status = WorkerStatus {
            state: WorkerState::Backoff,
            pid: Some(std::process::id()),
            queue_len: 2,
            agents: vec![AgentStatus {
                agent_id: "a".to_string(),
                running: true,
                pid: Some(10),
                restart_count: 1,
            }],
            last_cycle: Some(PollCycleResult {
                replayed: 1,
                backend_reachable: true,
                ..Default::default()
            }),
            updated_at: Utc::now(),
        };
        status.write(&path).unwrap();
        assert_eq!(WorkerStatus::read(&path).unwrap(), Some(status));
    }

    #[test]
    fn test_is_live() {
        let mut status = WorkerStatus {
            state: WorkerState::Backoff,
            pid: Some(std::process::id()),
            queue_len: 0,
            agents: Vec::new(),
            last_cycle: None,
            updated_at: Utc::now(),
        };
        assert!(status.is_live());

        status.state = WorkerState::Stopped;
        assert!(!status.is_live());

        status.state = WorkerState::Polling;
        status.pid = Some(99_999_999);
        assert!(!status.is_live());

        status.pid = None;
        assert!(!status.is_live());
    }

    #[test]
    fn test_idle_cycle() {
        assert!(PollCycleResult::default().is_idle());
        let busy = PollCycleResult {
            fetched: 1,
            ..Default::default()
        };
        assert!(!busy.is_idle());
    }
}
