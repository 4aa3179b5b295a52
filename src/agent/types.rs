//! Agent handle and status types

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest accepted agent identifier
pub const MAX_AGENT_ID_LEN: usize = 128;

/// Whether an agent should be kept alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Running,
    Stopped,
}

/// One supervised agent process. Also the on-disk record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHandle {
    pub agent_id: String,
    /// Pid of the live process; cleared when it is found dead
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub desired_state: DesiredState,
}

impl AgentHandle {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            pid: None,
            started_at: None,
            restart_count: 0,
            desired_state: DesiredState::Running,
        }
    }

    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }
}

/// Read-only status row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub running: bool,
    pub pid: Option<u32>,
    pub restart_count: u32,
}

impl From<&AgentHandle> for AgentStatus {
    fn from(handle: &AgentHandle) -> Self {
        Self {
            agent_id: handle.agent_id.clone(),
            running: handle.is_running(),
            pid: handle.pid,
            restart_count: handle.restart_count,
        }
    }
}

/// Agent ids become file names, so only `[A-Za-z0-9_-]` is allowed
pub fn validate_agent_id(agent_id: &str) -> Result<()> {
    if agent_id.is_empty() {
        return Err(Error::InvalidAgentId("agent id is empty".to_string()));
    }
    if agent_id.len() > MAX_AGENT_ID_LEN {
        return Err(Error::InvalidAgentId(format!(
            "agent id longer than {} characters",
            MAX_AGENT_ID_LEN
        )));
    }
    if let Some(c) = agent_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(Error::InvalidAgentId(format!(
            "agent id {:?} contains invalid character {:?}",
            agent_id, c
        )));
    }
    Ok(())
}
