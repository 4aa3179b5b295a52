//! On-disk agent records
//!
//! One `<agent_id>.json` per agent in the agents directory. Records are
//! hints: the supervisor checks every pid before trusting it.

use crate::agent::types::{validate_agent_id, AgentHandle};
use crate::error::{Error, Result};
use crate::persist;
use std::path::{Path, PathBuf};

pub struct AgentStore {
    dir: PathBuf,
}

impl AgentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, agent_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", agent_id))
    }

    /// Load every record. A missing directory means no agents; an
    /// unreadable or malformed record is an error.
    pub fn load_all(&self) -> Result<Vec<AgentHandle>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut handles = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            if validate_agent_id(&stem).is_err() {
                tracing::debug!(path = %path.display(), "Skipping non-agent file");
                continue;
            }

            let handle: AgentHandle = persist::read_json(&path)
                .map_err(|e| {
                    Error::AgentState(format!("Failed to read {}: {}", path.display(), e))
                })?
                .ok_or_else(|| {
                    Error::AgentState(format!("Record vanished: {}", path.display()))
                })?;
            if handle.agent_id != stem {
                return Err(Error::AgentState(format!(
                    "Record {} names agent {:?}",
                    path.display(),
                    handle.agent_id
                )));
            }
            handles.push(handle);
        }

        handles.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(handles)
    }

    pub fn save(&self, handle: &AgentHandle) -> Result<()> {
        persist::write_json_atomic(&self.record_path(&handle.agent_id), handle)
    }

    /// Delete a record. Missing records are not an error.
    pub fn remove(&self, agent_id: &str) -> Result<()> {
        match std::fs::remove_file(self.record_path(agent_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
