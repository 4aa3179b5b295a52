//! Bridge configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder in `agents.args` replaced by the agent id at spawn time.
pub const AGENT_ID_PLACEHOLDER: &str = "{agent_id}";

/// Main bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Backend connection
    pub backend: BackendConfig,

    /// Poll loop
    pub worker: WorkerConfig,

    /// Offline queue
    pub queue: QueueConfig,

    /// Task execution limits
    pub executor: ExecutorConfig,

    /// Agent supervision
    pub agents: AgentsConfig,

    /// Command guard
    pub guard: GuardConfig,

    /// On-disk state locations
    pub storage: StorageConfig,
}

/// Backend connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL; requests go to `{url}/functions/v1/{endpoint}`
    pub url: String,

    /// Public project key sent as `apikey` and bearer token
    pub anon_key: String,

    /// Bridge credential (`x-bridge-key`)
    pub bridge_key: Option<String>,

    /// Agent credential (`x-connection-token`)
    pub connection_token: Option<String>,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Largest request body accepted for sending
    pub max_body_bytes: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "https://api.priorityliving.app".to_string(),
            anon_key: String::new(),
            bridge_key: None,
            connection_token: None,
            request_timeout_secs: 30,
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Poll loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Seconds between poll cycles
    pub poll_interval_secs: u64,

    /// Name reported to the backend (defaults to the host name)
    pub machine_name: Option<String>,

    /// Capabilities advertised on each poll
    pub capabilities: Vec<String>,

    /// Endpoint polled for new tasks
    pub poll_endpoint: String,

    /// Endpoint receiving task results
    pub result_endpoint: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3,
            machine_name: None,
            capabilities: Vec::new(),
            poll_endpoint: "bridge-poll".to_string(),
            result_endpoint: "agent-task-result".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Configured machine name, else the host name
    pub fn resolved_machine_name(&self) -> String {
        self.machine_name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }
}

/// Offline queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum buffered requests; the oldest is evicted beyond this
    pub max_entries: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_entries: 500 }
    }
}

/// Task execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Wall-clock ceiling per task in seconds
    pub timeout_secs: u64,

    /// Captured output ceiling in bytes
    pub max_output_bytes: usize,

    /// Interpreter for `python`/`script` tasks
    pub python: String,

    /// Working directory when a task names none (defaults to home)
    pub default_cwd: Option<PathBuf>,

    /// Seconds between SIGTERM and SIGKILL when terminating a task
    pub kill_grace_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            max_output_bytes: 50_000,
            python: "python3".to_string(),
            default_cwd: None,
            kill_grace_secs: 2,
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn resolved_cwd(&self) -> PathBuf {
        self.default_cwd
            .clone()
            .or_else(dirs_next::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Agent supervision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Respawn crashed agents on reconcile
    pub auto_restart: bool,

    /// Seconds to wait after SIGTERM before SIGKILL
    pub stop_grace_secs: u64,

    /// Agent program (None = this executable)
    pub program: Option<PathBuf>,

    /// Agent arguments; `{agent_id}` is substituted
    pub args: Vec<String>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            auto_restart: true,
            stop_grace_secs: 5,
            program: None,
            args: vec![
                "agent".to_string(),
                "run".to_string(),
                AGENT_ID_PLACEHOLDER.to_string(),
            ],
        }
    }
}

impl AgentsConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Command guard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Additional deny regexes on top of the built-in rules
    pub extra_patterns: Vec<String>,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for all local state
    pub base_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: dirs_next::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".priority-living"),
        }
    }
}

impl StorageConfig {
    pub fn queue_file(&self) -> PathBuf {
        self.base_dir.join("offline_queue.json")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.base_dir.join("agents")
    }

    pub fn status_file(&self) -> PathBuf {
        self.base_dir.join("status.json")
    }

    /// Runtime directory of a single agent (queue, status, log)
    pub fn agent_runtime_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join(format!("{}.d", agent_id))
    }

    /// Queue file used by a single agent worker
    pub fn agent_queue_file(&self, agent_id: &str) -> PathBuf {
        self.agent_runtime_dir(agent_id).join("offline_queue.json")
    }

    /// Status file written by a single agent worker
    pub fn agent_status_file(&self, agent_id: &str) -> PathBuf {
        self.agent_runtime_dir(agent_id).join("status.json")
    }

    /// Combined stdout/stderr of a supervised agent
    pub fn agent_log_file(&self, agent_id: &str) -> PathBuf {
        self.agent_runtime_dir(agent_id).join("agent.log")
    }
}

impl BridgeConfig {
    /// Default config file location (~/.priority-living/config.toml)
    pub fn default_path() -> PathBuf {
        StorageConfig::default().base_dir.join("config.toml")
    }

    /// Load from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        let url = self.backend.url.trim();
        if url.is_empty() {
            return Err(Error::Config("backend.url is empty".to_string()));
        }
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| Error::Config(format!("backend.url {:?}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "backend.url must be http(s), got {}",
                parsed.scheme()
            )));
        }
        if self.worker.poll_interval_secs == 0 {
            return Err(Error::Config(
                "worker.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.queue.max_entries == 0 {
            return Err(Error::Config("queue.max_entries must be at least 1".to_string()));
        }
        if self.executor.timeout_secs == 0 {
            return Err(Error::Config("executor.timeout_secs must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Bridge key, required by `run`
    pub fn require_bridge_key(&self) -> Result<&str> {
        self.backend
            .bridge_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("backend.bridge_key is not set".to_string()))
    }

    /// Connection token, required by agent worker mode
    pub fn require_connection_token(&self) -> Result<&str> {
        self.backend
            .connection_token
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("backend.connection_token is not set".to_string()))
    }
}
