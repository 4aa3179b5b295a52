//! Agent process lifecycle: start, stop, crash detection and restart
//!
//! The record directory is the source of truth for which agents exist, since
//! the CLI may start or stop agents while a worker runs; `reconcile` re-reads
//! it. The OS is the source of truth for whether they run. Every operation
//! refreshes liveness before acting, so a handle's pid is only ever set while
//! the process is alive.

use crate::agent::store::AgentStore;
use crate::agent::types::{validate_agent_id, AgentHandle, AgentStatus, DesiredState};
use crate::config::{AgentsConfig, StorageConfig, AGENT_ID_PLACEHOLDER};
use crate::error::{Error, Result};
use crate::process::{is_process_alive, signal_group, signal_process, wait_for_exit};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Owns the set of supervised agents
pub struct AgentSupervisor {
    handles: BTreeMap<String, AgentHandle>,
    /// Processes spawned by this supervisor; adopted agents have none
    children: HashMap<String, Child>,
    store: AgentStore,
    storage: StorageConfig,
    config: AgentsConfig,
}

impl AgentSupervisor {
    /// Load agent records and check each recorded pid
    pub fn load(config: AgentsConfig, storage: StorageConfig) -> Result<Self> {
        let store = AgentStore::new(storage.agents_dir());
        let records = store.load_all()?;

        tracing::info!("Restoring {} agent records from disk", records.len());

        let mut supervisor = Self {
            handles: BTreeMap::new(),
            children: HashMap::new(),
            store,
            storage,
            config,
        };
        for handle in records {
            supervisor.handles.insert(handle.agent_id.clone(), handle);
        }
        supervisor.refresh_all();
        Ok(supervisor)
    }

    pub fn set_auto_restart(&mut self, auto_restart: bool) {
        self.config.auto_restart = auto_restart;
    }

    pub fn auto_restart(&self) -> bool {
        self.config.auto_restart
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentHandle> {
        self.handles.get(agent_id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Start an agent. Fails with `AlreadyRunning` if it is alive.
    pub fn start(&mut self, agent_id: &str) -> Result<AgentHandle> {
        validate_agent_id(agent_id)?;
        if self.refresh(agent_id) {
            return Err(Error::AlreadyRunning(agent_id.to_string()));
        }

        let (pid, child) = self.spawn_process(agent_id)?;
        let handle = self
            .handles
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentHandle::new(agent_id));
        handle.pid = Some(pid);
        handle.started_at = Some(Utc::now());
        handle.desired_state = DesiredState::Running;
        let handle = handle.clone();

        self.children.insert(agent_id.to_string(), child);
        self.persist(&handle);

        tracing::info!(agent_id = agent_id, pid = pid, "Started agent");
        Ok(handle)
    }

    /// Stop an agent and forget it. Fails with `NotRunning` (leaving all
    /// state untouched) unless the agent has a live process.
    pub async fn stop(&mut self, agent_id: &str) -> Result<()> {
        validate_agent_id(agent_id)?;
        if !self.refresh(agent_id) {
            return Err(Error::NotRunning(agent_id.to_string()));
        }
        let pid = self
            .handles
            .get(agent_id)
            .and_then(|h| h.pid)
            .ok_or_else(|| Error::NotRunning(agent_id.to_string()))?;

        tracing::info!(agent_id = agent_id, pid = pid, "Stopping agent");
        let grace = self.config.stop_grace();
        send_signal(pid, libc::SIGTERM);

        match self.children.remove(agent_id) {
            Some(mut child) => {
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    tracing::warn!(agent_id = agent_id, pid = pid, "Force killing agent");
                    send_signal(pid, libc::SIGKILL);
                    let _ = child.kill().await;
                }
            }
            None => {
                if !wait_for_exit(pid, grace).await {
                    tracing::warn!(agent_id = agent_id, pid = pid, "Force killing agent");
                    send_signal(pid, libc::SIGKILL);
                    wait_for_exit(pid, Duration::from_secs(1)).await;
                }
            }
        }

        self.handles.remove(agent_id);
        self.store.remove(agent_id)?;
        Ok(())
    }

    /// Detect dead agents and respawn those that should be running when
    /// `auto_restart` is on. Returns the ids that were restarted.
    pub fn reconcile(&mut self) -> Vec<String> {
        self.sync_records();
        let ids: Vec<String> = self.handles.keys().cloned().collect();
        let mut restarted = Vec::new();

        for agent_id in ids {
            if self.refresh(&agent_id) {
                continue;
            }
            let wants_running = self
                .handles
                .get(&agent_id)
                .map(|h| h.desired_state == DesiredState::Running)
                .unwrap_or(false);
            if !wants_running || !self.config.auto_restart {
                continue;
            }

            match self.spawn_process(&agent_id) {
                Ok((pid, child)) => {
                    self.children.insert(agent_id.clone(), child);
                    if let Some(handle) = self.handles.get_mut(&agent_id) {
                        handle.pid = Some(pid);
                        handle.started_at = Some(Utc::now());
                        handle.restart_count += 1;
                        tracing::info!(
                            agent_id = %agent_id,
                            pid = pid,
                            restart_count = handle.restart_count,
                            "Restarted agent"
                        );
                        let handle = handle.clone();
                        self.persist(&handle);
                    }
                    restarted.push(agent_id);
                }
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, error = %e, "Failed to restart agent");
                }
            }
        }

        restarted
    }

    /// Pick up records written or removed by other processes since the last
    /// pass. A handle whose record is gone was stopped elsewhere and is
    /// forgotten; a record with a live pid we do not own is adopted.
    fn sync_records(&mut self) {
        let records = match self.store.load_all() {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to re-read agent records");
                return;
            }
        };
        let mut on_disk: BTreeMap<String, AgentHandle> = records
            .into_iter()
            .map(|h| (h.agent_id.clone(), h))
            .collect();

        let known: Vec<String> = self.handles.keys().cloned().collect();
        for agent_id in known {
            let Some(record) = on_disk.remove(&agent_id) else {
                tracing::info!(agent_id = %agent_id, "Agent record removed, forgetting agent");
                self.handles.remove(&agent_id);
                self.children.remove(&agent_id);
                continue;
            };

            let ours = self.handles.get(&agent_id).and_then(|h| h.pid);
            let theirs = record
                .pid
                .filter(|pid| Some(*pid) != ours && is_process_alive(*pid))
                .filter(|_| !ours.is_some_and(is_process_alive));
            if let Some(pid) = theirs {
                tracing::info!(agent_id = %agent_id, pid = pid, "Adopting agent started elsewhere");
                self.children.remove(&agent_id);
                self.handles.insert(agent_id, record);
            } else if let Some(handle) = self.handles.get_mut(&agent_id) {
                handle.desired_state = record.desired_state;
            }
        }

        for (agent_id, record) in on_disk {
            tracing::info!(agent_id = %agent_id, pid = ?record.pid, "Adopting new agent record");
            self.handles.insert(agent_id, record);
        }
    }

    /// Current status of every agent, after a liveness refresh
    pub fn status(&mut self) -> impl Iterator<Item = AgentStatus> + '_ {
        self.refresh_all();
        self.handles.values().map(AgentStatus::from)
    }

    fn refresh_all(&mut self) {
        let ids: Vec<String> = self.handles.keys().cloned().collect();
        for agent_id in ids {
            self.refresh(&agent_id);
        }
    }

    /// Reconcile one handle with the OS. Returns whether it is alive.
    fn refresh(&mut self, agent_id: &str) -> bool {
        let Some(pid) = self.handles.get(agent_id).and_then(|h| h.pid) else {
            return false;
        };

        let alive = match self.children.get_mut(agent_id) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => is_process_alive(pid),
        };
        if alive {
            return true;
        }

        tracing::warn!(agent_id = agent_id, pid = pid, "Agent process is not running");
        self.children.remove(agent_id);
        if let Some(handle) = self.handles.get_mut(agent_id) {
            handle.pid = None;
            let handle = handle.clone();
            self.persist(&handle);
        }
        false
    }

    fn spawn_process(&self, agent_id: &str) -> Result<(u32, Child)> {
        let spawn_failed = |reason: String| Error::SpawnFailed {
            agent_id: agent_id.to_string(),
            reason,
        };

        let program = match self.config.program.clone() {
            Some(program) => program,
            None => std::env::current_exe()
                .map_err(|e| spawn_failed(format!("cannot locate executable: {}", e)))?,
        };
        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| arg.replace(AGENT_ID_PLACEHOLDER, agent_id))
            .collect();

        std::fs::create_dir_all(self.storage.agent_runtime_dir(agent_id))?;
        let log_path = self.storage.agent_log_file(agent_id);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let log_err = log.try_clone()?;

        tracing::debug!(
            agent_id = agent_id,
            program = %program.display(),
            log = %log_path.display(),
            "Spawning agent process"
        );

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| spawn_failed(format!("{}: {}", program.display(), e)))?;

        let pid = child
            .id()
            .ok_or_else(|| spawn_failed("process exited immediately".to_string()))?;
        Ok((pid, child))
    }

    fn persist(&self, handle: &AgentHandle) {
        if let Err(e) = self.store.save(handle) {
            tracing::error!(agent_id = %handle.agent_id, error = %e, "Failed to persist agent record");
        }
    }
}

/// Agents lead their own process group; fall back to the single pid for
/// processes that do not.
fn send_signal(pid: u32, signal: libc::c_int) {
    if !signal_group(pid, signal) {
        signal_process(pid, signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config(script: &str) -> AgentsConfig {
        AgentsConfig {
            auto_restart: true,
            stop_grace_secs: 2,
            program: Some(PathBuf::from("/bin/sh")),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn storage(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            base_dir: dir.path().to_path_buf(),
        }
    }

    fn supervisor(dir: &TempDir, script: &str) -> AgentSupervisor {
        AgentSupervisor::load(config(script), storage(dir)).unwrap()
    }

    async fn wait_dead(supervisor: &mut AgentSupervisor, agent_id: &str) {
        for _ in 0..100 {
            if !supervisor.refresh(agent_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("agent {} never exited", agent_id);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = TempDir::new().unwrap();
        let mut sup = supervisor(&dir, "sleep 30");

        let handle = sup.start("alpha").unwrap();
        let pid = handle.pid.unwrap();
        assert!(is_process_alive(pid));
        assert!(dir.path().join("agents").join("alpha.json").exists());

        sup.stop("alpha").await.unwrap();
        assert!(sup.get("alpha").is_none());
        assert!(!dir.path().join("agents").join("alpha.json").exists());
        assert!(wait_for_exit(pid, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_double_start_is_already_running() {
        let dir = TempDir::new().unwrap();
        let mut sup = supervisor(&dir, "sleep 30");

        let first = sup.start("alpha").unwrap();
        let second = sup.start("alpha");
        assert!(matches!(second, Err(Error::AlreadyRunning(_))));
        assert_eq!(sup.get("alpha").unwrap().pid, first.pid);
        assert_eq!(sup.len(), 1);

        sup.stop("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_unknown_is_not_running() {
        let dir = TempDir::new().unwrap();
        let mut sup = supervisor(&dir, "sleep 30");
        assert!(matches!(
            sup.stop("ghost").await,
            Err(Error::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_crashed_agent_leaves_handle() {
        let dir = TempDir::new().unwrap();
        let mut config = config("exit 1");
        config.auto_restart = false;
        let mut sup = AgentSupervisor::load(config, storage(&dir)).unwrap();

        sup.start("alpha").unwrap();
        wait_dead(&mut sup, "alpha").await;

        assert!(matches!(sup.stop("alpha").await, Err(Error::NotRunning(_))));
        let handle = sup.get("alpha").unwrap();
        assert_eq!(handle.pid, None);
        assert_eq!(handle.desired_state, DesiredState::Running);
    }

    #[tokio::test]
    async fn test_reconcile_restarts_crashed_agent() {
        let dir = TempDir::new().unwrap();
        let mut sup = supervisor(&dir, "sleep 0.1");

        sup.start("alpha").unwrap();
        wait_dead(&mut sup, "alpha").await;

        let restarted = sup.reconcile();
        assert_eq!(restarted, vec!["alpha".to_string()]);
        let handle = sup.get("alpha").unwrap().clone();
        assert_eq!(handle.restart_count, 1);
        assert!(handle.pid.is_some());

        wait_dead(&mut sup, "alpha").await;
    }

    #[tokio::test]
    async fn test_reconcile_without_auto_restart() {
        let dir = TempDir::new().unwrap();
        let mut sup = supervisor(&dir, "exit 0");
        sup.set_auto_restart(false);

        sup.start("alpha").unwrap();
        wait_dead(&mut sup, "alpha").await;

        assert!(sup.reconcile().is_empty());
        let status: Vec<AgentStatus> = sup.status().collect();
        assert_eq!(status.len(), 1);
        assert!(!status[0].running);
        assert_eq!(status[0].restart_count, 0);
    }

    #[tokio::test]
    async fn test_adopts_live_agent_from_records() {
        let dir = TempDir::new().unwrap();
        let pid = {
            let mut sup = supervisor(&dir, "sleep 30");
            sup.start("alpha").unwrap().pid.unwrap()
        };

        let mut sup = supervisor(&dir, "sleep 30");
        let status: Vec<AgentStatus> = sup.status().collect();
        assert_eq!(status[0].pid, Some(pid));
        assert!(status[0].running);
        assert!(matches!(sup.start("alpha"), Err(Error::AlreadyRunning(_))));

        sup.stop("alpha").await.unwrap();
        assert!(wait_for_exit(pid, Duration::from_secs(3)).await);
    }

    #[tokio::test]
    async fn test_reconcile_honours_stop_from_another_process() {
        let dir = TempDir::new().unwrap();
        let mut worker = supervisor(&dir, "sleep 30");
        let pid = worker.start("alpha").unwrap().pid.unwrap();

        let mut cli = supervisor(&dir, "sleep 30");
        cli.stop("alpha").await.unwrap();
        assert!(wait_for_exit(pid, Duration::from_secs(3)).await);

        assert!(worker.reconcile().is_empty());
        assert!(worker.get("alpha").is_none());
        assert!(!dir.path().join("agents").join("alpha.json").exists());
    }

    #[tokio::test]
    async fn test_reconcile_adopts_agent_started_elsewhere() {
        let dir = TempDir::new().unwrap();
        let mut worker = supervisor(&dir, "sleep 30");
        assert!(worker.is_empty());

        let mut cli = supervisor(&dir, "sleep 30");
        let pid = cli.start("beta").unwrap().pid.unwrap();

        assert!(worker.reconcile().is_empty());
        assert_eq!(worker.get("beta").unwrap().pid, Some(pid));
        assert!(matches!(worker.start("beta"), Err(Error::AlreadyRunning(_))));

        worker.stop("beta").await.unwrap();
        assert!(wait_for_exit(pid, Duration::from_secs(3)).await);
        assert!(worker.is_empty());
    }

    #[tokio::test]
    async fn test_stale_record_pid_is_cleared_on_load() {
        let dir = TempDir::new().unwrap();
        let store = AgentStore::new(dir.path().join("agents"));
        let mut handle = AgentHandle::new("alpha");
        handle.pid = Some(99_999_999);
        store.save(&handle).unwrap();

        let mut config = config("sleep 30");
        config.auto_restart = false;
        let sup = AgentSupervisor::load(config, storage(&dir)).unwrap();
        assert_eq!(sup.get("alpha").unwrap().pid, None);
        assert_eq!(store.load_all().unwrap()[0].pid, None);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let config = AgentsConfig {
            program: Some(PathBuf::from("/nonexistent/agent")),
            ..config("")
        };
        let mut sup = AgentSupervisor::load(config, storage(&dir)).unwrap();
        assert!(matches!(
            sup.start("alpha"),
            Err(Error::SpawnFailed { .. })
        ));
        assert!(sup.get("alpha").is_none());
    }

    #[tokio::test]
    async fn test_agent_id_substitution_and_log() {
        let dir = TempDir::new().unwrap();
        let config = AgentsConfig {
            args: vec![
                "-c".to_string(),
                "echo started $0".to_string(),
                AGENT_ID_PLACEHOLDER.to_string(),
            ],
            ..config("")
        };
        let mut sup = AgentSupervisor::load(config, storage(&dir)).unwrap();
        sup.set_auto_restart(false);
        sup.start("beta").unwrap();
        wait_dead(&mut sup, "beta").await;

        let log = std::fs::read_to_string(storage(&dir).agent_log_file("beta")).unwrap();
        assert!(log.contains("started beta"));
    }

    #[test]
    fn test_invalid_id_rejected() {
        let dir = TempDir::new().unwrap();
        let mut sup = supervisor(&dir, "sleep 30");
        assert!(matches!(
            sup.start("../x"),
            Err(Error::InvalidAgentId(_))
        ));
    }
}
