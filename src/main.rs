//! pl-bridge - Priority Living machine bridge
//!
//! Connects this machine to the Priority Living control plane: polls for
//! tasks, runs them under the command guard, supervises local agents, and
//! keeps undelivered results in an offline queue.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use priority_bridge::{
    agent::{
        list_remote_agents, request_deploy, validate_agent_id, AgentStatus, AgentStore,
        AgentSupervisor,
    },
    config::BridgeConfig,
    executor::TaskExecutor,
    guard::CommandGuard,
    queue::OfflineQueue,
    transport::{Credential, HttpTransport, Transport},
    worker::{BridgeWorker, WorkerOptions, WorkerStatus},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pl-bridge")]
#[command(author = "Priority Living")]
#[command(version)]
#[command(about = "Bridge this machine to the Priority Living control plane")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "PL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Backend base URL
    #[arg(long, env = "PL_BACKEND_URL", global = true)]
    backend_url: Option<String>,

    /// Bridge key
    #[arg(long, env = "PL_BRIDGE_KEY", global = true, hide_env_values = true)]
    bridge_key: Option<String>,

    /// Poll interval in seconds
    #[arg(long, global = true)]
    poll_interval: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge worker until interrupted
    Run,

    /// Manage local agents
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Inspect the offline queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Show worker, queue and agent status
    Status,

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Check a command against the safety guard
    Check {
        /// Command text
        command: String,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Run the worker loop for one agent (used by the supervisor)
    Run {
        agent_id: String,

        /// Agent connection token
        #[arg(long, env = "PL_CONNECTION_TOKEN", hide_env_values = true)]
        connection_token: Option<String>,
    },
    /// Start an agent process
    Start { agent_id: String },
    /// Stop an agent process
    Stop { agent_id: String },
    /// Register an agent with the backend and start it locally
    Deploy {
        agent_id: String,

        /// Target platform reported to the backend
        #[arg(long, default_value = "local")]
        platform: String,
    },
    /// List agents bound to this bridge key, marking those running here
    List {
        /// Only show local agent records, without asking the backend
        #[arg(long)]
        local: bool,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued requests
    List,
    /// Drop every queued request. Refused while a bridge worker is
    /// running, since it would write its in-memory queue back.
    Clear {
        /// Clear even though a worker appears to be running
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

/// Command-line values that take precedence over the file
#[derive(Clone, Default)]
struct Overrides {
    backend_url: Option<String>,
    bridge_key: Option<String>,
    poll_interval: Option<u64>,
}

impl Overrides {
    fn apply(&self, config: &mut BridgeConfig) {
        if let Some(ref url) = self.backend_url {
            config.backend.url = url.clone();
        }
        if let Some(ref key) = self.bridge_key {
            config.backend.bridge_key = Some(key.clone());
        }
        if let Some(secs) = self.poll_interval {
            config.worker.poll_interval_secs = secs;
        }
    }

    fn load(&self, path: &Path) -> priority_bridge::Result<BridgeConfig> {
        let mut config = BridgeConfig::load(path)?;
        self.apply(&mut config);
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let config_path = cli.config.clone().unwrap_or_else(BridgeConfig::default_path);
    let overrides = Overrides {
        backend_url: cli.backend_url.clone(),
        bridge_key: cli.bridge_key.clone(),
        poll_interval: cli.poll_interval,
    };
    let config = overrides
        .load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    match cli.command {
        Commands::Run => run_bridge(config, config_path, overrides).await?,
        Commands::Agent { action } => match action {
            AgentAction::Run {
                agent_id,
                connection_token,
            } => run_agent_worker(config, &agent_id, connection_token).await?,
            AgentAction::Start { agent_id } => start_agent(&config, &agent_id)?,
            AgentAction::Stop { agent_id } => stop_agent(&config, &agent_id).await?,
            AgentAction::Deploy { agent_id, platform } => {
                deploy_agent(&config, &agent_id, &platform).await?
            }
            AgentAction::List { local } => list_agents(&config, local).await?,
        },
        Commands::Queue { action } => match action {
            QueueAction::List => list_queue(&config)?,
            QueueAction::Clear { force } => clear_queue(&config, force)?,
        },
        Commands::Status => show_status(&config)?,
        Commands::Config { action } => match action {
            ConfigAction::Show { default } => {
                show_config(if default { None } else { Some(&config) })?
            }
        },
        Commands::Check { command } => check_command(&config, &command)?,
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("priority_bridge={0},pl_bridge={0}", log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Cancelled on Ctrl-C or SIGTERM
fn shutdown_token() -> Result<CancellationToken> {
    let cancel = CancellationToken::new();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("Shutting down...");
        token.cancel();
    });
    Ok(cancel)
}

/// Re-read the config file on SIGHUP
fn config_reloader(
    initial: BridgeConfig,
    path: PathBuf,
    overrides: Overrides,
) -> Result<watch::Receiver<BridgeConfig>> {
    let (tx, rx) = watch::channel(initial);
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .context("Failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        while sighup.recv().await.is_some() {
            tracing::info!(path = %path.display(), "Reloading configuration");
            match overrides.load(&path).and_then(|c| c.validate().map(|_| c)) {
                Ok(config) => {
                    if tx.send(config).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Keeping previous configuration"),
            }
        }
    });
    Ok(rx)
}

fn build_executor(config: &BridgeConfig) -> Result<TaskExecutor> {
    let guard = CommandGuard::new(&config.guard.extra_patterns)?;
    Ok(TaskExecutor::new(Arc::new(guard), config.executor.clone()))
}

fn bridge_transport(config: &BridgeConfig) -> Result<HttpTransport> {
    let bridge_key = config.require_bridge_key()?.to_string();
    Ok(HttpTransport::new(
        &config.backend,
        Credential::bridge_key(bridge_key),
    )?)
}

async fn run_bridge(config: BridgeConfig, path: PathBuf, overrides: Overrides) -> Result<()> {
    config.validate()?;
    let transport: Arc<dyn Transport> = Arc::new(bridge_transport(&config)?);
    let queue_path = config.storage.queue_file();
    let queue = OfflineQueue::load(&queue_path, config.queue.max_entries)
        .with_context(|| format!("Refusing to start with unreadable queue {}", queue_path.display()))?;
    let supervisor = AgentSupervisor::load(config.agents.clone(), config.storage.clone())
        .context("Failed to load agent records")?;
    let executor = build_executor(&config)?;

    tracing::info!(
        backend = %config.backend.url,
        machine = %config.worker.resolved_machine_name(),
        "Starting bridge. Press Ctrl+C to stop."
    );

    let worker = BridgeWorker::new(
        transport,
        queue,
        Some(supervisor),
        executor,
        WorkerOptions::bridge(&config),
    );
    let cancel = shutdown_token()?;
    let reload = config_reloader(config, path, overrides)?;
    worker.run(cancel, Some(reload)).await?;
    Ok(())
}

async fn run_agent_worker(
    mut config: BridgeConfig,
    agent_id: &str,
    connection_token: Option<String>,
) -> Result<()> {
    validate_agent_id(agent_id)?;
    if connection_token.is_some() {
        config.backend.connection_token = connection_token;
    }
    config.validate()?;
    let token = config.require_connection_token()?.to_string();

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
        &config.backend,
        Credential::connection_token(token),
    )?);
    let queue = OfflineQueue::load(
        config.storage.agent_queue_file(agent_id),
        config.queue.max_entries,
    )?;
    let executor = build_executor(&config)?;

    tracing::info!(agent_id = agent_id, pid = std::process::id(), "Agent worker started");

    let worker = BridgeWorker::new(
        transport,
        queue,
        None,
        executor,
        WorkerOptions::agent(&config, agent_id),
    );
    worker.run(shutdown_token()?, None).await?;
    tracing::info!(agent_id = agent_id, "Agent worker stopped");
    Ok(())
}

fn start_agent(config: &BridgeConfig, agent_id: &str) -> Result<()> {
    let mut supervisor = AgentSupervisor::load(config.agents.clone(), config.storage.clone())?;
    let handle = supervisor.start(agent_id)?;
    println!(
        "Started agent {} (pid {})",
        handle.agent_id,
        handle.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
    );
    println!("Log: {}", config.storage.agent_log_file(agent_id).display());
    Ok(())
}

async fn stop_agent(config: &BridgeConfig, agent_id: &str) -> Result<()> {
    let mut supervisor = AgentSupervisor::load(config.agents.clone(), config.storage.clone())?;
    supervisor.stop(agent_id).await?;
    println!("Stopped agent {}", agent_id);
    Ok(())
}

async fn deploy_agent(config: &BridgeConfig, agent_id: &str, platform: &str) -> Result<()> {
    validate_agent_id(agent_id)?;
    let transport = bridge_transport(config)?;
    println!("Deploying agent {} to {}", agent_id, platform);
    request_deploy(&transport, agent_id, platform)
        .await
        .context("Deploy failed")?;
    println!("Agent registered for {}", platform);

    if config.backend.connection_token.is_none() {
        println!("No connection_token configured; set backend.connection_token to run it here.");
        return Ok(());
    }
    start_agent(config, agent_id)
}

async fn list_agents(config: &BridgeConfig, local_only: bool) -> Result<()> {
    let mut supervisor = AgentSupervisor::load(config.agents.clone(), config.storage.clone())?;
    let local: Vec<_> = supervisor.status().collect();

    if !local_only {
        let transport = bridge_transport(config)?;
        match list_remote_agents(&transport, &config.worker.poll_endpoint).await {
            Ok(agents) if agents.is_empty() => println!("No agents bound to this bridge key."),
            Ok(agents) => {
                println!("{:<32} {:<20} {:<12} {:<8} {}", "AGENT", "NAME", "TYPE", "STATUS", "LOCAL");
                for agent in agents {
                    let running = local.iter().any(|s| s.agent_id == agent.id && s.running);
                    println!(
                        "{:<32} {:<20} {:<12} {:<8} {}",
                        agent.id,
                        agent.name.as_deref().unwrap_or("Unnamed"),
                        agent.agent_type.as_deref().unwrap_or("?"),
                        agent.status.as_deref().unwrap_or("-"),
                        if running { "running" } else { "-" }
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not fetch agents from the backend");
                println!("Could not fetch agents from the backend; showing local records.");
                print_local_agents(&local);
            }
        }
        return Ok(());
    }

    print_local_agents(&local);
    Ok(())
}

fn print_local_agents(rows: &[AgentStatus]) {
    if rows.is_empty() {
        println!("No agents.");
        return;
    }

    println!("{:<32} {:<8} {:<8} {}", "AGENT", "STATE", "PID", "RESTARTS");
    for row in rows {
        println!(
            "{:<32} {:<8} {:<8} {}",
            row.agent_id,
            if row.running { "running" } else { "stopped" },
            row.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            row.restart_count
        );
    }
}

fn list_queue(config: &BridgeConfig) -> Result<()> {
    let queue = OfflineQueue::load(config.storage.queue_file(), config.queue.max_entries)?;
    println!("{} of {} entries queued", queue.len(), queue.capacity());
    for entry in queue.peek_all() {
        println!(
            "  #{:<6} {} {:<24} queued {}  retries {}",
            entry.seq,
            entry.request.method.as_str(),
            entry.request.endpoint,
            entry.queued_at.format("%Y-%m-%d %H:%M:%S"),
            entry.retry_count
        );
    }
    Ok(())
}

fn clear_queue(config: &BridgeConfig, force: bool) -> Result<()> {
    if !force {
        if let Some(status) = WorkerStatus::read(&config.storage.status_file())? {
            if status.is_live() {
                anyhow::bail!(
                    "A bridge worker is running (pid {}); stop it first or pass --force",
                    status.pid.map(|p| p.to_string()).unwrap_or_default()
                );
            }
        }
    }
    let mut queue = OfflineQueue::load(config.storage.queue_file(), config.queue.max_entries)?;
    let dropped = queue.clear();
    queue.persist()?;
    println!("Dropped {} queued requests", dropped);
    Ok(())
}

fn show_status(config: &BridgeConfig) -> Result<()> {
    let status_path = config.storage.status_file();
    match WorkerStatus::read(&status_path)? {
        Some(status) => {
            println!("Worker:  {} (updated {})", status.state, status.updated_at.to_rfc3339());
            println!("Queue:   {} entries", status.queue_len);
            if let Some(cycle) = status.last_cycle {
                println!(
                    "Last cycle: reachable={} replayed={} fetched={} executed={} failures={}",
                    cycle.backend_reachable,
                    cycle.replayed,
                    cycle.fetched,
                    cycle.executed,
                    cycle.failures
                );
            }
            for agent in status.agents {
                println!(
                    "Agent {}: {} (restarts {})",
                    agent.agent_id,
                    if agent.running { "running" } else { "stopped" },
                    agent.restart_count
                );
            }
        }
        None => {
            println!("Worker:  never ran");
            let queue = OfflineQueue::load(config.storage.queue_file(), config.queue.max_entries)?;
            println!("Queue:   {} entries", queue.len());
            let store = AgentStore::new(config.storage.agents_dir());
            for handle in store.load_all()? {
                println!(
                    "Agent {}: recorded pid {} (restarts {})",
                    handle.agent_id,
                    handle.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                    handle.restart_count
                );
            }
        }
    }
    Ok(())
}

fn show_config(config: Option<&BridgeConfig>) -> Result<()> {
    let default = BridgeConfig::default();
    let config = config.unwrap_or(&default);
    print!("{}", config.to_toml()?);
    Ok(())
}

fn check_command(config: &BridgeConfig, command: &str) -> Result<()> {
    let guard = CommandGuard::new(&config.guard.extra_patterns)?;
    match guard.check(command) {
        Some(violation) => {
            println!("BLOCKED by {}: {}", violation.rule, violation.description);
            std::process::exit(1);
        }
        None => println!("allowed"),
    }
    Ok(())
}
