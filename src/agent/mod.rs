//! Agent module: supervised local agent processes
//!
//! ```text
//! BridgeWorker ──reconcile()──▶ AgentSupervisor ──spawn/signal──▶ agent processes
//!                                   │                              (own process groups,
//!                                   ▼                               outlive the CLI)
//!                              AgentStore
//!                         agents/<agent_id>.json
//! ```
//!
//! Records on disk are hints. Every supervisor operation checks recorded
//! pids against the OS before acting on them.

pub mod remote;
pub mod store;
pub mod supervisor;
pub mod types;

pub use remote::{list_remote_agents, request_deploy, RemoteAgent, SPAWN_ENDPOINT};
pub use store::AgentStore;
pub use supervisor::AgentSupervisor;
pub use types::{validate_agent_id, AgentHandle, AgentStatus, DesiredState};
