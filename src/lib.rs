//! Priority Living bridge - connects a machine to the Priority Living
//! control plane
//!
//! The bridge polls the backend for work, runs it locally under a command
//! safety guard, supervises long-running agent processes, and reports
//! results back. When the backend is unreachable, state-carrying requests
//! are kept in a persistent offline queue and replayed in order once it
//! returns.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        BridgeWorker                          │
//! │  Polling ──▶ Replaying ──▶ Executing ──▶ Backoff ──┐         │
//! │     ▲                                              │         │
//! │     └──────────────────────────────────────────────┘         │
//! └──────┬──────────────┬──────────────┬──────────────┬──────────┘
//!        │              │              │              │
//!  ┌─────▼─────┐  ┌─────▼──────┐ ┌─────▼──────┐ ┌─────▼───────────┐
//!  │ Transport │  │ OfflineQueue│ │TaskExecutor│ │ AgentSupervisor │
//!  │  (HTTP)   │  │ (JSON file) │ │  + Guard   │ │ (agent records) │
//!  └───────────┘  └─────────────┘ └────────────┘ └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`worker`]: the poll loop state machine
//! - [`queue`]: bounded FIFO of undelivered requests
//! - [`transport`]: backend client and outcome classification
//! - [`executor`]: task model and bounded command execution
//! - [`guard`]: destructive command deny list
//! - [`agent`]: agent process supervision
//! - [`config`]: configuration management

pub mod agent;
pub mod config;
pub mod error;
pub mod executor;
pub mod guard;
pub mod persist;
pub mod process;
pub mod queue;
pub mod transport;
pub mod worker;

pub use config::BridgeConfig;
pub use error::{Error, Result};
