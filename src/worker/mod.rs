//! Bridge worker: the single control loop tying queue, transport,
//! executor and agent supervisor together.

mod bridge;
mod state;

pub use bridge::{BridgeWorker, Delivery, WorkerOptions, AGENT_POLL_ENDPOINT};
pub use state::{PollCycleResult, WorkerState, WorkerStatus};
