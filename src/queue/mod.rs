//! Offline queue
//!
//! Requests that could not be delivered (backend 5xx or unreachable) are
//! buffered here and replayed oldest-first at the top of every poll cycle.

mod store;

pub use store::{OfflineQueue, QueuedRequest, DEFAULT_MAX_ENTRIES};
