//! Usage tracking — an audit trail of every call attempted through a bridge.
//!
//! Submodules:
//! - `types`: log entries and aggregate statistics
//! - `store`: persistence backends (JSON file, in-memory)
//! - `tracker`: the tracker itself, shared across bridges by `Arc`
//! - `errors`: persistence errors

pub mod errors;
pub mod store;
pub mod tracker;
pub mod types;

pub use errors::UsageError;
pub use store::{JsonFileStore, MemoryStore, UsageStore};
pub use tracker::{CallHandle, UsageTracker};
pub use types::{CallStatus, CountBreakdown, UsageLogEntry, UsageStats};
