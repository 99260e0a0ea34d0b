//! Stdio JSON-RPC bridge to a tool-providing child process.
//!
//! Submodules:
//! - `types`: wire messages (requests, responses, notifications)
//! - `framer`: line splitting and message classification, noise-tolerant
//! - `correlator`: pending-call table with per-call deadlines
//! - `events`: notification fan-out to listeners
//! - `supervisor`: child spawning, stdio wiring, exit handling
//! - `client`: the `Bridge` callers use
//! - `errors`: error taxonomy and retry classification

pub mod client;
pub mod correlator;
pub mod errors;
pub mod events;
pub mod framer;
pub mod supervisor;
pub mod types;

pub use client::{Bridge, CallOptions, RetryPolicy};
pub use correlator::{PendingCall, RequestCorrelator};
pub use errors::{BridgeError, ErrorKind, ProtocolError, RetryStrategy};
pub use events::{EventBus, ListenerId, ANY_METHOD};
pub use framer::{message_stream, MessageFramer};
pub use supervisor::Connection;
pub use types::{Message, Notification, ResponseOutcome, RpcError};
