//! Relay Protocol Types
//!
//! Defines the messages exchanged over the broker between the web-facing
//! process and evaluation workers: evaluation jobs, update events and the
//! envelope that carries them.

pub mod envelope;
pub mod error;
pub mod event;
pub mod job;
pub mod queue;

pub use envelope::{Envelope, Message};
pub use error::ProtocolError;
pub use event::{Outcome, UpdateEvent};
pub use job::{CommandSpec, EvaluationJob, ExecutorKind};
pub use queue::Queue;

/// Schema version stamped on every envelope.
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier stamped on every envelope.
pub const SCHEMA_ID: &str = "bench-relay/envelope@1";
