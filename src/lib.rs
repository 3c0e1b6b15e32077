//! Bench Relay - benchmark submission transfer and evaluation dispatch
//!
//! Accepts single- and multi-part submission uploads with per-part
//! integrity checks, dispatches uploaded submissions to evaluators on local
//! or remote execution hosts over a durable broker, and reconciles
//! evaluation outcomes back into submission state.

pub mod broker;
pub mod checksum;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod reconcile;
pub mod remote;
pub mod service;
pub mod signal;
pub mod state;
pub mod submission;
pub mod update;
pub mod upload;
pub mod worker;

pub use broker::{Broker, BrokerError, Delivery, MemoryBroker, SpoolBroker};
pub use config::{ConfigError, RelayConfig};
pub use dispatch::{DispatchError, DispatchOutcome, EvaluationDispatcher};
pub use error::{ErrorClass, RelayError};
pub use remote::{RemoteSync, SyncError};
pub use service::{ConsumerPool, DeliveryHandler, Disposition, PoolConfig};
pub use state::{Submission, SubmissionStatus, SubmissionStore};
pub use submission::{LockKind, SubmissionDirectory, SubmissionInfo};
pub use update::{UpdateError, UpdateProcessor};
pub use upload::{UploadError, UploadHandler, UploadManifest};
pub use worker::EvaluationWorker;
