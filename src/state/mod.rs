//! Submission status and the relational-store collaborator
//!
//! The status graph lives in `status`; `store` is the seam to the
//! relational store that persists it.

mod status;
pub mod store;

pub use status::{Submission, SubmissionStatus, TransitionError};
pub use store::{EvaluatorRecord, JsonStore, MemoryStore, StoreError, SubmissionStore};
