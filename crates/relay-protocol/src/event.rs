//! Update events reported by evaluation workers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Final outcome of an evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Complete,
    Failed,
    Canceled,
}

impl Outcome {
    /// Wire name of the outcome.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Complete => "complete",
            Outcome::Failed => "failed",
            Outcome::Canceled => "canceled",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(Outcome::Complete),
            "failed" => Ok(Outcome::Failed),
            "canceled" => Ok(Outcome::Canceled),
            other => Err(ProtocolError::UnknownOutcome(other.to_string())),
        }
    }
}

/// Completion, failure or cancellation report for one submission.
///
/// The outcome is kept as the raw wire string so that a consumer can refuse
/// an unrecognized kind explicitly instead of failing the whole envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub submission_id: String,
    /// Host the evaluation ran on
    pub host: String,
    /// Outcome wire name (`complete`, `failed`, `canceled`)
    pub kind: String,
}

impl UpdateEvent {
    /// Create an event with a known outcome.
    pub fn new(submission_id: impl Into<String>, host: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            submission_id: submission_id.into(),
            host: host.into(),
            kind: outcome.as_str().to_string(),
        }
    }

    /// Parse the outcome, rejecting unknown kinds.
    pub fn outcome(&self) -> Result<Outcome, ProtocolError> {
        self.kind.parse()
    }
}
