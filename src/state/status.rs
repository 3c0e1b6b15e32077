//! Submission status state machine
//!
//! Main path: uploading → uploaded → on_queue → validating → evaluating →
//! {completed | failed | canceled}. The side states invalid, no_eval,
//! no_auto_eval and excluded are reachable from uploaded and evaluating
//! and have no outgoing edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Submission status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// Archive is being transferred
    Uploading,
    /// Archive received, verified and extracted
    Uploaded,
    /// Evaluation job published to the broker
    OnQueue,
    /// Evaluator inputs being checked
    Validating,
    /// Evaluator running
    Evaluating,
    Completed,
    Failed,
    Canceled,
    /// Submission content rejected
    Invalid,
    /// No evaluator configured for the benchmark
    NoEval,
    /// Evaluation must be started manually
    NoAutoEval,
    /// Excluded by policy
    Excluded,
}

impl SubmissionStatus {
    /// Every status, in declaration order.
    pub const ALL: [SubmissionStatus; 12] = [
        SubmissionStatus::Uploading,
        SubmissionStatus::Uploaded,
        SubmissionStatus::OnQueue,
        SubmissionStatus::Validating,
        SubmissionStatus::Evaluating,
        SubmissionStatus::Completed,
        SubmissionStatus::Failed,
        SubmissionStatus::Canceled,
        SubmissionStatus::Invalid,
        SubmissionStatus::NoEval,
        SubmissionStatus::NoAutoEval,
        SubmissionStatus::Excluded,
    ];

    /// Check if transition from this status to `target` is an edge of the graph.
    pub fn can_transition_to(&self, target: SubmissionStatus) -> bool {
        use SubmissionStatus::*;
        match (self, target) {
            (Uploading, Uploaded) => true,
            (Uploaded, OnQueue) => true,
            (OnQueue, Validating) => true,
            (Validating, Evaluating) => true,
            (Evaluating, Completed | Failed | Canceled) => true,

            // Policy side-states
            (Uploaded | Evaluating, Invalid | NoEval | NoAutoEval | Excluded) => true,

            _ => false,
        }
    }

    /// Statuses reachable in one step.
    pub fn allowed_targets(&self) -> Vec<SubmissionStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|t| self.can_transition_to(*t))
            .collect()
    }

    /// No further automatic transition occurs from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Completed
                | SubmissionStatus::Failed
                | SubmissionStatus::Canceled
                | SubmissionStatus::Excluded
        )
    }

    /// Has no outgoing edges at all.
    pub fn is_absorbing(&self) -> bool {
        self.allowed_targets().is_empty()
    }

    pub fn as_str(&self) -> &'static str {
        use SubmissionStatus::*;
        match self {
            Uploading => "uploading",
            Uploaded => "uploaded",
            OnQueue => "on_queue",
            Validating => "validating",
            Evaluating => "evaluating",
            Completed => "completed",
            Failed => "failed",
            Canceled => "canceled",
            Invalid => "invalid",
            NoEval => "no_eval",
            NoAutoEval => "no_auto_eval",
            Excluded => "excluded",
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| TransitionError::UnknownStatus(s.to_string()))
    }
}

/// Errors for status operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal status transition from {from} to {to}")]
    Illegal {
        from: SubmissionStatus,
        to: SubmissionStatus,
    },

    #[error("unknown status: {0}")]
    UnknownStatus(String),
}

/// Submission record as held by the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub user_id: String,
    pub benchmark_id: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SubmissionStatus,
    #[serde(default)]
    pub evaluator_id: Option<String>,
    #[serde(default)]
    pub auto_eval: bool,
    #[serde(default)]
    pub author: Option<String>,
}

impl Submission {
    /// Create a new record in `uploading`.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        benchmark_id: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            benchmark_id: benchmark_id.into(),
            model_id: model_id.into(),
            created_at: now,
            updated_at: now,
            status: SubmissionStatus::Uploading,
            evaluator_id: None,
            auto_eval: false,
            author: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator_id: impl Into<String>) -> Self {
        self.evaluator_id = Some(evaluator_id.into());
        self
    }

    pub fn with_auto_eval(mut self, auto_eval: bool) -> Self {
        self.auto_eval = auto_eval;
        self
    }

    /// Move to `new_status`, a pure function of the current and requested status.
    pub fn transition(&mut self, new_status: SubmissionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(new_status) {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: new_status,
            });
        }
        self.status = new_status;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
