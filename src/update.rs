//! Applying evaluation outcomes
//!
//! Each `UpdateEvent` moves an `evaluating` submission to its terminal
//! status. Result files are pulled first, the status is written, and the
//! `eval` lock is released last so a new dispatch can never overlap the
//! previous run's cleanup. Redelivered events for a submission already in
//! the target status are no-ops.
//!
//! Events for one submission are applied one at a time; an event arriving
//! while another for the same submission is in progress is refused as busy
//! and redelivered. Interruption notices from workers only record the
//! `interrupted` marker centrally for the operator.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use relay_protocol::{Outcome, ProtocolError, UpdateEvent};
use thiserror::Error;

use crate::broker::Delivery;
use crate::config::RelayConfig;
use crate::remote::{RemoteSync, SyncError};
use crate::service::{DeliveryHandler, Disposition};
use crate::state::{StoreError, SubmissionStatus, SubmissionStore};
use crate::submission::{DirectoryError, LockError, LockKind, LogFile, SubmissionDirectory};

/// Update processing errors
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    UnknownKind(#[from] ProtocolError),

    #[error("submission {id} is {status}, not evaluating")]
    NotEvaluating { id: String, status: SubmissionStatus },

    #[error("another update for submission {0} is in progress")]
    Busy(String),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl UpdateError {
    /// Whether redelivering the same event later may succeed.
    ///
    /// An event can overtake the dispatcher's last status write, so an
    /// update for a submission still on its way to `evaluating` is retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpdateError::Sync(_) | UpdateError::Busy(_) => true,
            UpdateError::Store(e) => e.is_retryable(),
            UpdateError::NotEvaluating { status, .. } => matches!(
                status,
                SubmissionStatus::Uploaded | SubmissionStatus::OnQueue | SubmissionStatus::Validating
            ),
            _ => false,
        }
    }
}

/// Rebuilds a benchmark's leaderboard. Safe to call repeatedly.
pub trait LeaderboardRebuilder: Send + Sync {
    fn rebuild(&self, benchmark_id: &str) -> Result<(), String>;
}

/// Leaderboard collaborator that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLeaderboard;

impl LeaderboardRebuilder for NoopLeaderboard {
    fn rebuild(&self, benchmark_id: &str) -> Result<(), String> {
        tracing::debug!(benchmark_id = %benchmark_id, "Leaderboard rebuild requested");
        Ok(())
    }
}

/// Leaderboard collaborator that counts rebuilds per benchmark.
#[derive(Debug, Default)]
pub struct CountingLeaderboard {
    counts: Mutex<HashMap<String, usize>>,
}

impl CountingLeaderboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, benchmark_id: &str) -> usize {
        self.counts
            .lock()
            .map(|c| c.get(benchmark_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl LeaderboardRebuilder for CountingLeaderboard {
    fn rebuild(&self, benchmark_id: &str) -> Result<(), String> {
        let mut counts = self.counts.lock().map_err(|_| "counter poisoned".to_string())?;
        *counts.entry(benchmark_id.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    /// The submission moved to this status
    Applied(SubmissionStatus),
    /// The submission was already in this status; nothing changed
    Duplicate(SubmissionStatus),
}

fn target_status(outcome: Outcome) -> SubmissionStatus {
    match outcome {
        Outcome::Complete => SubmissionStatus::Completed,
        Outcome::Failed => SubmissionStatus::Failed,
        Outcome::Canceled => SubmissionStatus::Canceled,
    }
}

/// Marks a submission as having an update in progress until dropped.
struct InProgress<'a> {
    active: &'a Mutex<HashSet<String>>,
    submission_id: String,
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&self.submission_id);
    }
}

/// Reconciles update events into submission state.
pub struct UpdateProcessor {
    config: Arc<RelayConfig>,
    store: Arc<dyn SubmissionStore>,
    sync: Arc<RemoteSync>,
    leaderboard: Arc<dyn LeaderboardRebuilder>,
    in_progress: Mutex<HashSet<String>>,
}

impl UpdateProcessor {
    pub fn new(
        config: Arc<RelayConfig>,
        store: Arc<dyn SubmissionStore>,
        sync: Arc<RemoteSync>,
        leaderboard: Arc<dyn LeaderboardRebuilder>,
    ) -> Self {
        Self {
            config,
            store,
            sync,
            leaderboard,
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, submission_id: &str) -> Result<InProgress<'_>, UpdateError> {
        let mut active = self
            .in_progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.insert(submission_id.to_string()) {
            return Err(UpdateError::Busy(submission_id.to_string()));
        }
        Ok(InProgress {
            active: &self.in_progress,
            submission_id: submission_id.to_string(),
        })
    }

    /// Apply one event.
    pub fn process(&self, event: &UpdateEvent) -> Result<UpdateResult, UpdateError> {
        let outcome = event.outcome()?;
        let target = target_status(outcome);
        let _claim = self.claim(&event.submission_id)?;
        let submission = self.store.get_submission(&event.submission_id)?;
        let dir = SubmissionDirectory::open(&self.config.submission_root, &event.submission_id)?;

        if submission.status == target {
            // A crash between the status write and the unlock leaves the lock behind.
            dir.lock(LockKind::Eval).release()?;
            tracing::debug!(submission_id = %submission.id, status = %target, "Duplicate update ignored");
            return Ok(UpdateResult::Duplicate(target));
        }
        if submission.status != SubmissionStatus::Evaluating {
            return Err(UpdateError::NotEvaluating {
                id: submission.id,
                status: submission.status,
            });
        }

        match outcome {
            Outcome::Complete => {
                if !self.sync.is_noop(&event.host) {
                    self.sync.pull_results(&dir, &event.host)?;
                }
                self.store.update_status(&submission.id, target)?;
                if let Err(e) = self.leaderboard.rebuild(&submission.benchmark_id) {
                    tracing::warn!(
                        submission_id = %submission.id,
                        benchmark_id = %submission.benchmark_id,
                        error = %e,
                        "Leaderboard rebuild failed"
                    );
                    dir.append_log(LogFile::Submission, &format!("leaderboard rebuild failed: {}", e))?;
                }
            }
            Outcome::Failed => {
                if !self.sync.is_noop(&event.host) {
                    // Logs are diagnostics only; the failure is recorded either way.
                    if let Err(e) = self.sync.pull_logs(&dir, &event.host) {
                        tracing::warn!(submission_id = %submission.id, host = %event.host, error = %e, "Could not pull evaluation logs");
                    }
                }
                self.store.update_status(&submission.id, target)?;
            }
            Outcome::Canceled => {
                self.store.update_status(&submission.id, target)?;
            }
        }

        dir.append_log(
            LogFile::Submission,
            &format!("evaluation {} on {}", outcome, event.host),
        )?;
        dir.lock(LockKind::Eval).release()?;
        tracing::info!(submission_id = %submission.id, host = %event.host, status = %target, "Applied update");
        Ok(UpdateResult::Applied(target))
    }

    /// Record a worker's interruption notice in the central directory.
    ///
    /// Returns `false` when the submission already left `evaluating`, in
    /// which case the notice is stale and nothing is written.
    pub fn record_interrupted(&self, submission_id: &str, host: &str) -> Result<bool, UpdateError> {
        let _claim = self.claim(submission_id)?;
        let submission = self.store.get_submission(submission_id)?;
        match submission.status {
            SubmissionStatus::Evaluating => {}
            SubmissionStatus::Uploaded | SubmissionStatus::OnQueue | SubmissionStatus::Validating => {
                return Err(UpdateError::NotEvaluating {
                    id: submission.id,
                    status: submission.status,
                });
            }
            status => {
                tracing::info!(submission_id = %submission_id, host = %host, status = %status, "Stale interruption notice ignored");
                return Ok(false);
            }
        }

        let dir = SubmissionDirectory::open(&self.config.submission_root, submission_id)?;
        if dir.lock(LockKind::Interrupted).acquire()? {
            dir.append_log(
                LogFile::Submission,
                &format!("evaluation interrupted on {}; awaiting operator", host),
            )?;
        }
        tracing::warn!(submission_id = %submission_id, host = %host, "Evaluation interrupted by worker shutdown");
        Ok(true)
    }

    fn handle_interrupted(&self, submission_id: &str, host: &str) -> Disposition {
        match self.record_interrupted(submission_id, host) {
            Ok(_) => Disposition::Ack,
            Err(e) if e.is_retryable() => {
                tracing::warn!(submission_id = %submission_id, error = %e, "Interruption not recorded; will retry");
                Disposition::Nack
            }
            Err(e) => {
                tracing::error!(submission_id = %submission_id, host = %host, error = %e, "Interruption notice rejected");
                Disposition::Ack
            }
        }
    }
}

impl DeliveryHandler for UpdateProcessor {
    fn handle(&self, delivery: &Delivery) -> Disposition {
        let event = match &delivery.envelope.body {
            relay_protocol::Message::Update(event) => event,
            relay_protocol::Message::Interrupted { submission_id, host } => {
                return self.handle_interrupted(submission_id, host);
            }
            other => {
                tracing::error!(queue = %delivery.queue, message = ?other, "Unexpected message on update queue; dropping");
                return Disposition::Ack;
            }
        };
        match self.process(event) {
            Ok(_) => Disposition::Ack,
            Err(e) if e.is_retryable() => {
                tracing::warn!(submission_id = %event.submission_id, error = %e, "Update not applied; will retry");
                Disposition::Nack
            }
            Err(e) => {
                tracing::error!(submission_id = %event.submission_id, kind = %event.kind, error = %e, "Update rejected");
                Disposition::Ack
            }
        }
    }
}
