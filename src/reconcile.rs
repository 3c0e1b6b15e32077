//! Operator recovery for evaluations that lost their worker
//!
//! `scan` reports submissions whose lock files disagree with the store.
//! Nothing is changed automatically; the operator resolves each finding
//! with `requeue`, `fail_interrupted`, `release_orphan` or `reset`.

use std::fmt;
use std::path::Path;

use walkdir::WalkDir;

use crate::dispatch::{DispatchError, EvaluationDispatcher};
use crate::error::RelayError;
use crate::state::{StoreError, SubmissionStatus, SubmissionStore};
use crate::submission::{LockKind, LogFile, SubmissionDirectory};

/// What is wrong with a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    /// `evaluating` in the store, but the worker stopped mid-run
    Interrupted,
    /// `eval` lock still held after the submission reached a final status
    OrphanedEvalLock,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::Interrupted => f.write_str("interrupted"),
            Anomaly::OrphanedEvalLock => f.write_str("orphaned eval lock"),
        }
    }
}

/// One submission needing operator attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub submission_id: String,
    pub status: SubmissionStatus,
    pub anomaly: Anomaly,
    pub locks: Vec<LockKind>,
}

/// Walk the submission root and classify every directory.
///
/// Directories without a store record are skipped with a warning.
pub fn scan(root: &Path, store: &dyn SubmissionStore) -> Result<Vec<Finding>, RelayError> {
    let mut findings = Vec::new();
    if !root.is_dir() {
        return Ok(findings);
    }

    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| RelayError::Io(e.into()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let Some(id) = entry.file_name().to_str() else {
            continue;
        };
        let Ok(dir) = SubmissionDirectory::open(root, id) else {
            // Broker spool and record store live here too.
            continue;
        };

        let submission = match store.get_submission(id) {
            Ok(submission) => submission,
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(submission_id = %id, "Submission directory without a store record");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let locks = dir.held_locks();
        let anomaly = if submission.status == SubmissionStatus::Evaluating
            && locks.contains(&LockKind::Interrupted)
        {
            Some(Anomaly::Interrupted)
        } else if submission.status.is_absorbing() && locks.contains(&LockKind::Eval) {
            Some(Anomaly::OrphanedEvalLock)
        } else {
            None
        };

        if let Some(anomaly) = anomaly {
            tracing::debug!(submission_id = %id, status = %submission.status, %anomaly, "Reconcile finding");
            findings.push(Finding {
                submission_id: id.to_string(),
                status: submission.status,
                anomaly,
                locks,
            });
        }
    }
    Ok(findings)
}

/// Put an interrupted evaluation back on its queue.
pub fn requeue(dispatcher: &EvaluationDispatcher, submission_id: &str) -> Result<(), DispatchError> {
    dispatcher.requeue(submission_id, &[])?;
    Ok(())
}

/// Record an interrupted evaluation as failed and release its locks.
pub fn fail_interrupted(
    root: &Path,
    store: &dyn SubmissionStore,
    submission_id: &str,
) -> Result<(), RelayError> {
    let dir = SubmissionDirectory::open(root, submission_id)?;
    store.update_status(submission_id, SubmissionStatus::Failed)?;
    dir.append_log(LogFile::Submission, "interrupted evaluation marked failed by operator")?;
    dir.lock(LockKind::Interrupted).release()?;
    dir.lock(LockKind::Eval).release()?;
    tracing::info!(submission_id = %submission_id, "Interrupted evaluation marked failed");
    Ok(())
}

/// Drop an `eval` lock left behind by a finished evaluation.
pub fn release_orphan(
    root: &Path,
    store: &dyn SubmissionStore,
    submission_id: &str,
) -> Result<bool, RelayError> {
    let submission = store.get_submission(submission_id)?;
    if !submission.status.is_absorbing() {
        return Ok(false);
    }
    let dir = SubmissionDirectory::open(root, submission_id)?;
    let released = dir.lock(LockKind::Eval).release()?;
    if released {
        dir.append_log(LogFile::Submission, "released orphaned eval lock")?;
    }
    Ok(released)
}

/// Clear every lock on a submission.
pub fn reset(root: &Path, submission_id: &str) -> Result<Vec<LockKind>, RelayError> {
    let dir = SubmissionDirectory::open(root, submission_id)?;
    Ok(dir.reset()?)
}
