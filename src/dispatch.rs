//! Evaluation dispatch
//!
//! Order of effects for one dispatch:
//!
//! 1. take the `eval` lock exclusively (a second dispatch fails here)
//! 2. resolve the evaluator and its allow-listed script path
//! 3. push the submission directory to a remote host
//! 4. publish the job on `eval.<host>`
//! 5. walk the status `uploaded → on_queue → validating → evaluating`
//!
//! Any failure before step 4 releases the lock and leaves the submission
//! in `uploaded` with nothing queued.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use relay_protocol::{EvaluationJob, Message, Queue};
use thiserror::Error;

use crate::broker::{Broker, BrokerError};
use crate::config::RelayConfig;
use crate::remote::{RemoteSync, SyncError};
use crate::state::{EvaluatorRecord, StoreError, Submission, SubmissionStatus, SubmissionStore};
use crate::submission::{DirectoryError, LockError, LockKind, LogFile, SubmissionDirectory};

/// Dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("submission {id} is {status}; only uploaded submissions can be dispatched")]
    NotDispatchable { id: String, status: SubmissionStatus },

    #[error("submission {0} is already dispatched")]
    AlreadyDispatched(String),

    #[error("submission {id} is {status}, not evaluating")]
    NotEvaluating { id: String, status: SubmissionStatus },

    #[error("submission {0} has no evaluator assigned")]
    NoEvaluator(String),

    #[error("submission {id} is blocked by the {lock} lock")]
    Blocked { id: String, lock: LockKind },

    #[error("evaluator '{evaluator}' references unknown host '{host}'")]
    UnknownHost { evaluator: String, host: String },

    #[error("script {script:?} resolves outside allow-listed root {root}")]
    ScriptOutsideRoot { script: String, root: PathBuf },

    #[error("script {0} does not exist")]
    ScriptNotFound(PathBuf),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// What a dispatch request ended in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The job is on the broker and the submission is `evaluating`
    Queued(EvaluationJob),
    /// No job was queued; the submission moved to this side-state
    Skipped(SubmissionStatus),
}

/// Sends uploaded submissions to their evaluators.
pub struct EvaluationDispatcher {
    config: Arc<RelayConfig>,
    store: Arc<dyn SubmissionStore>,
    broker: Arc<dyn Broker>,
    sync: Arc<RemoteSync>,
}

impl EvaluationDispatcher {
    pub fn new(
        config: Arc<RelayConfig>,
        store: Arc<dyn SubmissionStore>,
        broker: Arc<dyn Broker>,
        sync: Arc<RemoteSync>,
    ) -> Self {
        Self {
            config,
            store,
            broker,
            sync,
        }
    }

    /// Dispatch right after upload, honoring the submission's `auto_eval` flag.
    pub fn auto_dispatch(&self, submission_id: &str) -> Result<DispatchOutcome, DispatchError> {
        let submission = self.store.get_submission(submission_id)?;
        if submission.status == SubmissionStatus::Uploaded && !submission.auto_eval {
            self.store
                .update_status(submission_id, SubmissionStatus::NoAutoEval)?;
            tracing::info!(submission_id = %submission_id, "Auto-evaluation disabled; not dispatching");
            return Ok(DispatchOutcome::Skipped(SubmissionStatus::NoAutoEval));
        }
        self.dispatch(submission_id, &[])
    }

    /// Dispatch a submission to its assigned evaluator.
    ///
    /// `extra_args` are appended after the evaluator's base arguments.
    pub fn dispatch(&self, submission_id: &str, extra_args: &[String]) -> Result<DispatchOutcome, DispatchError> {
        let submission = self.store.get_submission(submission_id)?;
        let dir = SubmissionDirectory::open(&self.config.submission_root, submission_id)?;

        if dir.has_lock(LockKind::Eval) {
            return Err(DispatchError::AlreadyDispatched(submission_id.to_string()));
        }
        if submission.status != SubmissionStatus::Uploaded {
            return Err(DispatchError::NotDispatchable {
                id: submission_id.to_string(),
                status: submission.status,
            });
        }
        for lock in [LockKind::Upload, LockKind::Error, LockKind::Clean] {
            if dir.has_lock(lock) {
                return Err(DispatchError::Blocked {
                    id: submission_id.to_string(),
                    lock,
                });
            }
        }

        let Some(evaluator_id) = submission.evaluator_id.clone() else {
            self.store
                .update_status(submission_id, SubmissionStatus::NoEval)?;
            dir.append_log(LogFile::Submission, "no evaluator assigned; not dispatched")?;
            return Ok(DispatchOutcome::Skipped(SubmissionStatus::NoEval));
        };
        let evaluator = self.store.get_evaluator(&evaluator_id)?;

        let guard = match dir.lock(LockKind::Eval).guard() {
            Ok(guard) => guard,
            Err(LockError::Held(_)) => {
                return Err(DispatchError::AlreadyDispatched(submission_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let job = self.build_job(&submission, &evaluator, extra_args)?;

        if !self.sync.is_noop(&job.host) {
            self.sync.push(&dir, &job.host)?;
        }

        let queue = Queue::eval(&job.host);
        self.broker.send(&queue, Message::Job(job.clone()))?;
        guard.disarm();

        for status in [
            SubmissionStatus::OnQueue,
            SubmissionStatus::Validating,
            SubmissionStatus::Evaluating,
        ] {
            self.store.update_status(submission_id, status)?;
        }

        dir.append_log(
            LogFile::Submission,
            &format!("dispatched {} to {}", job.label, queue),
        )?;
        tracing::info!(
            submission_id = %submission_id,
            evaluator = %evaluator.id,
            host = %job.host,
            executor = %job.executor,
            "Dispatched evaluation"
        );
        Ok(DispatchOutcome::Queued(job))
    }

    /// Publish the job of an interrupted evaluation again.
    ///
    /// The submission stays `evaluating` and keeps its `eval` lock; the
    /// `interrupted` marker is cleared once the job is back on the queue.
    pub fn requeue(&self, submission_id: &str, extra_args: &[String]) -> Result<EvaluationJob, DispatchError> {
        let submission = self.store.get_submission(submission_id)?;
        if submission.status != SubmissionStatus::Evaluating {
            return Err(DispatchError::NotEvaluating {
                id: submission_id.to_string(),
                status: submission.status,
            });
        }
        let dir = SubmissionDirectory::open(&self.config.submission_root, submission_id)?;
        let evaluator_id = submission
            .evaluator_id
            .clone()
            .ok_or_else(|| DispatchError::NoEvaluator(submission_id.to_string()))?;
        let evaluator = self.store.get_evaluator(&evaluator_id)?;

        dir.lock(LockKind::Eval).acquire()?;
        let job = self.build_job(&submission, &evaluator, extra_args)?;
        if !self.sync.is_noop(&job.host) {
            self.sync.push(&dir, &job.host)?;
        }
        let queue = Queue::eval(&job.host);
        self.broker.send(&queue, Message::Job(job.clone()))?;
        dir.lock(LockKind::Interrupted).release()?;

        dir.append_log(LogFile::Submission, &format!("requeued {} on {}", job.label, queue))?;
        tracing::info!(submission_id = %submission_id, host = %job.host, "Requeued evaluation");
        Ok(job)
    }

    /// Ask the worker on the evaluator's host to stop a running evaluation.
    ///
    /// The worker reports `canceled` through the usual update path; nothing
    /// changes here. A job still waiting on the queue is not affected.
    pub fn cancel(&self, submission_id: &str) -> Result<Queue, DispatchError> {
        let submission = self.store.get_submission(submission_id)?;
        if submission.status != SubmissionStatus::Evaluating {
            return Err(DispatchError::NotEvaluating {
                id: submission_id.to_string(),
                status: submission.status,
            });
        }
        let evaluator_id = submission
            .evaluator_id
            .ok_or_else(|| DispatchError::NoEvaluator(submission_id.to_string()))?;
        let evaluator = self.store.get_evaluator(&evaluator_id)?;

        let queue = Queue::eval(&evaluator.host);
        self.broker.send(
            &queue,
            Message::Cancel {
                submission_id: submission_id.to_string(),
            },
        )?;
        if let Ok(dir) = SubmissionDirectory::open(&self.config.submission_root, submission_id) {
            dir.append_log(LogFile::Submission, &format!("cancel requested on {}", queue))?;
        }
        tracing::info!(submission_id = %submission_id, queue = %queue, "Requested cancellation");
        Ok(queue)
    }

    fn build_job(
        &self,
        submission: &Submission,
        evaluator: &EvaluatorRecord,
        extra_args: &[String],
    ) -> Result<EvaluationJob, DispatchError> {
        let host = self
            .config
            .host(&evaluator.host)
            .ok_or_else(|| DispatchError::UnknownHost {
                evaluator: evaluator.id.clone(),
                host: evaluator.host.clone(),
            })?;

        let script = resolve_script(
            &host.script_root,
            &evaluator.script,
            self.config.is_local(&host.name),
        )?;
        let submission_dir = self.sync.remote_dir(&host.name, &submission.id)?;
        // Local scripts resolve to canonical paths, so the root must match them.
        let script_root = if self.config.is_local(&host.name) {
            host.script_root
                .canonicalize()
                .unwrap_or_else(|_| host.script_root.clone())
        } else {
            host.script_root.clone()
        };

        let mut args = evaluator.args.clone();
        args.extend(extra_args.iter().cloned());

        Ok(EvaluationJob {
            label: format!("{}:{}", evaluator.id, submission.id),
            submission_id: submission.id.clone(),
            evaluator_id: evaluator.id.clone(),
            executor: evaluator.executor.clone(),
            script: script.display().to_string(),
            script_root: script_root.display().to_string(),
            args,
            host: host.name.clone(),
            submission_dir: submission_dir.display().to_string(),
        })
    }
}

/// Purely lexical normalization: drops `.` and folds `..`.
///
/// Returns `None` if `..` climbs above the path's root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

/// Resolve an evaluator script under its host's script root.
///
/// The check is lexical for remote hosts. On the local host the resolved
/// file must also exist and its canonical path (symlinks followed) must
/// stay under the canonical root.
pub fn resolve_script(root: &Path, script: &str, verify_on_disk: bool) -> Result<PathBuf, DispatchError> {
    let outside = || DispatchError::ScriptOutsideRoot {
        script: script.to_string(),
        root: root.to_path_buf(),
    };

    let root_norm = normalize(root).ok_or_else(outside)?;
    let candidate = root.join(script);
    let resolved = normalize(&candidate).ok_or_else(outside)?;
    if !resolved.starts_with(&root_norm) || resolved == root_norm {
        return Err(outside());
    }

    if verify_on_disk {
        let real = resolved
            .canonicalize()
            .map_err(|_| DispatchError::ScriptNotFound(resolved.clone()))?;
        let real_root = root_norm
            .canonicalize()
            .map_err(|_| DispatchError::ScriptNotFound(root_norm.clone()))?;
        if !real.starts_with(&real_root) {
            return Err(outside());
        }
        return Ok(real);
    }
    Ok(resolved)
}
