//! Evaluation worker
//!
//! Runs on an execution host and consumes that host's `eval.<host>` queue.
//! Each job runs in the submission directory with its output appended to
//! `evaluation.log`; the outcome goes back on the `update` queue. A
//! `cancel` message on the same queue stops a running job, which then
//! reports `canceled`. Jobs stopped by a worker shutdown are left
//! `interrupted` for the operator: the worker publishes an `interrupted`
//! notice instead of an outcome, so the marker also lands in the
//! submission's central directory.

mod active;

pub use active::{ActiveJobs, JobExit, StopReason};

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use relay_protocol::{EvaluationJob, Message, Outcome, Queue, UpdateEvent};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, BrokerError, Delivery};
use crate::service::{DeliveryHandler, Disposition};
use crate::submission::{DirectoryError, LockError, LockKind, LogFile, SubmissionDirectory};

/// How often a running job is checked for exit and shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Worker errors
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("job directory {path} does not belong to submission {id}")]
    PathMismatch { path: PathBuf, id: String },

    #[error("job for host {job_host} delivered to worker on {host}")]
    WrongHost { job_host: String, host: String },

    #[error("submission {0} is already running on this worker")]
    AlreadyRunning(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How a job ended on this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobReport {
    /// Ran to an outcome that must be reported
    Finished(Outcome),
    /// Stopped by shutdown; left for reconciliation
    Interrupted,
}

/// Consumes evaluation jobs for one execution host.
pub struct EvaluationWorker {
    host: String,
    broker: Arc<dyn Broker>,
    active: Arc<ActiveJobs>,
    shutdown: CancellationToken,
}

impl EvaluationWorker {
    pub fn new(
        host: impl Into<String>,
        broker: Arc<dyn Broker>,
        shutdown: CancellationToken,
        kill_grace: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            broker,
            active: Arc::new(ActiveJobs::new(kill_grace)),
            shutdown,
        }
    }

    /// The queue this worker consumes jobs from.
    pub fn queue(&self) -> Queue {
        Queue::eval(&self.host)
    }

    pub fn active_jobs(&self) -> Arc<ActiveJobs> {
        self.active.clone()
    }

    /// Run one job to completion (or interruption).
    pub fn run_job(&self, job: &EvaluationJob) -> Result<JobReport, WorkerError> {
        if job.host != self.host {
            return Err(WorkerError::WrongHost {
                job_host: job.host.clone(),
                host: self.host.clone(),
            });
        }
        let dir = open_job_dir(job)?;
        fs::create_dir_all(dir.scores_dir())?;
        // A rerun supersedes an interruption left in this host's copy.
        if dir.lock(LockKind::Interrupted).release()? {
            tracing::info!(submission_id = %job.submission_id, "Cleared earlier interruption");
        }

        let spec = job.command();
        dir.append_log(
            LogFile::Evaluation,
            &format!("starting {}: {} {}", job.label, spec.program, spec.args.join(" ")),
        )?;
        if job.executor.is_batch() {
            dir.append_log(
                LogFile::Evaluation,
                &format!("batch job output goes to {}", LogFile::Slurm.file_name()),
            )?;
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.log_path(LogFile::Evaluation))?;
        let child = match Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(submission_id = %job.submission_id, program = %spec.program, error = %e, "Failed to start evaluator");
                dir.append_log(LogFile::Evaluation, &format!("failed to start {}: {}", spec.program, e))?;
                return Ok(JobReport::Finished(Outcome::Failed));
            }
        };

        if let Err(mut child) = self.active.register(dir.clone(), child) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(WorkerError::AlreadyRunning(job.submission_id.clone()));
        }
        tracing::info!(submission_id = %job.submission_id, executor = %job.executor, "Evaluation started");

        let exit = loop {
            if self.shutdown.is_cancelled() {
                if let Err(e) = self.active.interrupt(&job.submission_id) {
                    self.active.abort(&job.submission_id);
                    return Err(e.into());
                }
            }
            match self.active.poll(&job.submission_id) {
                Ok(Some(exit)) => break exit,
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    self.active.abort(&job.submission_id);
                    return Err(e.into());
                }
            }
        };

        let report = match exit.stop {
            Some(StopReason::Interrupted) => JobReport::Interrupted,
            Some(StopReason::Canceled) => JobReport::Finished(Outcome::Canceled),
            None if exit.status.success() => JobReport::Finished(Outcome::Complete),
            None => JobReport::Finished(Outcome::Failed),
        };
        let code = exit
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        dir.append_log(LogFile::Evaluation, &format!("evaluator exited ({})", code))?;
        tracing::info!(submission_id = %job.submission_id, exit = %code, report = ?report, "Evaluation finished");
        Ok(report)
    }

    fn report(&self, submission_id: &str, outcome: Outcome) -> Result<(), BrokerError> {
        let event = UpdateEvent::new(submission_id, &self.host, outcome);
        self.broker.send(&Queue::Update, Message::Update(event))?;
        Ok(())
    }

    fn report_interrupted(&self, submission_id: &str) {
        let notice = Message::Interrupted {
            submission_id: submission_id.to_string(),
            host: self.host.clone(),
        };
        // The local marker stays either way; reconcile on this host still sees it.
        if let Err(e) = self.broker.send(&Queue::Update, notice) {
            tracing::error!(submission_id = %submission_id, error = %e, "Failed to publish interruption notice");
        }
    }

    fn handle_job(&self, job: &EvaluationJob) -> Disposition {
        let outcome = match self.run_job(job) {
            Ok(JobReport::Finished(outcome)) => outcome,
            Ok(JobReport::Interrupted) => {
                self.report_interrupted(&job.submission_id);
                return Disposition::Ack;
            }
            Err(WorkerError::AlreadyRunning(id)) => {
                tracing::warn!(submission_id = %id, "Duplicate job delivery while running; dropping");
                return Disposition::Ack;
            }
            Err(e) => {
                tracing::error!(submission_id = %job.submission_id, error = %e, "Evaluation could not run");
                Outcome::Failed
            }
        };

        match self.report(&job.submission_id, outcome) {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                tracing::error!(submission_id = %job.submission_id, error = %e, "Failed to publish update");
                Disposition::Nack
            }
        }
    }
}

impl DeliveryHandler for EvaluationWorker {
    fn handle(&self, delivery: &Delivery) -> Disposition {
        match &delivery.envelope.body {
            Message::Job(job) => self.handle_job(job),
            Message::Cancel { submission_id } => {
                if !self.active.cancel(submission_id) {
                    tracing::info!(submission_id = %submission_id, "Cancel for an evaluation not running here; ignoring");
                }
                Disposition::Ack
            }
            Message::Echo { payload } => {
                tracing::info!(queue = %delivery.queue, payload = %payload, "Echo");
                Disposition::Ack
            }
            Message::Update(UpdateEvent { submission_id, .. }) | Message::Interrupted { submission_id, .. } => {
                tracing::error!(queue = %delivery.queue, submission_id = %submission_id, "Update message on an evaluation queue; dropping");
                Disposition::Ack
            }
        }
    }
}

/// Attach to the submission directory named by a job.
fn open_job_dir(job: &EvaluationJob) -> Result<SubmissionDirectory, WorkerError> {
    let path = Path::new(&job.submission_dir);
    let mismatch = || WorkerError::PathMismatch {
        path: path.to_path_buf(),
        id: job.submission_id.clone(),
    };
    if path.file_name().and_then(|n| n.to_str()) != Some(job.submission_id.as_str()) {
        return Err(mismatch());
    }
    let root = path.parent().ok_or_else(mismatch)?;
    Ok(SubmissionDirectory::open(root, &job.submission_id)?)
}
