//! Registry of evaluator processes running on this worker
//!
//! Stopping a job sends SIGTERM first; a job still alive after the kill
//! grace is killed outright on the next poll.

use std::collections::HashMap;
use std::io;
use std::process::{Child, ExitStatus};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::submission::{DirectoryError, LockKind, LogFile, SubmissionDirectory};

/// Why a running job was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator cancelled the evaluation
    Canceled,
    /// The worker is shutting down
    Interrupted,
}

/// A finished job.
#[derive(Debug)]
pub struct JobExit {
    pub status: ExitStatus,
    /// Set when the process was stopped rather than exiting on its own
    pub stop: Option<StopReason>,
}

struct ActiveJob {
    dir: SubmissionDirectory,
    child: Child,
    stop: Option<(StopReason, Instant)>,
}

/// Evaluations in progress, keyed by submission id.
pub struct ActiveJobs {
    jobs: Mutex<HashMap<String, ActiveJob>>,
    kill_grace: Duration,
}

impl ActiveJobs {
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            kill_grace,
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, ActiveJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a freshly spawned process. Hands the child back if the
    /// submission already has one running.
    pub fn register(&self, dir: SubmissionDirectory, child: Child) -> Result<(), Child> {
        let mut jobs = self.jobs();
        if jobs.contains_key(dir.id()) {
            return Err(child);
        }
        jobs.insert(
            dir.id().to_string(),
            ActiveJob {
                dir,
                child,
                stop: None,
            },
        );
        Ok(())
    }

    /// Check whether a job has exited; removes it from the registry if so.
    pub fn poll(&self, submission_id: &str) -> io::Result<Option<JobExit>> {
        let mut jobs = self.jobs();
        let job = jobs.get_mut(submission_id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no active job for {}", submission_id),
            )
        })?;

        match job.child.try_wait()? {
            Some(status) => {
                let stop = job.stop.map(|(reason, _)| reason);
                jobs.remove(submission_id);
                Ok(Some(JobExit { status, stop }))
            }
            None => {
                if let Some((_, since)) = job.stop {
                    if since.elapsed() >= self.kill_grace {
                        let _ = job.child.kill();
                    }
                }
                Ok(None)
            }
        }
    }

    /// Cancel a running evaluation. Returns `false` if nothing was running.
    pub fn cancel(&self, submission_id: &str) -> bool {
        let mut jobs = self.jobs();
        match jobs.get_mut(submission_id) {
            Some(job) if job.stop.is_none() => {
                if let Err(e) = job.dir.append_log(LogFile::Evaluation, "evaluation canceled") {
                    tracing::warn!(submission_id = %submission_id, error = %e, "Could not write evaluation log");
                }
                stop(job, StopReason::Canceled);
                tracing::info!(submission_id = %submission_id, "Canceled evaluation");
                true
            }
            _ => false,
        }
    }

    /// Mark a running evaluation `interrupted` and stop it.
    pub fn interrupt(&self, submission_id: &str) -> Result<bool, DirectoryError> {
        let mut jobs = self.jobs();
        match jobs.get_mut(submission_id) {
            Some(job) if job.stop.is_none() => {
                mark_interrupted(job)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Kill a job outright and drop it from the registry.
    ///
    /// Used when the job can no longer be tracked; returns `false` if
    /// nothing was registered.
    pub fn abort(&self, submission_id: &str) -> bool {
        let Some(mut job) = self.jobs().remove(submission_id) else {
            return false;
        };
        let _ = job.child.kill();
        let _ = job.child.wait();
        tracing::warn!(submission_id = %submission_id, "Aborted evaluation");
        true
    }

    /// Ids of running evaluations, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }
}

fn mark_interrupted(job: &mut ActiveJob) -> Result<(), DirectoryError> {
    job.dir.lock(LockKind::Interrupted).acquire()?;
    job.dir.append_log(
        LogFile::Submission,
        "worker shutting down; evaluation interrupted",
    )?;
    stop(job, StopReason::Interrupted);
    tracing::warn!(submission_id = %job.dir.id(), "Interrupted evaluation");
    Ok(())
}

fn stop(job: &mut ActiveJob, reason: StopReason) {
    job.stop = Some((reason, Instant::now()));
    terminate(&mut job.child);
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    if signal::kill(pid, Signal::SIGTERM).is_err() {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::submission::SubmissionInfo;
    use std::process::Command;
    use tempfile::TempDir;

    fn dir(root: &TempDir, id: &str) -> SubmissionDirectory {
        SubmissionDirectory::create(root.path(), &SubmissionInfo::new(id, "u1", "b1", "m1")).unwrap()
    }

    fn wait_exit(jobs: &ActiveJobs, id: &str) -> JobExit {
        for _ in 0..200 {
            if let Some(exit) = jobs.poll(id).unwrap() {
                return exit;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        panic!("job {} did not exit", id);
    }

    #[test]
    fn test_poll_reports_natural_exit() {
        let root = TempDir::new().unwrap();
        let jobs = ActiveJobs::new(Duration::from_secs(1));
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        jobs.register(dir(&root, "s1"), child).unwrap();

        let exit = wait_exit(&jobs, "s1");
        assert_eq!(exit.status.code(), Some(3));
        assert_eq!(exit.stop, None);
        assert!(jobs.is_empty());
    }

    #[test]
    fn test_register_twice_returns_child() {
        let root = TempDir::new().unwrap();
        let jobs = ActiveJobs::new(Duration::from_secs(1));
        let d = dir(&root, "s1");
        jobs.register(d.clone(), Command::new("sleep").arg("5").spawn().unwrap())
            .unwrap();

        let mut second = jobs
            .register(d, Command::new("true").spawn().unwrap())
            .unwrap_err();
        second.wait().unwrap();

        assert!(jobs.cancel("s1"));
        wait_exit(&jobs, "s1");
    }

    #[test]
    fn test_interrupt_marks_and_stops() {
        let root = TempDir::new().unwrap();
        let jobs = ActiveJobs::new(Duration::from_millis(100));
        let d = dir(&root, "s1");
        jobs.register(d.clone(), Command::new("sleep").arg("30").spawn().unwrap())
            .unwrap();

        assert!(jobs.interrupt("s1").unwrap());
        assert!(d.has_lock(LockKind::Interrupted));
        assert!(!jobs.interrupt("s1").unwrap(), "already stopping");

        let exit = wait_exit(&jobs, "s1");
        assert_eq!(exit.stop, Some(StopReason::Interrupted));
        let log = std::fs::read_to_string(d.log_path(LogFile::Submission)).unwrap();
        assert!(log.contains("interrupted"));
    }

    #[test]
    fn test_abort_kills_and_forgets() {
        use nix::sys::signal;
        use nix::unistd::Pid;

        let root = TempDir::new().unwrap();
        let jobs = ActiveJobs::new(Duration::from_secs(10));
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        jobs.register(dir(&root, "s1"), child).unwrap();

        assert!(jobs.abort("s1"));
        assert!(jobs.is_empty());
        assert!(signal::kill(pid, None).is_err(), "process reaped");
        assert!(!jobs.abort("s1"));
    }

    #[test]
    fn test_cancel_unknown_job() {
        let jobs = ActiveJobs::new(Duration::from_secs(1));
        assert!(!jobs.cancel("missing"));
        assert!(jobs.poll("missing").is_err());
    }
}
