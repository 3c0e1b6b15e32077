//! Mirroring submission directories between hosts
//!
//! Transfers shell out to rsync over ssh. Every transfer is preceded by an
//! ssh reachability probe so an unreachable host is reported separately
//! from a transfer that started and failed.

mod runner;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::config::{HostEntry, RelayConfig};
use crate::submission::{LogFile, SubmissionDirectory};

pub use runner::{CommandOutput, CommandRunner, RecordingRunner, SystemRunner};

/// Remote sync errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("host '{0}' is not in the inventory")]
    UnknownHost(String),

    #[error("host '{host}' is unreachable: {diagnostics}")]
    HostUnreachable { host: String, diagnostics: String },

    #[error("transfer with '{host}' failed (exit {code:?}): {diagnostics}")]
    TransferFailed {
        host: String,
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a submission directory lives on its execution host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    pub host: String,
    pub path: PathBuf,
}

/// Patterns never mirrored in either direction.
const ALWAYS_EXCLUDED: &[&str] = &["*.lock", ".parts/"];

/// Patterns only the relay side writes, protected when pulling.
const PULL_EXCLUDED: &[&str] = &["submission.log", "info.json", "archive.hash"];

/// Mirrors submission directories to and from execution hosts.
pub struct RemoteSync {
    config: Arc<RelayConfig>,
    runner: Arc<dyn CommandRunner>,
}

impl RemoteSync {
    pub fn new(config: Arc<RelayConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    fn host(&self, name: &str) -> Result<&HostEntry, SyncError> {
        self.config
            .host(name)
            .ok_or_else(|| SyncError::UnknownHost(name.to_string()))
    }

    /// Transfers to `host` are no-ops: same machine, same storage root.
    pub fn is_noop(&self, host: &str) -> bool {
        self.config.is_local(host)
            && self
                .config
                .host(host)
                .map_or(true, |h| h.submission_root == self.config.submission_root)
    }

    /// Directory of submission `id` on `host`.
    pub fn remote_dir(&self, host: &str, id: &str) -> Result<PathBuf, SyncError> {
        if self.is_noop(host) {
            return Ok(self.config.submission_root.join(id));
        }
        Ok(self.host(host)?.submission_root.join(id))
    }

    /// Probe `host` over ssh.
    pub fn check_reachable(&self, host: &str) -> Result<(), SyncError> {
        let entry = self.host(host)?;
        let mut args = self.config.ssh.ssh_options();
        args.push(entry.destination(&self.config.ssh.user));
        args.push("true".to_string());

        let output = self.runner.run(&self.config.ssh.ssh_bin, &args)?;
        if output.succeeded() {
            Ok(())
        } else {
            tracing::warn!(host = %host, code = ?output.code, "Host unreachable");
            Err(SyncError::HostUnreachable {
                host: host.to_string(),
                diagnostics: output.diagnostics(),
            })
        }
    }

    /// Mirror a submission directory onto `host`.
    pub fn push(&self, dir: &SubmissionDirectory, host: &str) -> Result<RemoteLocation, SyncError> {
        let remote = self.remote_dir(host, dir.id())?;
        if self.is_noop(host) {
            return Ok(RemoteLocation {
                host: host.to_string(),
                path: remote,
            });
        }

        let result = self.mirror(host, Direction::Push, dir.path(), &remote, Filter::Push, true);
        self.log_failure(dir, "push", &result);
        result?;

        tracing::info!(submission_id = %dir.id(), host = %host, remote = %remote.display(), "Pushed submission");
        Ok(RemoteLocation {
            host: host.to_string(),
            path: remote,
        })
    }

    /// Mirror `remote_dir` on `host` into `local_dir`.
    pub fn pull(&self, host: &str, remote_dir: &Path, local_dir: &Path) -> Result<(), SyncError> {
        if self.is_noop(host) {
            return Ok(());
        }
        self.mirror(host, Direction::Pull, local_dir, remote_dir, Filter::Pull, true)
    }

    /// Pull a finished evaluation's outputs back into the submission directory.
    pub fn pull_results(&self, dir: &SubmissionDirectory, host: &str) -> Result<(), SyncError> {
        let remote = self.remote_dir(host, dir.id())?;
        let result = self.pull(host, &remote, dir.path());
        self.log_failure(dir, "pull", &result);
        result
    }

    /// Pull only the `*.log` files of a failed evaluation.
    pub fn pull_logs(&self, dir: &SubmissionDirectory, host: &str) -> Result<(), SyncError> {
        if self.is_noop(host) {
            return Ok(());
        }
        let remote = self.remote_dir(host, dir.id())?;
        let result = self.mirror(host, Direction::Pull, dir.path(), &remote, Filter::LogsOnly, false);
        self.log_failure(dir, "pull logs", &result);
        result
    }

    fn log_failure(&self, dir: &SubmissionDirectory, what: &str, result: &Result<(), SyncError>) {
        if let Err(e) = result {
            let text = format!("{} failed: {}", what, e);
            if let Err(log_err) = dir.append_log(LogFile::Submission, &text) {
                tracing::warn!(submission_id = %dir.id(), error = %log_err, "Failed to append to submission log");
            }
        }
    }

    fn mirror(
        &self,
        host: &str,
        direction: Direction,
        local: &Path,
        remote: &Path,
        filter: Filter,
        delete: bool,
    ) -> Result<(), SyncError> {
        let local_only = self.config.is_local(host);
        if !local_only {
            self.check_reachable(host)?;
        }

        let mut args = vec![
            "-az".to_string(),
            "--checksum".to_string(),
            "--partial".to_string(),
        ];
        if delete {
            args.push("--delete".to_string());
        }
        args.extend(filter.args());

        let remote_spec = if local_only {
            format!("{}/", remote.display())
        } else {
            let entry = self.host(host)?;
            let mut ssh = vec![self.config.ssh.ssh_bin.clone()];
            ssh.extend(self.config.ssh.ssh_options());
            args.push("-e".to_string());
            args.push(ssh.join(" "));
            format!("{}:{}/", entry.destination(&self.config.ssh.user), remote.display())
        };
        let local_spec = format!("{}/", local.display());

        match direction {
            Direction::Push => {
                args.push(local_spec);
                args.push(remote_spec);
            }
            Direction::Pull => {
                args.push(remote_spec);
                args.push(local_spec);
            }
        }

        tracing::debug!(host = %host, ?direction, "Running rsync");
        let output = self.runner.run(&self.config.ssh.rsync_bin, &args)?;
        if output.succeeded() {
            Ok(())
        } else {
            Err(SyncError::TransferFailed {
                host: host.to_string(),
                code: output.code,
                diagnostics: output.diagnostics(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy)]
enum Filter {
    Push,
    Pull,
    LogsOnly,
}

impl Filter {
    fn args(self) -> Vec<String> {
        let exclude = |p: &&str| format!("--exclude={}", p);
        match self {
            Filter::Push => ALWAYS_EXCLUDED.iter().map(exclude).collect(),
            Filter::Pull => ALWAYS_EXCLUDED
                .iter()
                .chain(PULL_EXCLUDED)
                .map(exclude)
                .collect(),
            Filter::LogsOnly => vec![
                "--exclude=submission.log".to_string(),
                "--include=*.log".to_string(),
                "--exclude=*".to_string(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostEntry;
    use crate::submission::SubmissionInfo;
    use tempfile::TempDir;

    fn config(root: &Path) -> Arc<RelayConfig> {
        let mut config = RelayConfig::new(root);
        config.local_host = "web-1".to_string();
        config.hosts = vec![
            HostEntry {
                name: "web-1".to_string(),
                address: None,
                user: None,
                submission_root: root.to_path_buf(),
                script_root: PathBuf::from("/opt/eval"),
            },
            HostEntry {
                name: "gpu-node-1".to_string(),
                address: Some("10.0.0.5".to_string()),
                user: None,
                submission_root: PathBuf::from("/scratch/subs"),
                script_root: PathBuf::from("/opt/eval"),
            },
        ];
        Arc::new(config)
    }

    fn setup() -> (TempDir, Arc<RecordingRunner>, RemoteSync, SubmissionDirectory) {
        let root = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let sync = RemoteSync::new(config(root.path()), runner.clone());
        let dir = SubmissionDirectory::create(root.path(), &SubmissionInfo::new("s1", "u", "b", "m")).unwrap();
        (root, runner, sync, dir)
    }

    #[test]
    fn test_push_to_local_host_is_noop() {
        let (root, runner, sync, dir) = setup();
        let location = sync.push(&dir, "web-1").unwrap();
        assert_eq!(location.path, root.path().join("s1"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_push_probes_then_mirrors() {
        let (_root, runner, sync, dir) = setup();
        let location = sync.push(&dir, "gpu-node-1").unwrap();
        assert_eq!(location.path, PathBuf::from("/scratch/subs/s1"));

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0][0], "ssh");
        assert!(calls[0].contains(&"BatchMode=yes".to_string()));
        assert_eq!(calls[0].last().map(String::as_str), Some("true"));

        let rsync = &calls[1];
        assert_eq!(rsync[0], "rsync");
        for flag in ["-az", "--delete", "--checksum", "--partial", "--exclude=*.lock"] {
            assert!(rsync.contains(&flag.to_string()), "missing {}", flag);
        }
        assert_eq!(
            rsync.last().map(String::as_str),
            Some("relay@10.0.0.5:/scratch/subs/s1/")
        );
    }

    #[test]
    fn test_unreachable_host_is_distinct_and_logged() {
        let (_root, runner, sync, dir) = setup();
        runner.respond("true", CommandOutput::failure(255, "ssh: connect to host 10.0.0.5: No route to host"));

        let err = sync.push(&dir, "gpu-node-1").unwrap_err();
        assert!(matches!(err, SyncError::HostUnreachable { .. }));
        assert!(runner.calls_to("rsync").is_empty());

        let log = std::fs::read_to_string(dir.log_path(LogFile::Submission)).unwrap();
        assert!(log.contains("No route to host"));
    }

    #[test]
    fn test_transfer_failure_carries_diagnostics() {
        let (_root, runner, sync, dir) = setup();
        runner.respond("rsync", CommandOutput::failure(23, "rsync: some files could not be transferred"));

        match sync.push(&dir, "gpu-node-1").unwrap_err() {
            SyncError::TransferFailed { code, diagnostics, .. } => {
                assert_eq!(code, Some(23));
                assert!(diagnostics.contains("could not be transferred"));
            }
            other => panic!("expected TransferFailed, got {:?}", other),
        }
        let log = std::fs::read_to_string(dir.log_path(LogFile::Submission)).unwrap();
        assert!(log.contains("push failed"));
    }

    #[test]
    fn test_pull_logs_only_transfers_logs() {
        let (_root, runner, sync, dir) = setup();
        sync.pull_logs(&dir, "gpu-node-1").unwrap();

        let rsync = &runner.calls_to("rsync")[0];
        assert!(rsync.contains(&"--include=*.log".to_string()));
        assert!(rsync.contains(&"--exclude=*".to_string()));
        assert!(!rsync.contains(&"--delete".to_string()));
        assert_eq!(
            rsync[rsync.len() - 2],
            "relay@10.0.0.5:/scratch/subs/s1/"
        );
    }

    #[test]
    fn test_unknown_host() {
        let (_root, _runner, sync, dir) = setup();
        assert!(matches!(sync.push(&dir, "nowhere"), Err(SyncError::UnknownHost(_))));
    }
}
