//! Built-in defaults for the optional config tables

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// `[log]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Fallback filter when `RUST_LOG` is unset (default: "info")
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// `[broker]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Spool directory; defaults to `<submission_root>/.broker`
    pub spool_root: Option<PathBuf>,
    /// How often a consumer polls an empty queue (default: 200ms)
    pub poll_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            spool_root: None,
            poll_interval_ms: 200,
        }
    }
}

/// `[worker]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent handlers per consumer pool (default: 4)
    pub pool_size: usize,
    /// How long shutdown waits for in-flight handlers (default: 30s)
    pub shutdown_grace_seconds: u64,
    /// Time between SIGTERM and SIGKILL for a stopped evaluator (default: 10s)
    pub kill_grace_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            shutdown_grace_seconds: 30,
            kill_grace_seconds: 10,
        }
    }
}

/// `[ssh]` table shared by every remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// SSH user (default: "relay")
    pub user: String,
    /// SSH port (default: 22)
    pub port: u16,
    /// Path to SSH private key
    #[serde(alias = "identity_file")]
    pub key_path: Option<String>,
    /// Connection timeout in seconds (default: 30)
    pub connect_timeout_seconds: u32,
    /// Server alive interval for detecting dead connections
    pub server_alive_interval: u32,
    pub server_alive_count_max: u32,
    pub rsync_bin: String,
    pub ssh_bin: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "relay".to_string(),
            port: 22,
            key_path: None,
            connect_timeout_seconds: 30,
            server_alive_interval: 15,
            server_alive_count_max: 2,
            rsync_bin: "rsync".to_string(),
            ssh_bin: "ssh".to_string(),
        }
    }
}

impl SshConfig {
    /// Options passed to every ssh invocation, before the destination.
    pub fn ssh_options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_seconds),
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.server_alive_interval),
            "-o".to_string(),
            format!("ServerAliveCountMax={}", self.server_alive_count_max),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];

        if let Some(key_path) = self.expanded_key_path() {
            args.push("-i".to_string());
            args.push(key_path.display().to_string());
        }
        args
    }

    /// Key path with a leading `~/` resolved against `$HOME`.
    pub fn expanded_key_path(&self) -> Option<PathBuf> {
        self.key_path.as_ref().map(|p| {
            if let Some(rest) = p.strip_prefix("~/") {
                if let Ok(home) = std::env::var("HOME") {
                    return PathBuf::from(home).join(rest);
                }
            }
            PathBuf::from(p)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let ssh = SshConfig::default();
        assert_eq!(ssh.port, 22);
        assert_eq!(ssh.connect_timeout_seconds, 30);
        assert_eq!(WorkerConfig::default().pool_size, 4);
        assert_eq!(LogConfig::default().level, "info");
        assert_eq!(BrokerConfig::default().poll_interval_ms, 200);
    }

    #[test]
    fn test_ssh_options_batch_mode_and_key() {
        let ssh = SshConfig {
            key_path: Some("/keys/relay".to_string()),
            port: 2222,
            ..SshConfig::default()
        };
        let args = ssh.ssh_options();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=30".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/keys/relay"));
    }
}
