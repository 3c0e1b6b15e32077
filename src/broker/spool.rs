//! Durable directory-backed broker
//!
//! ```text
//! <spool_root>/<queue>/tmp/       publish staging
//! <spool_root>/<queue>/pending/   deliverable, oldest first
//! <spool_root>/<queue>/inflight/  claimed, not yet acked
//! <spool_root>/<queue>/dead/      unparseable messages
//! ```
//!
//! Publishing and claiming are single renames, so concurrent consumers in
//! different processes never both claim the same message.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use relay_protocol::{Envelope, Queue};

use super::{Broker, BrokerError, Delivery, Result};

/// Broker persisted as one JSON file per message.
pub struct SpoolBroker {
    root: PathBuf,
    poll_interval: Duration,
    sequence: AtomicU64,
}

impl SpoolBroker {
    pub fn open(root: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            poll_interval,
            sequence: AtomicU64::new(0),
        })
    }

    fn queue_dir(&self, queue: &Queue, area: &str) -> PathBuf {
        self.root.join(queue.name()).join(area)
    }

    /// Move in-flight messages of `queues` back to pending. Run by a
    /// consumer at startup, before it receives, to redeliver messages
    /// claimed by a crashed predecessor.
    pub fn recover(&self, queues: &[Queue]) -> Result<usize> {
        let mut recovered = 0;
        for queue in queues {
            let inflight = self.queue_dir(queue, "inflight");
            if !inflight.is_dir() {
                continue;
            }
            let pending = self.queue_dir(queue, "pending");
            fs::create_dir_all(&pending)?;
            for message in fs::read_dir(&inflight)? {
                let message = message?;
                fs::rename(message.path(), pending.join(message.file_name()))?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::warn!(recovered, root = %self.root.display(), "Requeued in-flight messages");
        }
        Ok(recovered)
    }

    /// Messages waiting on `queue`.
    pub fn depth(&self, queue: &Queue) -> Result<usize> {
        Ok(sorted_entries(&self.queue_dir(queue, "pending"))?.len())
    }

    /// Claim the oldest pending message, if any.
    fn try_claim(&self, queue: &Queue) -> Result<Option<Delivery>> {
        let pending = self.queue_dir(queue, "pending");
        let inflight = self.queue_dir(queue, "inflight");
        for path in sorted_entries(&pending)? {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            fs::create_dir_all(&inflight)?;
            let claimed = inflight.join(&name);
            match fs::rename(&path, &claimed) {
                Ok(()) => {}
                // Another consumer won the race
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            let json = fs::read_to_string(&claimed)?;
            match Envelope::from_json(&json) {
                Ok(envelope) => {
                    return Ok(Some(Delivery {
                        queue: queue.clone(),
                        tag: name,
                        envelope,
                    }))
                }
                Err(e) => {
                    let dead = self.queue_dir(queue, "dead");
                    fs::create_dir_all(&dead)?;
                    fs::rename(&claimed, dead.join(&name))?;
                    tracing::error!(queue = %queue, message = %name, error = %e, "Moved unparseable message to dead letters");
                }
            }
        }
        Ok(None)
    }
}

/// Regular files in `dir`, oldest name first. A missing directory is empty.
fn sorted_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect::<Vec<_>>(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    entries.sort();
    Ok(entries)
}

impl Broker for SpoolBroker {
    fn publish(&self, queue: &Queue, envelope: &Envelope) -> Result<()> {
        let tmp = self.queue_dir(queue, "tmp");
        let pending = self.queue_dir(queue, "pending");
        fs::create_dir_all(&tmp)?;
        fs::create_dir_all(&pending)?;

        // Timestamp and sequence prefix keep directory order equal to publish order.
        let name = format!(
            "{}-{:08}-{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.6f"),
            self.sequence.fetch_add(1, Ordering::Relaxed),
            envelope.message_id
        );
        let staged = tmp.join(&name);
        fs::write(&staged, envelope.to_json()?)?;
        fs::rename(&staged, pending.join(&name))?;
        Ok(())
    }

    fn receive(&self, queue: &Queue, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.try_claim(queue)? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<()> {
        let path = self.queue_dir(&delivery.queue, "inflight").join(&delivery.tag);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BrokerError::UnknownDelivery(delivery.tag.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn nack(&self, delivery: &Delivery) -> Result<()> {
        let from = self.queue_dir(&delivery.queue, "inflight").join(&delivery.tag);
        let to = self.queue_dir(&delivery.queue, "pending").join(&delivery.tag);
        match fs::rename(&from, &to) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BrokerError::UnknownDelivery(delivery.tag.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
