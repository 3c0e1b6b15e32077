//! Bounded consumer pool over a broker
//!
//! A feeder polls the broker on a blocking thread and forwards deliveries
//! over a bounded channel. Each delivery is handled on the blocking pool
//! while holding one of `pool_size` semaphore permits, which caps how many
//! evaluations or updates run at once. Cancelling the token stops intake;
//! buffered deliveries are nacked and in-flight handlers get the grace
//! period to finish.

use std::sync::Arc;
use std::time::Duration;

use relay_protocol::Queue;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::config::RelayConfig;

/// What to do with a delivery after handling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Settle; never redeliver
    Ack,
    /// Return to the queue for another attempt
    Nack,
}

/// Synchronous delivery handler run on the blocking pool.
pub trait DeliveryHandler: Send + Sync + 'static {
    fn handle(&self, delivery: &Delivery) -> Disposition;
}

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_size: usize,
    /// Broker receive timeout per poll
    pub poll_interval: Duration,
    /// Delay before a nacked delivery is returned to the queue
    pub retry_delay: Duration,
    /// How long shutdown waits for in-flight handlers
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            poll_interval: Duration::from_millis(200),
            retry_delay: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Pool settings from the `[worker]` and `[broker]` tables.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            pool_size: config.worker.pool_size,
            poll_interval: config.poll_interval(),
            retry_delay: config.poll_interval(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

/// Counters reported when a pool stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub handled: u64,
    pub acked: u64,
    pub nacked: u64,
    /// Handlers still running when the grace period expired
    pub abandoned: usize,
}

/// Consumes one or more queues with bounded concurrency.
pub struct ConsumerPool {
    broker: Arc<dyn Broker>,
    queues: Vec<Queue>,
    handler: Arc<dyn DeliveryHandler>,
    config: PoolConfig,
}

impl ConsumerPool {
    pub fn new(
        broker: Arc<dyn Broker>,
        queues: Vec<Queue>,
        handler: Arc<dyn DeliveryHandler>,
        config: PoolConfig,
    ) -> Self {
        Self {
            broker,
            queues,
            handler,
            config,
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> PoolStats {
        let pool_size = self.config.pool_size.max(1);
        let (tx, mut rx) = mpsc::channel::<Delivery>(pool_size);
        let permits = Arc::new(Semaphore::new(pool_size));
        let mut tasks: JoinSet<Disposition> = JoinSet::new();
        let mut stats = PoolStats::default();

        let names: Vec<String> = self.queues.iter().map(Queue::name).collect();
        info!(queues = ?names, pool_size, "Consumer pool started");

        let feeder = {
            let broker = self.broker.clone();
            let queues = self.queues.clone();
            let poll = self.config.poll_interval;
            let shutdown = shutdown.clone();
            tokio::task::spawn_blocking(move || feed(broker, queues, poll, tx, shutdown))
        };

        loop {
            // Reap finished handlers without blocking.
            while let Some(done) = tasks.try_join_next() {
                record(&mut stats, done);
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = rx.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            debug!(queue = %delivery.queue, message_id = %delivery.envelope.message_id, "Dispatching delivery");
            let handler = self.handler.clone();
            let broker = self.broker.clone();
            let retry_delay = self.config.retry_delay;
            tasks.spawn_blocking(move || {
                let disposition = handler.handle(&delivery);
                settle(broker.as_ref(), &delivery, disposition, retry_delay);
                drop(permit);
                disposition
            });
        }

        info!("Consumer pool stopping");
        rx.close();
        while let Ok(delivery) = rx.try_recv() {
            if let Err(e) = self.broker.nack(&delivery) {
                warn!(message_id = %delivery.envelope.message_id, error = %e, "Failed to return buffered delivery");
            }
            stats.nacked += 1;
        }

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(done) = tasks.join_next().await {
                record(&mut stats, done);
            }
        })
        .await;
        if drained.is_err() {
            stats.abandoned = tasks.len();
            warn!(abandoned = stats.abandoned, "Grace period expired with handlers still running");
            tasks.detach_all();
        }

        if let Err(e) = feeder.await {
            error!(error = %e, "Feeder task failed");
        }
        info!(?stats, "Consumer pool stopped");
        stats
    }
}

fn record(stats: &mut PoolStats, done: Result<Disposition, tokio::task::JoinError>) {
    stats.handled += 1;
    match done {
        Ok(Disposition::Ack) => stats.acked += 1,
        Ok(Disposition::Nack) => stats.nacked += 1,
        Err(e) => error!(error = %e, "Delivery handler panicked"),
    }
}

fn settle(broker: &dyn Broker, delivery: &Delivery, disposition: Disposition, retry_delay: Duration) {
    let result = match disposition {
        Disposition::Ack => broker.ack(delivery),
        Disposition::Nack => {
            std::thread::sleep(retry_delay);
            broker.nack(delivery)
        }
    };
    if let Err(e) = result {
        error!(queue = %delivery.queue, message_id = %delivery.envelope.message_id, error = %e, "Failed to settle delivery");
    }
}

/// Poll each queue in turn and forward deliveries until cancelled.
fn feed(
    broker: Arc<dyn Broker>,
    queues: Vec<Queue>,
    poll: Duration,
    tx: mpsc::Sender<Delivery>,
    shutdown: CancellationToken,
) {
    let per_queue = poll / (queues.len().max(1) as u32);
    while !shutdown.is_cancelled() {
        for queue in &queues {
            match broker.receive(queue, per_queue) {
                Ok(Some(delivery)) => {
                    if let Err(returned) = tx.blocking_send(delivery) {
                        // Pool stopped; give the message back.
                        let _ = broker.nack(&returned.0);
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(queue = %queue, error = %e, "Broker receive failed");
                    std::thread::sleep(poll);
                }
            }
        }
    }
    debug!("Feeder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use relay_protocol::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        seen: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        delay: Duration,
    }

    impl Counting {
        fn new(delay: Duration) -> Self {
            Self {
                seen: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                delay,
            }
        }
    }

    impl DeliveryHandler for Counting {
        fn handle(&self, _delivery: &Delivery) -> Disposition {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.seen.fetch_add(1, Ordering::SeqCst);
            Disposition::Ack
        }
    }

    fn config(pool_size: usize) -> PoolConfig {
        PoolConfig {
            pool_size,
            poll_interval: Duration::from_millis(10),
            retry_delay: Duration::from_millis(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    async fn wait_for(pred: impl Fn() -> bool) {
        for _ in 0..500 {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_handles_and_acks_everything() {
        let broker = Arc::new(MemoryBroker::new());
        for i in 0..10 {
            broker
                .send(&Queue::Echo, Message::Echo { payload: i.to_string() })
                .unwrap();
        }
        let handler = Arc::new(Counting::new(Duration::from_millis(5)));
        let pool = ConsumerPool::new(broker.clone(), vec![Queue::Echo], handler.clone(), config(3));
        let token = CancellationToken::new();
        let run = tokio::spawn(pool.run(token.clone()));

        wait_for(|| handler.seen.load(Ordering::SeqCst) == 10).await;
        token.cancel();
        let stats = run.await.unwrap();

        assert_eq!(stats.acked, 10);
        assert_eq!(broker.inflight(), 0);
        assert!(handler.max_running.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_size_bounds_concurrency() {
        let broker = Arc::new(MemoryBroker::new());
        for _ in 0..6 {
            broker
                .send(&Queue::Echo, Message::Echo { payload: String::new() })
                .unwrap();
        }
        let handler = Arc::new(Counting::new(Duration::from_millis(30)));
        let pool = ConsumerPool::new(broker.clone(), vec![Queue::Echo], handler.clone(), config(1));
        let token = CancellationToken::new();
        let run = tokio::spawn(pool.run(token.clone()));

        wait_for(|| handler.seen.load(Ordering::SeqCst) == 6).await;
        token.cancel();
        run.await.unwrap();
        assert_eq!(handler.max_running.load(Ordering::SeqCst), 1);
    }

    struct NackOnce {
        attempts: AtomicUsize,
    }

    impl DeliveryHandler for NackOnce {
        fn handle(&self, _delivery: &Delivery) -> Disposition {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Disposition::Nack
            } else {
                Disposition::Ack
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_nacked_delivery_is_redelivered() {
        let broker = Arc::new(MemoryBroker::new());
        broker
            .send(&Queue::Update, Message::Echo { payload: "x".to_string() })
            .unwrap();
        let handler = Arc::new(NackOnce {
            attempts: AtomicUsize::new(0),
        });
        let pool = ConsumerPool::new(broker.clone(), vec![Queue::Update], handler.clone(), config(2));
        let token = CancellationToken::new();
        let run = tokio::spawn(pool.run(token.clone()));

        wait_for(|| handler.attempts.load(Ordering::SeqCst) >= 2).await;
        wait_for(|| broker.inflight() == 0 && broker.depth(&Queue::Update) == 0).await;
        token.cancel();
        let stats = run.await.unwrap();
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.acked, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_with_idle_queue() {
        let broker = Arc::new(MemoryBroker::new());
        let handler = Arc::new(Counting::new(Duration::ZERO));
        let pool = ConsumerPool::new(broker, vec![Queue::eval("local"), Queue::Echo], handler, config(2));
        let token = CancellationToken::new();
        token.cancel();
        let stats = pool.run(token).await;
        assert_eq!(stats, PoolStats::default());
    }
}
