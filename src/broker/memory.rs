//! In-process broker for tests and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use relay_protocol::{Envelope, Queue};

use super::{Broker, BrokerError, Delivery, Result};

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Envelope>>,
    inflight: HashMap<String, Delivery>,
    published: Vec<(String, Envelope)>,
    next_tag: u64,
    unavailable: bool,
}

/// Broker backed by in-memory queues.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    ready: Condvar,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Unavailable("broker mutex poisoned".to_string()))
    }

    /// Make every subsequent publish fail, simulating an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state() {
            state.unavailable = unavailable;
        }
    }

    /// Every envelope ever published to `queue`, in order.
    pub fn published(&self, queue: &Queue) -> Vec<Envelope> {
        let name = queue.name();
        self.state()
            .map(|state| {
                state
                    .published
                    .iter()
                    .filter(|(q, _)| *q == name)
                    .map(|(_, e)| e.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Messages waiting on `queue`.
    pub fn depth(&self, queue: &Queue) -> usize {
        self.state()
            .map(|state| state.queues.get(&queue.name()).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Deliveries not yet acked or nacked.
    pub fn inflight(&self) -> usize {
        self.state().map(|state| state.inflight.len()).unwrap_or(0)
    }
}

impl Broker for MemoryBroker {
    fn publish(&self, queue: &Queue, envelope: &Envelope) -> Result<()> {
        let mut state = self.state()?;
        if state.unavailable {
            return Err(BrokerError::Unavailable(format!("cannot publish to {}", queue)));
        }
        let name = queue.name();
        state.published.push((name.clone(), envelope.clone()));
        state.queues.entry(name).or_default().push_back(envelope.clone());
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    fn receive(&self, queue: &Queue, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        let name = queue.name();
        let mut state = self.state()?;
        loop {
            if let Some(envelope) = state.queues.get_mut(&name).and_then(VecDeque::pop_front) {
                state.next_tag += 1;
                let delivery = Delivery {
                    queue: queue.clone(),
                    tag: state.next_tag.to_string(),
                    envelope,
                };
                state.inflight.insert(delivery.tag.clone(), delivery.clone());
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .map_err(|_| BrokerError::Unavailable("broker mutex poisoned".to_string()))?
                .0;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.state()?
            .inflight
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownDelivery(delivery.tag.clone()))
    }

    fn nack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state()?;
        let pending = state
            .inflight
            .remove(&delivery.tag)
            .ok_or_else(|| BrokerError::UnknownDelivery(delivery.tag.clone()))?;
        state
            .queues
            .entry(pending.queue.name())
            .or_default()
            .push_front(pending.envelope);
        drop(state);
        self.ready.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::Message;
    use std::sync::Arc;

    fn echo(payload: &str) -> Message {
        Message::Echo {
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_fifo_per_queue() {
        let broker = MemoryBroker::new();
        broker.send(&Queue::Echo, echo("a")).unwrap();
        broker.send(&Queue::Echo, echo("b")).unwrap();
        broker.send(&Queue::Update, echo("c")).unwrap();

        let first = broker.receive(&Queue::Echo, Duration::ZERO).unwrap().unwrap();
        assert_eq!(first.envelope.body, echo("a"));
        assert_eq!(broker.depth(&Queue::Echo), 1);
        assert_eq!(broker.depth(&Queue::Update), 1);
    }

    #[test]
    fn test_nack_redelivers() {
        let broker = MemoryBroker::new();
        let sent = broker.send(&Queue::Echo, echo("a")).unwrap();

        let delivery = broker.receive(&Queue::Echo, Duration::ZERO).unwrap().unwrap();
        assert_eq!(broker.inflight(), 1);
        broker.nack(&delivery).unwrap();

        let again = broker.receive(&Queue::Echo, Duration::ZERO).unwrap().unwrap();
        assert_eq!(again.envelope.message_id, sent.message_id);
        broker.ack(&again).unwrap();
        assert_eq!(broker.inflight(), 0);
        assert!(matches!(broker.ack(&again), Err(BrokerError::UnknownDelivery(_))));
    }

    #[test]
    fn test_receive_times_out_empty() {
        let broker = MemoryBroker::new();
        let start = Instant::now();
        assert!(broker.receive(&Queue::Echo, Duration::from_millis(30)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_receive_wakes_on_publish() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = broker.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.send(&Queue::Echo, echo("late")).unwrap();
        });
        let delivery = broker.receive(&Queue::Echo, Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert!(delivery.is_some());
    }

    #[test]
    fn test_unavailable_publish_fails() {
        let broker = MemoryBroker::new();
        broker.set_unavailable(true);
        assert!(matches!(
            broker.send(&Queue::Echo, echo("a")),
            Err(BrokerError::Unavailable(_))
        ));
        assert!(broker.published(&Queue::Echo).is_empty());
    }
}
