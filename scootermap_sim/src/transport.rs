//! Simulated at-least-once transport with fault injection.
//!
//! Behaves like a broker queue with manual acknowledgement:
//! - `recv` moves a delivery to the in-flight set
//! - `ack` removes deliveries from the in-flight set
//! - `redeliver_unacked` puts every in-flight delivery back at the head of
//!   the queue, flagged as redelivered (what a broker does when a consumer
//!   connection drops)

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use scootermap_env::{Delivery, DeliveryTag, EnvError, ObservationTransport, RedeliveryController};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<Delivery>,
    in_flight: BTreeMap<DeliveryTag, Delivery>,
    next_tag: u64,
    closed: bool,
    duplicate_rate: f64,
    reorder: bool,
    published: u64,
    duplicates_injected: u64,
    acked: u64,
}

impl QueueState {
    fn enqueue(&mut self, payload: Vec<u8>, published_at_ms: i64, redelivered: bool) {
        let tag = DeliveryTag(self.next_tag);
        self.next_tag += 1;
        let mut delivery = Delivery::new(tag, payload, published_at_ms);
        delivery.redelivered = redelivered;
        self.queue.push_back(delivery);
    }
}

/// Delivery counters for scenario assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub published: u64,
    pub duplicates_injected: u64,
    pub acked: u64,
    pub pending: usize,
    pub in_flight: usize,
}

/// In-memory queue implementing [`ObservationTransport`].
pub struct SimTransport {
    state: Mutex<QueueState>,
    rng: Mutex<ChaCha8Rng>,
    notify: Notify,
}

impl SimTransport {
    /// Creates a transport whose duplicate injection is driven by `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn roll(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen_bool(rate.min(1.0))
    }

    /// Publishes one poll's worth of payloads.
    ///
    /// With reordering enabled the poll is enqueued in reverse. Each payload
    /// may also be duplicated according to the duplicate rate.
    pub fn publish_all(&self, payloads: Vec<Vec<u8>>, published_at_ms: i64) {
        let (rate, reorder) = {
            let state = self.state();
            (state.duplicate_rate, state.reorder)
        };
        let mut payloads = payloads;
        if reorder {
            payloads.reverse();
        }
        let duplicated: Vec<bool> = payloads.iter().map(|_| self.roll(rate)).collect();

        let mut state = self.state();
        for (payload, duplicate) in payloads.into_iter().zip(duplicated) {
            state.published += 1;
            if duplicate {
                state.duplicates_injected += 1;
                state.enqueue(payload.clone(), published_at_ms, true);
            }
            state.enqueue(payload, published_at_ms, false);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn publish(&self, payload: Vec<u8>, published_at_ms: i64) {
        self.publish_all(vec![payload], published_at_ms);
    }

    /// Ends the stream. `recv` returns `None` once the queue is drained.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    pub fn pending_len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state().in_flight.len()
    }

    pub fn stats(&self) -> TransportStats {
        let state = self.state();
        TransportStats {
            published: state.published,
            duplicates_injected: state.duplicates_injected,
            acked: state.acked,
            pending: state.queue.len(),
            in_flight: state.in_flight.len(),
        }
    }
}

#[async_trait]
impl ObservationTransport for SimTransport {
    async fn recv(&self) -> Option<Delivery> {
        loop {
            // Registered before the check so a publish in between is not missed
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if let Some(delivery) = state.queue.pop_front() {
                    state.in_flight.insert(delivery.tag, delivery.clone());
                    return Some(delivery);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    async fn ack(&self, tags: &[DeliveryTag]) -> Result<(), EnvError> {
        let mut state = self.state();
        for tag in tags {
            if state.in_flight.remove(tag).is_some() {
                state.acked += 1;
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "sim"
    }
}

impl RedeliveryController for SimTransport {
    fn redeliver_unacked(&self) -> usize {
        let mut state = self.state();
        let in_flight = std::mem::take(&mut state.in_flight);
        let count = in_flight.len();
        for (_, mut delivery) in in_flight.into_iter().rev() {
            delivery.redelivered = true;
            state.queue.push_front(delivery);
        }
        drop(state);

        if count > 0 {
            debug!(count, "redelivering unacked deliveries");
            self.notify.notify_waiters();
        }
        count
    }

    fn set_duplicate_rate(&self, rate: f64) {
        self.state().duplicate_rate = rate.clamp(0.0, 1.0);
    }

    fn set_reorder(&self, enabled: bool) {
        self.state().reorder = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads(n: u8) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i]).collect()
    }

    #[tokio::test]
    async fn test_fifo_until_closed() {
        let transport = SimTransport::new(1);
        transport.publish_all(payloads(3), 0);
        transport.close();

        let mut seen = Vec::new();
        while let Some(d) = transport.recv().await {
            seen.push(d.payload[0]);
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(transport.in_flight_len(), 3);
    }

    #[tokio::test]
    async fn test_acked_deliveries_are_not_redelivered() {
        let transport = SimTransport::new(1);
        transport.publish_all(payloads(3), 0);

        let first = transport.recv().await.unwrap();
        let second = transport.recv().await.unwrap();
        transport.ack(&[first.tag]).await.unwrap();

        assert_eq!(transport.redeliver_unacked(), 1);
        let again = transport.recv().await.unwrap();
        assert_eq!(again.tag, second.tag);
        assert!(again.redelivered);
        assert_eq!(transport.stats().acked, 1);
    }

    #[tokio::test]
    async fn test_reorder_reverses_poll() {
        let transport = SimTransport::new(1);
        transport.set_reorder(true);
        transport.publish_all(payloads(3), 0);
        transport.close();

        let mut seen = Vec::new();
        while let Some(d) = transport.recv().await {
            seen.push(d.payload[0]);
        }
        assert_eq!(seen, vec![2, 1, 0]);
    }

    #[test]
    fn test_duplicate_rate_one_doubles_queue() {
        let transport = SimTransport::new(9);
        transport.set_duplicate_rate(1.0);
        transport.publish_all(payloads(4), 0);

        let stats = transport.stats();
        assert_eq!(stats.published, 4);
        assert_eq!(stats.duplicates_injected, 4);
        assert_eq!(stats.pending, 8);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let transport = std::sync::Arc::new(SimTransport::new(1));
        let reader = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.recv().await })
        };
        tokio::task::yield_now().await;
        transport.publish(vec![42], 0);

        let delivery = reader.await.unwrap().unwrap();
        assert_eq!(delivery.payload, vec![42]);
    }
}
