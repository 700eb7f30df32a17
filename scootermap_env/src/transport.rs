//! Observation transport abstraction between the feed poller and the worker.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{Delivery, DeliveryTag};

/// Abstraction for the at-least-once message transport.
///
/// # Implementations
///
/// - **Production**: a broker consumer, or the stdin line reader in
///   `scootermap_worker`
/// - **Simulation**: an in-memory queue with redelivery and duplication faults
///
/// # Delivery Flow
///
/// ```text
/// Poller                  Transport                    Worker
///   |                         |                          |
///   |-- publish(obs) -------->|                          |
///   |                         |-- recv() -> Delivery --->|
///   |                         |                          |-- commit batch
///   |                         |<------- ack(tags) -------|
///   |                         |                          |
///   |                         |-- (unacked) redeliver -->|
/// ```
#[async_trait]
pub trait ObservationTransport: Send + Sync + 'static {
    /// Receives the next delivery.
    ///
    /// # Returns
    /// * `Some(delivery)` - A message was received
    /// * `None` - The transport was closed (shutdown)
    ///
    /// # Cancellation
    /// Implementations must be cancel-safe: the worker races `recv` against
    /// its flush deadline and drops the losing future.
    async fn recv(&self) -> Option<Delivery>;

    /// Acknowledges deliveries after their batch has been durably committed.
    ///
    /// Deliveries that are never acknowledged are eventually redelivered.
    async fn ack(&self, tags: &[DeliveryTag]) -> Result<(), EnvError>;

    /// Human-readable transport name (for logging).
    fn name(&self) -> &str;
}

/// Fault injection for simulated transports.
pub trait RedeliveryController: Send + Sync {
    /// Re-queues every delivery that has been received but not acknowledged.
    ///
    /// Returns the number of re-queued deliveries.
    fn redeliver_unacked(&self) -> usize;

    /// Sets the probability (0.0 - 1.0) that a published message is delivered twice.
    fn set_duplicate_rate(&self, rate: f64);

    /// When enabled, pending deliveries are handed out newest-first.
    fn set_reorder(&self, enabled: bool);
}
