//! Common types for the ScooterMap environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an aggregation worker process.
///
/// There is exactly one writer per store; the id only labels its logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    /// Creates a new random WorkerId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic WorkerId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Transport-assigned handle used to acknowledge a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryTag(pub u64);

/// Envelope for one message handed to the worker.
///
/// The payload is opaque bytes (one JSON observation record) that the
/// worker decodes and validates itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    /// Handle for acknowledging this delivery
    pub tag: DeliveryTag,

    /// The raw message bytes
    pub payload: Vec<u8>,

    /// Publish time on the producer's clock (Unix milliseconds)
    pub published_at_ms: i64,

    /// True if the transport has handed this message out before
    pub redelivered: bool,
}

impl Delivery {
    /// Creates a first-time delivery.
    pub fn new(tag: DeliveryTag, payload: Vec<u8>, published_at_ms: i64) -> Self {
        Self {
            tag,
            payload,
            published_at_ms,
            redelivered: false,
        }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
