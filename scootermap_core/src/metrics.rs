//! Worker Metrics
//! ==============
//!
//! Counters for everything the worker drops or retries instead of failing:
//! - **Rejected**: invalid records, per reason
//! - **Stale**: duplicate or out-of-order observations lost to the upsert rule
//! - **Retries**: commit attempts beyond the first
//!
//! Counters are atomics so query-side code can read a snapshot while the
//! worker is running.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::observation::RejectReason;
use crate::state::UpsertOutcome;

/// Live counters owned by one aggregation worker.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    received: AtomicU64,
    redelivered: AtomicU64,
    rejected_malformed: AtomicU64,
    rejected_missing_vehicle_id: AtomicU64,
    rejected_missing_timestamp: AtomicU64,
    rejected_invalid_coordinates: AtomicU64,
    rejected_future_timestamp: AtomicU64,
    duplicates_in_batch: AtomicU64,
    inserted: AtomicU64,
    updated: AtomicU64,
    stale: AtomicU64,
    batches_committed: AtomicU64,
    batches_failed: AtomicU64,
    commit_retries: AtomicU64,
    sweeps: AtomicU64,
    rows_swept: AtomicU64,
}

/// Point-in-time copy of [`WorkerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub redelivered: u64,
    pub rejected_malformed: u64,
    pub rejected_missing_vehicle_id: u64,
    pub rejected_missing_timestamp: u64,
    pub rejected_invalid_coordinates: u64,
    pub rejected_future_timestamp: u64,
    pub duplicates_in_batch: u64,
    pub inserted: u64,
    pub updated: u64,
    pub stale: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub commit_retries: u64,
    pub sweeps: u64,
    pub rows_swept: u64,
}

impl MetricsSnapshot {
    pub fn rejected_total(&self) -> u64 {
        self.rejected_malformed
            + self.rejected_missing_vehicle_id
            + self.rejected_missing_timestamp
            + self.rejected_invalid_coordinates
            + self.rejected_future_timestamp
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, count: usize, redelivered: usize) {
        bump(&self.received, count as u64);
        bump(&self.redelivered, redelivered as u64);
    }

    pub fn record_rejected(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::Malformed => &self.rejected_malformed,
            RejectReason::MissingVehicleId => &self.rejected_missing_vehicle_id,
            RejectReason::MissingTimestamp => &self.rejected_missing_timestamp,
            RejectReason::InvalidCoordinates => &self.rejected_invalid_coordinates,
            RejectReason::FutureTimestamp => &self.rejected_future_timestamp,
        };
        bump(counter, 1);
    }

    pub fn record_in_batch_duplicates(&self, count: usize) {
        bump(&self.duplicates_in_batch, count as u64);
    }

    pub fn record_commit(&self, outcome: &UpsertOutcome) {
        bump(&self.inserted, outcome.inserted as u64);
        bump(&self.updated, outcome.updated as u64);
        bump(&self.stale, outcome.stale as u64);
        bump(&self.batches_committed, 1);
    }

    pub fn record_retry(&self) {
        bump(&self.commit_retries, 1);
    }

    pub fn record_failed_batch(&self) {
        bump(&self.batches_failed, 1);
    }

    pub fn record_sweep(&self, removed: usize) {
        bump(&self.sweeps, 1);
        bump(&self.rows_swept, removed as u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: read(&self.received),
            redelivered: read(&self.redelivered),
            rejected_malformed: read(&self.rejected_malformed),
            rejected_missing_vehicle_id: read(&self.rejected_missing_vehicle_id),
            rejected_missing_timestamp: read(&self.rejected_missing_timestamp),
            rejected_invalid_coordinates: read(&self.rejected_invalid_coordinates),
            rejected_future_timestamp: read(&self.rejected_future_timestamp),
            duplicates_in_batch: read(&self.duplicates_in_batch),
            inserted: read(&self.inserted),
            updated: read(&self.updated),
            stale: read(&self.stale),
            batches_committed: read(&self.batches_committed),
            batches_failed: read(&self.batches_failed),
            commit_retries: read(&self.commit_retries),
            sweeps: read(&self.sweeps),
            rows_swept: read(&self.rows_swept),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_counted_per_reason() {
        let metrics = WorkerMetrics::new();
        metrics.record_rejected(RejectReason::Malformed);
        metrics.record_rejected(RejectReason::Malformed);
        metrics.record_rejected(RejectReason::FutureTimestamp);

        let snap = metrics.snapshot();
        assert_eq!(snap.rejected_malformed, 2);
        assert_eq!(snap.rejected_future_timestamp, 1);
        assert_eq!(snap.rejected_total(), 3);
    }

    #[test]
    fn test_commit_accumulates_outcome() {
        let metrics = WorkerMetrics::new();
        metrics.record_commit(&UpsertOutcome { inserted: 3, updated: 1, stale: 2 });
        metrics.record_commit(&UpsertOutcome { inserted: 0, updated: 4, stale: 0 });

        let snap = metrics.snapshot();
        assert_eq!(snap.inserted, 3);
        assert_eq!(snap.updated, 5);
        assert_eq!(snap.stale, 2);
        assert_eq!(snap.batches_committed, 2);
    }
}
