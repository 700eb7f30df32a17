//! Store wrapper that injects commit failures.

use scootermap_core::{StoreError, UpsertOutcome, VehicleState, VehicleStateStore};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Fails commits on demand; reads always pass through.
pub struct FlakyStore {
    inner: Arc<dyn VehicleStateStore>,
    fail_next: AtomicU64,
    outage: AtomicBool,
    attempts: AtomicU64,
    injected: AtomicU64,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn VehicleStateStore>) -> Self {
        Self {
            inner,
            fail_next: AtomicU64::new(0),
            outage: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
            injected: AtomicU64::new(0),
        }
    }

    /// The next `count` commits fail with a transient error.
    pub fn fail_next(&self, count: u64) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// While set, every commit fails with a transient error.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    pub fn commit_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn injected_failures(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        if self.outage.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl VehicleStateStore for FlakyStore {
    fn upsert_if_newer(&self, candidates: &[VehicleState]) -> Result<UpsertOutcome, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail() {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        self.inner.upsert_if_newer(candidates)
    }

    fn scan_since(&self, since_ms: i64) -> Result<Vec<VehicleState>, StoreError> {
        self.inner.scan_since(since_ms)
    }

    fn delete_older_than(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        self.inner.delete_older_than(cutoff_ms)
    }

    fn get(&self, vehicle_id: &str) -> Result<Option<VehicleState>, StoreError> {
        self.inner.get(vehicle_id)
    }

    fn len(&self) -> Result<usize, StoreError> {
        self.inner.len()
    }
}
