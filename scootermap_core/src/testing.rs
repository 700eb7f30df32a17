//! Test doubles for the environment and store seams.

use async_trait::async_trait;
use scootermap_env::{Delivery, DeliveryTag, EnvError, MobilityContext, ObservationTransport};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::observation::Observation;
use crate::state::{MemoryStore, StoreError, UpsertOutcome, VehicleState, VehicleStateStore};

/// 2024-01-01 00:00:00 UTC in Unix milliseconds.
pub const EPOCH_MS: i64 = 1_704_067_200_000;

/// Virtual clock starting at [`EPOCH_MS`]; sleeping advances it.
#[derive(Debug, Default)]
pub struct ManualContext {
    elapsed_ns: AtomicU64,
}

impl ManualContext {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, by: Duration) {
        self.elapsed_ns.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Moves the clock to `secs` after the epoch.
    pub fn set_secs(&self, secs: u64) {
        self.elapsed_ns.store(secs * 1_000_000_000, Ordering::SeqCst);
    }
}

#[async_trait]
impl MobilityContext for ManualContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::SeqCst))
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(EPOCH_MS as u64) + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }
}

/// FIFO transport that reports `closed` once drained.
#[derive(Debug, Default)]
pub struct QueueTransport {
    pending: Mutex<VecDeque<Delivery>>,
    acked: Mutex<BTreeSet<DeliveryTag>>,
    next_tag: AtomicU64,
}

impl QueueTransport {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_payload(&self, payload: Vec<u8>) -> DeliveryTag {
        let tag = DeliveryTag(self.next_tag.fetch_add(1, Ordering::SeqCst));
        self.pending
            .lock()
            .unwrap()
            .push_back(Delivery::new(tag, payload, EPOCH_MS));
        tag
    }

    pub fn push(&self, observation: &Observation) -> DeliveryTag {
        self.push_payload(observation.to_payload())
    }

    pub fn acked(&self) -> BTreeSet<DeliveryTag> {
        self.acked.lock().unwrap().clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[async_trait]
impl ObservationTransport for QueueTransport {
    async fn recv(&self) -> Option<Delivery> {
        self.pending.lock().unwrap().pop_front()
    }

    async fn ack(&self, tags: &[DeliveryTag]) -> Result<(), EnvError> {
        self.acked.lock().unwrap().extend(tags.iter().copied());
        Ok(())
    }

    fn name(&self) -> &str {
        "queue"
    }
}

/// Wraps a MemoryStore and fails the next `failures` commits.
pub struct FailingStore {
    inner: MemoryStore,
    failures: AtomicUsize,
    permanent: bool,
    pub attempts: AtomicUsize,
}

impl FailingStore {
    pub fn transient(failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(failures),
            permanent: false,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn permanent() -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(usize::MAX),
            permanent: true,
            attempts: AtomicUsize::new(0),
        }
    }
}

impl VehicleStateStore for FailingStore {
    fn upsert_if_newer(&self, candidates: &[VehicleState]) -> Result<UpsertOutcome, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(if self.permanent {
                StoreError::Corrupt("injected".into())
            } else {
                StoreError::Unavailable("injected".into())
            });
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

/// Observation of `vehicle_id` at `(lat, lon)`, `secs` after [`EPOCH_MS`].
pub fn observation(vehicle_id: &str, lat: f64, lon: f64, secs: i64) -> Observation {
    Observation {
        vehicle_id: vehicle_id.to_string(),
        feed_id: "berlin".to_string(),
        lat,
        lon,
        observed_at: EPOCH_MS + secs * 1_000,
        is_reserved: false,
        is_disabled: false,
        vehicle_type_id: None,
    }
}
