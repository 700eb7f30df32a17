//! Aggregation Worker - turns the observation stream into committed state.
//!
//! # Pipeline
//!
//! ```text
//! transport ──recv──► collect_batch ──► prepare ──► commit ──► ack
//!                     (size | deadline   (decode,    (atomic    (only after
//!                      | closed)          validate,   upsert,    success)
//!                                         cells,      retried)
//!                                         dedupe)
//! ```
//!
//! Deliveries are acknowledged only after the batch they belong to has been
//! committed. A crash between commit and ack causes redelivery, which the
//! upsert rule absorbs. A batch that cannot be committed is never acked and
//! the error is returned to the caller.
//!
//! The worker is the only writer of the store. The retention sweep runs on
//! the same loop, between batches.

use scootermap_env::{Delivery, DeliveryTag, EnvError, MobilityContext, ObservationTransport, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{duration_millis, ConfigError, EngineConfig};
use crate::metrics::{MetricsSnapshot, WorkerMetrics};
use crate::observation::{Observation, RejectReason};
use crate::spatial::SpatialIndex;
use crate::state::{StoreError, UpsertOutcome, VehicleState, VehicleStateStore};

/// Identifier attached to every batch for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Worker errors
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Commit retries exhausted, or a permanent store error. The batch was not acked.
    #[error("Batch {batch_id} failed after {attempts} attempt(s): {source}")]
    BatchFailed {
        batch_id: BatchId,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] EnvError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The blocking store task panicked or was cancelled
    #[error("Store task failed: {0}")]
    Task(String),
}

/// Deliveries gathered by one [`AggregationWorker::collect_batch`] call.
#[derive(Debug, Default)]
pub struct CollectedBatch {
    pub deliveries: Vec<Delivery>,
    /// The transport reported end of stream
    pub closed: bool,
}

/// A batch after decoding, validation, cell encoding and in-batch dedupe.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub batch_id: BatchId,
    /// Every delivery tag in the batch, including rejected records
    pub tags: Vec<DeliveryTag>,
    /// At most one candidate per vehicle, ordered by vehicle id
    pub candidates: Vec<VehicleState>,
    pub rejected: usize,
    pub duplicates: usize,
}

/// Summary of one committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub received: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub outcome: UpsertOutcome,
    /// Commit attempts used (0 when nothing valid was left to commit)
    pub attempts: u32,
}

/// Summary of one retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub cutoff_ms: i64,
    pub removed: usize,
}

/// Single writer of the vehicle state store.
///
/// Generic over the context and transport so the same worker runs against
/// the tokio runtime with a broker transport, or under deterministic
/// simulation.
pub struct AggregationWorker<Ctx, T>
where
    Ctx: MobilityContext,
    T: ObservationTransport,
{
    worker_id: WorkerId,
    context: Arc<Ctx>,
    transport: Arc<T>,
    store: Arc<dyn VehicleStateStore>,
    spatial: SpatialIndex,
    config: EngineConfig,
    metrics: Arc<WorkerMetrics>,
    next_sweep: Duration,
}

impl<Ctx, T> AggregationWorker<Ctx, T>
where
    Ctx: MobilityContext,
    T: ObservationTransport,
{
    pub fn new(
        context: Arc<Ctx>,
        transport: Arc<T>,
        store: Arc<dyn VehicleStateStore>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        let resolutions = config.validate()?;
        Ok(Self {
            worker_id: WorkerId::new(),
            context,
            transport,
            store,
            spatial: SpatialIndex::new(resolutions),
            config,
            metrics: Arc::new(WorkerMetrics::new()),
            // First loop iteration sweeps, clearing rows left over from downtime
            next_sweep: Duration::ZERO,
        })
    }

    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared handle to the live counters.
    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Buffers deliveries until `batch_size` is reached, the flush interval
    /// elapses, or the transport closes, whichever comes first.
    ///
    /// `recv` is raced against the deadline, so the transport's `recv` must
    /// be cancel-safe.
    pub async fn collect_batch(&self) -> CollectedBatch {
        let mut batch = CollectedBatch::default();
        let deadline = self.context.now() + self.config.batch_flush_interval;

        loop {
            if batch.deliveries.len() >= self.config.batch_size {
                break;
            }
            let remaining = deadline.saturating_sub(self.context.now());
            if remaining.is_zero() {
                break;
            }

            tokio::select! {
                biased;
                next = self.transport.recv() => match next {
                    Some(delivery) => batch.deliveries.push(delivery),
                    None => {
                        batch.closed = true;
                        break;
                    }
                },
                _ = self.context.sleep(remaining) => break,
            }
        }

        batch
    }

    /// Decodes, validates and cell-encodes every delivery, keeping the newest
    /// candidate per vehicle. Ties keep the first one seen.
    ///
    /// Rejected records are counted and logged; their tags stay in the batch
    /// so they are acked with it.
    pub fn prepare(&self, deliveries: &[Delivery], now_ms: i64) -> PreparedBatch {
        let mut newest: BTreeMap<String, VehicleState> = BTreeMap::new();
        let mut tags = Vec::with_capacity(deliveries.len());
        let mut rejected = 0;
        let mut duplicates = 0;

        for delivery in deliveries {
            tags.push(delivery.tag);

            let candidate = match self.candidate(&delivery.payload, now_ms) {
                Ok(candidate) => candidate,
                Err(reason) => {
                    rejected += 1;
                    self.metrics.record_rejected(reason);
                    debug!(tag = delivery.tag.0, reason = reason.as_str(), "rejected observation");
                    continue;
                }
            };

            match newest.entry(candidate.vehicle_id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(candidate);
                }
                Entry::Occupied(mut slot) => {
                    duplicates += 1;
                    if candidate.supersedes(slot.get()) {
                        slot.insert(candidate);
                    }
                }
            }
        }

        self.metrics.record_in_batch_duplicates(duplicates);

        PreparedBatch {
            batch_id: BatchId::new(),
            tags,
            candidates: newest.into_values().collect(),
            rejected,
            duplicates,
        }
    }

    fn candidate(&self, payload: &[u8], now_ms: i64) -> Result<VehicleState, RejectReason> {
        let observation = Observation::parse(payload, now_ms, self.config.max_future_skew)?;
        let cells = self
            .spatial
            .cells_for(observation.lat, observation.lon)
            .map_err(|_| RejectReason::InvalidCoordinates)?;
        Ok(VehicleState::from_observation(observation, cells, now_ms))
    }

    /// Applies the candidates as one atomic upsert, retrying transient
    /// failures with exponential backoff.
    ///
    /// Returns the outcome and the number of attempts used.
    pub async fn commit(&self, batch: &PreparedBatch) -> Result<(UpsertOutcome, u32), WorkerError> {
        let candidates = Arc::new(batch.candidates.clone());
        let max_attempts = self.config.max_commit_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let store = Arc::clone(&self.store);
            let rows = Arc::clone(&candidates);
            let result = tokio::task::spawn_blocking(move || store.upsert_if_newer(&rows))
                .await
                .map_err(|e| WorkerError::Task(e.to_string()))?;

            match result {
                Ok(outcome) => return Ok((outcome, attempt)),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.config.retry_delay(attempt);
                    self.metrics.record_retry();
                    warn!(
                        batch_id = %batch.batch_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "commit failed, retrying"
                    );
                    self.context.sleep(delay).await;
                }
                Err(e) => {
                    self.metrics.record_failed_batch();
                    error!(batch_id = %batch.batch_id, attempts = attempt, error = %e, "batch failed");
                    return Err(WorkerError::BatchFailed {
                        batch_id: batch.batch_id,
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    /// Prepares, commits and acknowledges one batch of deliveries.
    pub async fn process_batch(&self, deliveries: Vec<Delivery>) -> Result<BatchReport, WorkerError> {
        if deliveries.is_empty() {
            return Ok(BatchReport::default());
        }

        let now_ms = self.context.unix_millis();
        let redelivered = deliveries.iter().filter(|d| d.redelivered).count();
        self.metrics.record_received(deliveries.len(), redelivered);

        let prepared = self.prepare(&deliveries, now_ms);
        let (outcome, attempts) = if prepared.candidates.is_empty() {
            (UpsertOutcome::default(), 0)
        } else {
            self.commit(&prepared).await?
        };
        self.metrics.record_commit(&outcome);

        self.transport.ack(&prepared.tags).await?;

        info!(
            batch_id = %prepared.batch_id,
            received = deliveries.len(),
            rejected = prepared.rejected,
            duplicates = prepared.duplicates,
            inserted = outcome.inserted,
            updated = outcome.updated,
            stale = outcome.stale,
            attempts,
            "batch committed"
        );

        Ok(BatchReport {
            received: deliveries.len(),
            rejected: prepared.rejected,
            duplicates: prepared.duplicates,
            outcome,
            attempts,
        })
    }

    /// Deletes rows observed before `now - retention_horizon`.
    pub async fn sweep(&self) -> Result<SweepReport, WorkerError> {
        let cutoff_ms = self
            .context
            .unix_millis()
            .saturating_sub(duration_millis(self.config.retention_horizon));

        let store = Arc::clone(&self.store);
        let removed = tokio::task::spawn_blocking(move || store.delete_older_than(cutoff_ms))
            .await
            .map_err(|e| WorkerError::Task(e.to_string()))??;

        self.metrics.record_sweep(removed);
        if removed > 0 {
            info!(cutoff_ms, removed, "retention sweep");
        }
        Ok(SweepReport { cutoff_ms, removed })
    }

    /// Sweeps if the sweep interval has elapsed. A failed sweep is logged
    /// and retried at the next interval.
    pub async fn maybe_sweep(&mut self) -> Option<SweepReport> {
        let now = self.context.now();
        if now < self.next_sweep {
            return None;
        }
        self.next_sweep = now + self.config.sweep_interval;

        match self.sweep().await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "retention sweep failed");
                None
            }
        }
    }

    /// One loop iteration: sweep if due, collect a batch, process it.
    ///
    /// Returns `false` once the transport has closed.
    pub async fn step(&mut self) -> Result<bool, WorkerError> {
        self.maybe_sweep().await;
        let batch = self.collect_batch().await;
        if !batch.deliveries.is_empty() {
            self.process_batch(batch.deliveries).await?;
        }
        Ok(!batch.closed)
    }

    /// Runs until the transport closes or a batch fails.
    pub async fn run(&mut self) -> Result<MetricsSnapshot, WorkerError> {
        info!(
            worker_id = %self.worker_id,
            transport = self.transport.name(),
            resolutions = ?self.spatial.resolutions().as_u8(),
            "aggregation worker started"
        );

        while self.step().await? {}

        let summary = self.metrics.snapshot();
        info!(
            worker_id = %self.worker_id,
            received = summary.received,
            committed = summary.batches_committed,
            "transport closed, worker stopped"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use crate::testing::{observation, FailingStore, ManualContext, QueueTransport, EPOCH_MS};
    use proptest::prelude::*;
    use std::sync::atomic::Ordering;

    const ALEX: (f64, f64) = (52.5219, 13.4132);
    const ZOO: (f64, f64) = (52.5074, 13.3373);

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_batch_size(100)
            .with_commit_retries(3, Duration::from_millis(10), Duration::from_millis(40))
    }

    fn worker(
        store: Arc<dyn VehicleStateStore>,
        config: EngineConfig,
    ) -> (AggregationWorker<ManualContext, QueueTransport>, Arc<ManualContext>, Arc<QueueTransport>) {
        let ctx = ManualContext::shared();
        let transport = QueueTransport::shared();
        let w = AggregationWorker::new(ctx.clone(), transport.clone(), store, config).unwrap();
        (w, ctx, transport)
    }

    fn deliveries(observations: &[Observation]) -> Vec<Delivery> {
        observations
            .iter()
            .enumerate()
            .map(|(i, o)| Delivery::new(DeliveryTag(i as u64), o.to_payload(), EPOCH_MS))
            .collect()
    }

    #[tokio::test]
    async fn test_redelivered_batch_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let (w, _ctx, _t) = worker(store.clone(), config());
        let batch = [
            observation("a", ALEX.0, ALEX.1, 10),
            observation("b", ZOO.0, ZOO.1, 10),
        ];

        let first = w.process_batch(deliveries(&batch)).await.unwrap();
        let snapshot = store.scan_since(i64::MIN).unwrap();
        let second = w.process_batch(deliveries(&batch)).await.unwrap();

        assert_eq!(first.outcome.inserted, 2);
        assert_eq!(second.outcome.stale, 2);
        assert_eq!(store.scan_since(i64::MIN).unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_out_of_order_keeps_newest() {
        let store = Arc::new(MemoryStore::new());
        let (w, _ctx, _t) = worker(store.clone(), config());

        w.process_batch(deliveries(&[observation("a", ZOO.0, ZOO.1, 20)]))
            .await
            .unwrap();
        let report = w
            .process_batch(deliveries(&[observation("a", ALEX.0, ALEX.1, 10)]))
            .await
            .unwrap();

        assert_eq!(report.outcome.stale, 1);
        let a = store.get("a").unwrap().unwrap();
        assert_eq!(a.observed_at_ms, EPOCH_MS + 20_000);
        assert_eq!(a.lat, ZOO.0);
    }

    #[tokio::test]
    async fn test_in_batch_duplicates_collapse_to_newest() {
        let store = Arc::new(MemoryStore::new());
        let (w, _ctx, _t) = worker(store.clone(), config());

        let report = w
            .process_batch(deliveries(&[
                observation("a", ALEX.0, ALEX.1, 10),
                observation("a", ZOO.0, ZOO.1, 30),
                observation("a", ALEX.0, ALEX.1, 20),
            ]))
            .await
            .unwrap();

        assert_eq!(report.duplicates, 2);
        assert_eq!(report.outcome.inserted, 1);
        assert_eq!(store.get("a").unwrap().unwrap().lat, ZOO.0);
    }

    #[test]
    fn test_in_batch_tie_keeps_first() {
        let (w, _ctx, _t) = worker(Arc::new(MemoryStore::new()), config());
        let prepared = w.prepare(
            &deliveries(&[
                observation("a", ALEX.0, ALEX.1, 10),
                observation("a", ZOO.0, ZOO.1, 10),
            ]),
            EPOCH_MS,
        );
        assert_eq!(prepared.candidates.len(), 1);
        assert_eq!(prepared.candidates[0].lat, ALEX.0);
    }

    #[tokio::test]
    async fn test_malformed_records_are_dropped_and_acked() {
        let store = Arc::new(MemoryStore::new());
        let (w, _ctx, transport) = worker(store.clone(), config());

        let mut batch = deliveries(&[observation("a", ALEX.0, ALEX.1, 10)]);
        batch.push(Delivery::new(DeliveryTag(7), b"{not json".to_vec(), EPOCH_MS));
        batch.push(Delivery::new(
            DeliveryTag(8),
            br#"{"vehicleId":"x","lat":95.0,"lon":13.4,"observedAt":1704067200000}"#.to_vec(),
            EPOCH_MS,
        ));

        let report = w.process_batch(batch).await.unwrap();

        assert_eq!(report.rejected, 2);
        assert_eq!(report.outcome.inserted, 1);
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(transport.acked().len(), 3);

        let snap = w.metrics().snapshot();
        assert_eq!(snap.rejected_malformed, 1);
        assert_eq!(snap.rejected_invalid_coordinates, 1);
    }

    #[tokio::test]
    async fn test_all_rejected_batch_is_acked_without_commit() {
        let store = Arc::new(FailingStore::permanent());
        let (w, _ctx, transport) = worker(store.clone(), config());

        let batch = vec![Delivery::new(DeliveryTag(1), b"garbage".to_vec(), EPOCH_MS)];
        let report = w.process_batch(batch).await.unwrap();

        assert_eq!(report.attempts, 0);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(transport.acked().len(), 1);
    }

    #[tokio::test]
    async fn test_future_timestamp_rejected() {
        let (w, _ctx, _t) = worker(Arc::new(MemoryStore::new()), config());
        let report = w
            .process_batch(deliveries(&[observation("a", ALEX.0, ALEX.1, 3_600)]))
            .await
            .unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(w.metrics().snapshot().rejected_future_timestamp, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_then_committed() {
        let store = Arc::new(FailingStore::transient(2));
        let (w, ctx, transport) = worker(store.clone(), config());

        let report = w
            .process_batch(deliveries(&[observation("a", ALEX.0, ALEX.1, 0)]))
            .await
            .unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(report.outcome.inserted, 1);
        assert_eq!(transport.acked().len(), 1);
        // Backoff slept 10 ms then 20 ms on the virtual clock
        assert_eq!(ctx.now(), Duration::from_millis(30));
        assert_eq!(w.metrics().snapshot().commit_retries, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_without_ack() {
        let store = Arc::new(FailingStore::transient(10));
        let (w, _ctx, transport) = worker(store.clone(), config());

        let err = w
            .process_batch(deliveries(&[observation("a", ALEX.0, ALEX.1, 0)]))
            .await
            .unwrap_err();

        match err {
            WorkerError::BatchFailed { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert!(source.is_transient());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(transport.acked().is_empty());
        assert_eq!(w.metrics().snapshot().batches_failed, 1);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_fast() {
        let store = Arc::new(FailingStore::permanent());
        let (w, _ctx, transport) = worker(store.clone(), config());

        let err = w
            .process_batch(deliveries(&[observation("a", ALEX.0, ALEX.1, 0)]))
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::BatchFailed { attempts: 1, .. }));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
        assert!(transport.acked().is_empty());
    }

    #[tokio::test]
    async fn test_collect_batch_stops_at_batch_size() {
        let (w, _ctx, transport) = worker(Arc::new(MemoryStore::new()), config().with_batch_size(3));
        for i in 0..5 {
            transport.push(&observation(&format!("v{i}"), ALEX.0, ALEX.1, 0));
        }

        let batch = w.collect_batch().await;
        assert_eq!(batch.deliveries.len(), 3);
        assert!(!batch.closed);
        assert_eq!(transport.pending_len(), 2);

        let rest = w.collect_batch().await;
        assert_eq!(rest.deliveries.len(), 2);
        assert!(rest.closed);
    }

    #[tokio::test]
    async fn test_sweep_removes_rows_past_retention() {
        let store = Arc::new(MemoryStore::new());
        let (w, ctx, _t) = worker(store.clone(), config());
        ctx.set_secs(3_000);

        w.process_batch(deliveries(&[
            observation("old", ALEX.0, ALEX.1, 0),
            observation("new", ZOO.0, ZOO.1, 3_000),
        ]))
        .await
        .unwrap();

        ctx.set_secs(3_700);
        let report = w.sweep().await.unwrap();

        assert_eq!(report.removed, 1);
        assert_eq!(report.cutoff_ms, EPOCH_MS + 100_000);
        assert!(store.get("old").unwrap().is_none());
        assert!(store.get("new").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unbounded_retention_never_sweeps_live_rows() {
        let store = Arc::new(MemoryStore::new());
        for horizon in [Duration::from_secs(u64::MAX), Duration::MAX] {
            let (w, ctx, _t) = worker(store.clone(), config().with_retention_horizon(horizon));
            ctx.set_secs(10);
            w.process_batch(deliveries(&[
                observation("old", ALEX.0, ALEX.1, 0),
                observation("now", ZOO.0, ZOO.1, 10),
            ]))
            .await
            .unwrap();

            let report = w.sweep().await.unwrap();
            assert_eq!(report.removed, 0);
            assert!(report.cutoff_ms < EPOCH_MS);
            assert_eq!(store.len().unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn test_unbounded_future_skew_accepts_live_observations() {
        let mut unbounded = config();
        unbounded.max_future_skew = Duration::MAX;
        let store = Arc::new(MemoryStore::new());
        let (w, _ctx, _t) = worker(store.clone(), unbounded);

        let report = w
            .process_batch(deliveries(&[
                observation("a", ALEX.0, ALEX.1, 0),
                observation("b", ZOO.0, ZOO.1, 3_600),
            ]))
            .await
            .unwrap();
        assert_eq!(report.rejected, 0);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sweep_runs_on_interval() {
        let (mut w, ctx, _t) = worker(Arc::new(MemoryStore::new()), config());

        assert!(w.maybe_sweep().await.is_some());
        assert!(w.maybe_sweep().await.is_none());

        ctx.advance(Duration::from_secs(60));
        assert!(w.maybe_sweep().await.is_some());
        assert_eq!(w.metrics().snapshot().sweeps, 2);
    }

    #[tokio::test]
    async fn test_run_drains_until_transport_closes() {
        let store = Arc::new(MemoryStore::new());
        let (mut w, _ctx, transport) = worker(store.clone(), config().with_batch_size(2));
        for i in 0..5 {
            transport.push(&observation(&format!("v{i}"), ALEX.0, ALEX.1, 0));
        }
        transport.push_payload(b"junk".to_vec());

        let summary = w.run().await.unwrap();

        assert_eq!(summary.received, 6);
        assert_eq!(summary.inserted, 5);
        assert_eq!(summary.rejected_total(), 1);
        assert_eq!(store.len().unwrap(), 5);
        assert_eq!(transport.acked().len(), 6);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let ctx = ManualContext::shared();
        let transport = QueueTransport::shared();
        let result = AggregationWorker::new(
            ctx,
            transport,
            Arc::new(MemoryStore::new()),
            EngineConfig::default().with_resolutions(vec![16]),
        );
        assert!(result.is_err());
    }

    fn apply_in_chunks(
        w: &AggregationWorker<ManualContext, QueueTransport>,
        store: &MemoryStore,
        observations: &[Observation],
        chunk: usize,
    ) {
        for part in observations.chunks(chunk) {
            let prepared = w.prepare(&deliveries(part), EPOCH_MS + 86_400_000);
            store.upsert_if_newer(&prepared.candidates).unwrap();
        }
    }

    proptest! {
        #[test]
        fn prop_final_state_independent_of_order_and_batching(
            events in prop::collection::btree_set((0u8..5, 0i64..5_000), 1..40),
            chunk in 1usize..8,
        ) {
            let observations: Vec<Observation> = events
                .iter()
                .map(|(vehicle, secs)| {
                    let lat = 52.40 + (*secs % 97) as f64 * 0.002;
                    observation(&format!("v{vehicle}"), lat, 13.40, *secs)
                })
                .collect();
            let mut reversed = observations.clone();
            reversed.reverse();

            let (w, _ctx, _t) = worker(Arc::new(MemoryStore::new()), config());
            let forward = MemoryStore::new();
            let backward = MemoryStore::new();
            apply_in_chunks(&w, &forward, &observations, chunk);
            apply_in_chunks(&w, &backward, &reversed, chunk + 1);

            let forward_rows = forward.scan_since(i64::MIN).unwrap();
            let backward_rows = backward.scan_since(i64::MIN).unwrap();
            prop_assert_eq!(forward_rows.len(), backward_rows.len());
            for (f, b) in forward_rows.iter().zip(backward_rows.iter()) {
                prop_assert_eq!(&f.vehicle_id, &b.vehicle_id);
                prop_assert_eq!(f.observed_at_ms, b.observed_at_ms);
                prop_assert_eq!(&f.cells, &b.cells);
            }

            // Each vehicle holds its newest observation
            for row in &forward_rows {
                let newest = events
                    .iter()
                    .filter(|(v, _)| format!("v{v}") == row.vehicle_id)
                    .map(|(_, secs)| EPOCH_MS + secs * 1_000)
                    .max()
                    .unwrap();
                prop_assert_eq!(row.observed_at_ms, newest);
            }
        }
    }
}
