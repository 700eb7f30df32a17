//! Scenario runner - drives the worker and query engine through fault scenarios.
//!
//! Every scenario runs on a fresh harness: virtual clock, simulated
//! transport, in-memory store behind a fault-injecting wrapper, one
//! aggregation worker and one query engine. Assertions compare the store
//! and the occupancy counts against the fleet oracle's ground truth.

use crate::context::SimContext;
use crate::fleet::{malformed_payload, FleetOracle, BERLIN_HUBS};
use crate::flaky_store::FlakyStore;
use crate::scenarios::ScenarioId;
use crate::transport::{SimTransport, TransportStats};

use scootermap_core::{
    duration_millis, AggregationWorker, ConfigError, EngineConfig, MemoryStore, MetricsSnapshot, Observation,
    OccupancyQuery, OccupancyReport, QueryError, SpatialIndex, StoreError, VehicleState,
    VehicleStateStore, WindowedQueryEngine, WorkerError,
};
use scootermap_env::{MobilityContext, RedeliveryController, WorkerId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a scenario did not pass.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A scenario assertion failed
    #[error("{0}")]
    Check(String),
}

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<(), SimError> {
    if condition {
        Ok(())
    } else {
        Err(SimError::Check(message()))
    }
}

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub scenario: ScenarioId,
    pub seed: u64,
    pub passed: bool,
    pub failure_reason: Option<String>,
    /// Virtual time at the end of the run
    pub final_time_secs: f64,
    pub vehicles_tracked: usize,
    pub metrics: MetricsSnapshot,
    pub transport: TransportStats,
}

/// Engine settings for simulation.
///
/// The flush interval and retry backoff are short because every idle flush
/// and every backoff sleep advances the virtual clock.
pub fn sim_config() -> EngineConfig {
    EngineConfig::default()
        .with_batch_size(250)
        .with_batch_flush_interval(Duration::from_millis(100))
        .with_commit_retries(5, Duration::from_millis(10), Duration::from_millis(200))
}

/// Runs fault scenarios.
pub struct ScenarioRunner {
    seed: u64,
    fleet_size: usize,
    polls: usize,
    poll_interval: Duration,
    config: EngineConfig,
}

impl ScenarioRunner {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            fleet_size: 200,
            polls: 10,
            poll_interval: Duration::from_secs(30),
            config: sim_config(),
        }
    }

    pub fn with_fleet_size(mut self, fleet_size: usize) -> Self {
        self.fleet_size = fleet_size.max(1);
        self
    }

    pub fn with_polls(mut self, polls: usize) -> Self {
        self.polls = polls.max(1);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!(scenario = scenario.name(), seed = self.seed, "starting scenario");

        let mut harness = match Harness::new(self.seed, self.config.clone(), self.fleet_size) {
            Ok(harness) => harness,
            Err(e) => return self.setup_failure(scenario, e),
        };
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => return self.setup_failure(scenario, SimError::Runtime(e.to_string())),
        };

        let outcome = runtime.block_on(self.execute(scenario, &mut harness));
        if let Err(e) = &outcome {
            warn!(scenario = scenario.name(), seed = self.seed, error = %e, "scenario failed");
        }
        harness.result(scenario, self.seed, outcome)
    }

    fn setup_failure(&self, scenario: ScenarioId, error: SimError) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            failure_reason: Some(error.to_string()),
            final_time_secs: 0.0,
            vehicles_tracked: 0,
            metrics: MetricsSnapshot::default(),
            transport: TransportStats::default(),
        }
    }

    async fn execute(&self, scenario: ScenarioId, h: &mut Harness) -> Result<(), SimError> {
        match scenario {
            ScenarioId::SteadyState => self.run_steady_state(h).await,
            ScenarioId::Redelivery => self.run_redelivery(h).await,
            ScenarioId::OutOfOrder => self.run_out_of_order(h).await,
            ScenarioId::WindowExpiry => self.run_window_expiry(h).await,
            ScenarioId::RetentionSweep => self.run_retention_sweep(h).await,
            ScenarioId::MinCount => self.run_min_count(h).await,
            ScenarioId::StoreOutage => self.run_store_outage(h).await,
            ScenarioId::MalformedFlood => self.run_malformed_flood(h).await,
            ScenarioId::CommitExhaustion => self.run_commit_exhaustion(h).await,
        }
    }

    fn poll_time(&self, poll: usize) -> Duration {
        self.poll_interval * poll as u32
    }

    /// SIM-001: every poll lands, store and counts match ground truth.
    async fn run_steady_state(&self, h: &mut Harness) -> Result<(), SimError> {
        for poll in 0..self.polls {
            h.at(self.poll_time(poll));
            h.poll();
            h.drain().await?;
        }

        h.check_store_converged()?;
        h.check_counts_match_oracle()?;

        let m = h.metrics();
        let expected = (self.polls * self.fleet_size) as u64;
        ensure(m.received == expected, || format!("received {} of {}", m.received, expected))?;
        ensure(m.rejected_total() == 0, || format!("{} valid records rejected", m.rejected_total()))?;
        ensure(h.transport.in_flight_len() == 0, || "unacked deliveries remain".to_string())
    }

    /// SIM-002: duplicates and whole-batch redelivery leave state unchanged.
    async fn run_redelivery(&self, h: &mut Harness) -> Result<(), SimError> {
        h.transport.set_duplicate_rate(0.3);
        for poll in 0..self.polls {
            h.at(self.poll_time(poll));
            h.poll();
            h.drain().await?;
        }
        h.check_store_converged()?;

        let now_ms = h.now_ms();
        let rows_before = h.store.scan_since(i64::MIN)?;
        let counts_before = h.counts_all(now_ms, h.config.occupancy_window)?;

        // The exact same batch, delivered twice more
        h.transport.set_duplicate_rate(0.0);
        let last: Vec<Observation> = h.fleet.last_reports().values().cloned().collect();
        for _ in 0..2 {
            h.publish(&last);
            h.drain().await?;
        }

        ensure(h.store.scan_since(i64::MIN)? == rows_before, || {
            "redelivered batch changed stored rows".to_string()
        })?;
        ensure(h.counts_all(now_ms, h.config.occupancy_window)? == counts_before, || {
            "redelivered batch changed counts".to_string()
        })?;

        let m = h.metrics();
        let injected = h.transport.stats().duplicates_injected;
        let absorbed = m.stale + m.duplicates_in_batch;
        let required = injected + 2 * self.fleet_size as u64;
        ensure(absorbed >= required, || {
            format!("only {} of {} duplicates absorbed", absorbed, required)
        })
    }

    /// SIM-003: the newest observation wins regardless of arrival order.
    async fn run_out_of_order(&self, h: &mut Harness) -> Result<(), SimError> {
        h.fleet.set_relocation_probability(1.0);
        h.transport.set_reorder(true);

        // Across batches: newer committed first, older arrives later
        h.at(Duration::from_secs(60));
        let newer = h.fleet.poll(h.now_ms());
        h.publish(&newer);
        h.drain().await?;
        h.publish(&shifted(&newer, -60_000));
        h.drain().await?;
        h.check_store_converged()?;

        // Within one publish: older first, reversed on the wire
        h.at(Duration::from_secs(120));
        let newest = h.fleet.poll(h.now_ms());
        let mut mixed = shifted(&newest, -30_000);
        mixed.extend(newest.iter().cloned());
        h.publish(&mixed);
        h.drain().await?;

        h.check_store_converged()?;
        h.check_counts_match_oracle()?;

        let m = h.metrics();
        let absorbed = m.stale + m.duplicates_in_batch;
        let required = 2 * self.fleet_size as u64;
        ensure(absorbed >= required, || {
            format!("only {} of {} older observations discarded", absorbed, required)
        })
    }

    /// SIM-004: a vehicle reporting three times counts once, and drops out
    /// of the window while staying in the store.
    async fn run_window_expiry(&self, h: &mut Harness) -> Result<(), SimError> {
        let (alex_lat, alex_lon) = BERLIN_HUBS[0];
        let (zoo_lat, zoo_lon) = BERLIN_HUBS[1];
        let resolution = h.config.default_resolution;
        let window = Duration::from_secs(300);

        h.at(Duration::ZERO);
        let start = h.now_ms();
        h.publish(&[
            observation("A", alex_lat, alex_lon, start),
            observation("B", zoo_lat, zoo_lon, start),
        ]);
        h.drain().await?;
        for t in [60, 120] {
            h.at(Duration::from_secs(t));
            h.publish(&[observation("A", alex_lat, alex_lon, h.now_ms())]);
            h.drain().await?;
        }

        let c1 = h.cell_of("A", resolution)?;
        let c2 = h.cell_of("B", resolution)?;

        let at_130 = h.query(resolution, window, 1, h.ctx.unix_millis_at(Duration::from_secs(130)))?;
        ensure(at_130.count_for(c1) == 1, || {
            format!("A counted {} times in its cell", at_130.count_for(c1))
        })?;

        let at_400 = h.query(resolution, window, 1, h.ctx.unix_millis_at(Duration::from_secs(400)))?;
        ensure(at_400.count_for(c2) == 0, || "expired vehicle B still counted".to_string())?;
        ensure(at_400.total_vehicles == 1, || {
            format!("expected only A in window, got {}", at_400.total_vehicles)
        })?;
        ensure(h.store.get("B")?.is_some(), || "B deleted before retention horizon".to_string())
    }

    /// SIM-005: the sweep removes rows past retention and nothing else.
    async fn run_retention_sweep(&self, h: &mut Harness) -> Result<(), SimError> {
        h.at(Duration::ZERO);
        h.poll();
        h.drain().await?;

        h.at(Duration::from_secs(3_000));
        let now = h.now_ms();
        let refreshed: Vec<Observation> = (0..self.fleet_size)
            .step_by(2)
            .map(|i| h.fleet.report(i, now))
            .collect();
        h.publish(&refreshed);
        h.drain().await?;

        h.at(Duration::from_secs(3_700));
        let now_ms = h.now_ms();
        let in_horizon = Duration::from_secs(1_800);
        let before = h.counts_all(now_ms, in_horizon)?;

        let report = h.worker.sweep().await?;
        let expected_removed = self.fleet_size - refreshed.len();
        ensure(report.removed == expected_removed, || {
            format!("swept {} rows, expected {}", report.removed, expected_removed)
        })?;

        let rows = h.store.scan_since(i64::MIN)?;
        ensure(rows.iter().all(|r| r.observed_at_ms >= report.cutoff_ms), || {
            "row older than retention horizon survived".to_string()
        })?;
        ensure(rows.len() == refreshed.len(), || {
            format!("{} rows left, expected {}", rows.len(), refreshed.len())
        })?;
        ensure(h.counts_all(now_ms, in_horizon)? == before, || {
            "sweep changed in-horizon counts".to_string()
        })
    }

    /// SIM-006: minCount is an inclusive lower bound.
    async fn run_min_count(&self, h: &mut Harness) -> Result<(), SimError> {
        let (alex_lat, alex_lon) = BERLIN_HUBS[0];
        let (zoo_lat, zoo_lon) = BERLIN_HUBS[1];
        let resolution = h.config.default_resolution;

        h.at(Duration::from_secs(10));
        let now = h.now_ms();
        let mut batch: Vec<Observation> = (0..4)
            .map(|i| observation(&format!("alex-{i}"), alex_lat, alex_lon, now))
            .collect();
        batch.extend((0..5).map(|i| observation(&format!("zoo-{i}"), zoo_lat, zoo_lon, now)));
        h.publish(&batch);
        h.drain().await?;

        let alex = h.cell_of("alex-0", resolution)?;
        let zoo = h.cell_of("zoo-0", resolution)?;
        let window = h.config.occupancy_window;

        let at_five = h.query(resolution, window, 5, now)?;
        ensure(at_five.count_for(alex) == 0, || "cell with 4 vehicles passed minCount=5".to_string())?;
        ensure(at_five.count_for(zoo) == 5, || "cell with 5 vehicles dropped at minCount=5".to_string())?;

        let at_four = h.query(resolution, window, 4, now)?;
        ensure(at_four.cell_count == 2, || {
            format!("expected both cells at minCount=4, got {}", at_four.cell_count)
        })
    }

    /// SIM-007: a failed batch stays unacked, readers keep the last commit,
    /// redelivery after recovery converges.
    async fn run_store_outage(&self, h: &mut Harness) -> Result<(), SimError> {
        h.at(Duration::ZERO);
        h.poll();
        h.drain().await?;

        let query_ms = h.now_ms();
        let committed_rows = h.store.scan_since(i64::MIN)?;
        let committed_counts = h.counts_all(query_ms, h.config.occupancy_window)?;

        h.at(Duration::from_secs(30));
        h.store.set_outage(true);
        h.poll();
        expect_batch_failure(h.worker.step().await, h.config.max_commit_attempts)?;

        ensure(h.transport.in_flight_len() > 0, || "failed batch was acked".to_string())?;
        ensure(h.store.scan_since(i64::MIN)? == committed_rows, || {
            "failed batch leaked into the store".to_string()
        })?;
        ensure(h.counts_all(query_ms, h.config.occupancy_window)? == committed_counts, || {
            "queries during outage did not serve the last commit".to_string()
        })?;

        h.store.set_outage(false);
        let redelivered = h.transport.redeliver_unacked();
        debug!(redelivered, "store recovered");
        h.drain().await?;

        h.check_store_converged()?;
        h.check_counts_match_oracle()?;
        let m = h.metrics();
        ensure(m.batches_failed == 1, || format!("{} failed batches", m.batches_failed))?;
        ensure(m.redelivered >= redelivered as u64, || "redeliveries not counted".to_string())?;
        ensure(h.transport.in_flight_len() == 0, || "unacked deliveries remain".to_string())
    }

    /// SIM-008: invalid records are counted and dropped, valid ones committed.
    async fn run_malformed_flood(&self, h: &mut Harness) -> Result<(), SimError> {
        let mut malformed = 0u64;
        for poll in 0..self.polls {
            h.at(self.poll_time(poll));
            let now = h.now_ms();
            let observations = h.fleet.poll(now);
            let mut payloads: Vec<Vec<u8>> = observations.iter().map(Observation::to_payload).collect();
            for i in 0..observations.len() / 2 {
                payloads.push(malformed_payload(i, now));
                malformed += 1;
            }
            h.transport.publish_all(payloads, now);
            h.drain().await?;
        }

        h.check_store_converged()?;
        h.check_counts_match_oracle()?;

        let m = h.metrics();
        ensure(m.rejected_total() == malformed, || {
            format!("rejected {} of {} malformed records", m.rejected_total(), malformed)
        })?;
        ensure(h.transport.in_flight_len() == 0, || "rejected records were not acked".to_string())
    }

    /// SIM-009: the last allowed attempt still commits; one more failure
    /// surfaces the batch as failed.
    async fn run_commit_exhaustion(&self, h: &mut Harness) -> Result<(), SimError> {
        let max_attempts = h.config.max_commit_attempts;

        h.at(Duration::ZERO);
        h.store.fail_next(u64::from(max_attempts - 1));
        h.poll();
        h.drain().await?;
        h.check_store_converged()?;

        let retries = h.metrics().commit_retries;
        ensure(retries == u64::from(max_attempts - 1), || {
            format!("{} retries, expected {}", retries, max_attempts - 1)
        })?;

        h.at(Duration::from_secs(30));
        h.store.fail_next(u64::from(max_attempts));
        h.poll();
        expect_batch_failure(h.worker.step().await, max_attempts)?;
        ensure(h.transport.in_flight_len() > 0, || "failed batch was acked".to_string())?;

        // Supervisor restarts consumption; the broker redelivers
        h.transport.redeliver_unacked();
        h.drain().await?;
        h.check_store_converged()
    }
}

fn expect_batch_failure(step: Result<bool, WorkerError>, max_attempts: u32) -> Result<(), SimError> {
    match step {
        Err(WorkerError::BatchFailed { attempts, .. }) => ensure(attempts == max_attempts, || {
            format!("batch failed after {} attempts, expected {}", attempts, max_attempts)
        }),
        Err(other) => Err(other.into()),
        Ok(_) => Err(SimError::Check("batch committed while the store was down".to_string())),
    }
}

fn observation(vehicle_id: &str, lat: f64, lon: f64, observed_at: i64) -> Observation {
    Observation {
        vehicle_id: vehicle_id.to_string(),
        feed_id: "sim".to_string(),
        lat,
        lon,
        observed_at,
        is_reserved: false,
        is_disabled: false,
        vehicle_type_id: None,
    }
}

/// Copies of `observations` moved in time by `delta_ms` and ~300 m north.
fn shifted(observations: &[Observation], delta_ms: i64) -> Vec<Observation> {
    observations
        .iter()
        .map(|o| Observation {
            observed_at: o.observed_at + delta_ms,
            lat: o.lat + 0.003,
            ..o.clone()
        })
        .collect()
}

/// Everything one scenario run owns.
struct Harness {
    ctx: Arc<SimContext>,
    transport: Arc<SimTransport>,
    store: Arc<FlakyStore>,
    worker: AggregationWorker<SimContext, SimTransport>,
    engine: WindowedQueryEngine<SimContext>,
    fleet: FleetOracle,
    spatial: SpatialIndex,
    config: EngineConfig,
}

impl Harness {
    fn new(seed: u64, config: EngineConfig, fleet_size: usize) -> Result<Self, SimError> {
        // Separate streams so changing fault injection never moves the fleet
        let fleet_seed = seed.wrapping_mul(0x9e3779b97f4a7c15);
        let transport_seed = seed ^ 0x5bd1e995;

        let ctx = SimContext::shared(seed);
        let transport = Arc::new(SimTransport::new(transport_seed));
        let store = Arc::new(FlakyStore::new(Arc::new(MemoryStore::new())));
        let shared_store: Arc<dyn VehicleStateStore> = store.clone();

        let worker = AggregationWorker::new(ctx.clone(), transport.clone(), shared_store.clone(), config.clone())?
            .with_worker_id(WorkerId::from_seed(seed));
        let engine = WindowedQueryEngine::new(ctx.clone(), shared_store, &config)?;
        let spatial = SpatialIndex::new(config.validate()?);

        Ok(Self {
            ctx,
            transport,
            store,
            worker,
            engine,
            fleet: FleetOracle::new(fleet_seed, fleet_size),
            spatial,
            config,
        })
    }

    fn at(&self, since_start: Duration) {
        self.ctx.set_time(since_start);
    }

    fn now_ms(&self) -> i64 {
        self.ctx.unix_millis()
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.worker.metrics().snapshot()
    }

    fn publish(&self, observations: &[Observation]) {
        let payloads = observations.iter().map(Observation::to_payload).collect();
        self.transport.publish_all(payloads, self.now_ms());
    }

    /// Publishes one fleet poll at the current virtual time.
    fn poll(&mut self) {
        let observations = self.fleet.poll(self.now_ms());
        self.publish(&observations);
    }

    /// Steps the worker until the transport has nothing pending.
    async fn drain(&mut self) -> Result<(), SimError> {
        while self.transport.pending_len() > 0 {
            self.worker.step().await?;
        }
        Ok(())
    }

    fn query(
        &self,
        resolution: u8,
        window: Duration,
        min_count: u32,
        now_ms: i64,
    ) -> Result<OccupancyReport, SimError> {
        let query = OccupancyQuery::at_resolution(resolution)
            .with_window(window)
            .with_min_count(min_count);
        Ok(self.engine.occupancy_at(&query, now_ms)?)
    }

    fn cell_of(&self, vehicle_id: &str, resolution: u8) -> Result<h3o::CellIndex, SimError> {
        self.store
            .get(vehicle_id)?
            .and_then(|row: VehicleState| row.cells.get(resolution))
            .ok_or_else(|| SimError::Check(format!("no cell for {} at resolution {}", vehicle_id, resolution)))
    }

    /// Per-resolution `{cell -> count}` maps at `now_ms`.
    fn counts_all(
        &self,
        now_ms: i64,
        window: Duration,
    ) -> Result<BTreeMap<u8, BTreeMap<String, usize>>, SimError> {
        let mut all = BTreeMap::new();
        for resolution in self.spatial.resolutions().as_u8() {
            let report = self.query(resolution, window, 1, now_ms)?;
            all.insert(resolution, counts(&report));
        }
        Ok(all)
    }

    /// Every vehicle's stored row is its newest report.
    fn check_store_converged(&self) -> Result<(), SimError> {
        let expected = self.fleet.last_reports();
        let stored = self.store.len()?;
        ensure(stored == expected.len(), || {
            format!("store holds {} vehicles, oracle {}", stored, expected.len())
        })?;

        for (vehicle_id, report) in expected {
            let row = self
                .store
                .get(vehicle_id)?
                .ok_or_else(|| SimError::Check(format!("{} missing from store", vehicle_id)))?;
            ensure(row.observed_at_ms == report.observed_at, || {
                format!(
                    "{} stored at {} but newest report is {}",
                    vehicle_id, row.observed_at_ms, report.observed_at
                )
            })?;
            ensure(
                (row.lat - report.lat).abs() < 1e-9 && (row.lon - report.lon).abs() < 1e-9,
                || format!("{} stored at a superseded position", vehicle_id),
            )?;
        }
        Ok(())
    }

    /// Occupancy at every configured resolution equals the oracle's count.
    fn check_counts_match_oracle(&self) -> Result<(), SimError> {
        let now_ms = self.now_ms();
        let window = self.config.occupancy_window;
        let since = now_ms.saturating_sub(duration_millis(window));

        for resolution in self.spatial.resolutions().as_u8() {
            let report = self.query(resolution, window, 1, now_ms)?;
            let expected = self.fleet.expected_counts(&self.spatial, resolution, since);
            let actual = counts(&report);
            ensure(actual == expected, || {
                format!(
                    "resolution {}: {} cells / {} vehicles, oracle {} cells / {} vehicles",
                    resolution,
                    actual.len(),
                    actual.values().sum::<usize>(),
                    expected.len(),
                    expected.values().sum::<usize>()
                )
            })?;
        }
        Ok(())
    }

    fn result(&self, scenario: ScenarioId, seed: u64, outcome: Result<(), SimError>) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed,
            passed: outcome.is_ok(),
            failure_reason: outcome.err().map(|e| e.to_string()),
            final_time_secs: self.ctx.now().as_secs_f64(),
            vehicles_tracked: self.store.len().unwrap_or(0),
            metrics: self.metrics(),
            transport: self.transport.stats(),
        }
    }
}

fn counts(report: &OccupancyReport) -> BTreeMap<String, usize> {
    report
        .cells
        .iter()
        .map(|cell| (cell.cell_id.to_string(), cell.count))
        .collect()
}
