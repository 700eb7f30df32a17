//! Simulation context implementing MobilityContext for deterministic testing.

use async_trait::async_trait;
use scootermap_env::MobilityContext;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Virtual time 0 maps to 2024-01-01 00:00:00 UTC.
pub const SIM_EPOCH_SECS: u64 = 1_704_067_200;

/// Simulation context backed by a virtual clock.
///
/// - The clock only moves when a scenario advances it or something sleeps
/// - Simulated sleep advances virtual time and returns immediately
/// - Clones share the same clock
#[derive(Debug)]
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<AtomicU64>,

    epoch: SystemTime,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(AtomicU64::new(0)),
            epoch: UNIX_EPOCH + Duration::from_secs(SIM_EPOCH_SECS),
        }
    }

    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        self.virtual_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Sets the virtual time, measured from simulation start.
    pub fn set_time(&self, since_start: Duration) {
        self.virtual_time_ns
            .store(since_start.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Unix milliseconds of a point `since_start` into the simulation.
    pub fn unix_millis_at(&self, since_start: Duration) -> i64 {
        (SIM_EPOCH_SECS * 1_000) as i64 + since_start.as_millis() as i64
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl MobilityContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.virtual_time_ns.load(Ordering::SeqCst))
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // Sleeping is how virtual time passes
        self.advance_time(duration);
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::trace!(task = name, "sim spawn");
        tokio::spawn(future);
    }
}
