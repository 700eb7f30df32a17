//! Core environment context trait for ScooterMap components.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the aggregation worker and
/// the query engine can run in both production (tokio) and simulation
/// (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and the OS clock
/// - **Simulation**: `SimContext` - a manually advanced virtual clock
///
/// # Determinism
///
/// Every time-dependent decision in the engine (batch flush deadlines,
/// sweep schedule, window bounds, future-skew validation) reads time through
/// this trait, never from `SystemTime::now()` directly.
#[async_trait]
pub trait MobilityContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for flush deadlines and the sweep schedule.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time.
    ///
    /// Observation timestamps and occupancy windows are compared against it.
    fn system_time(&self) -> SystemTime;

    /// Wall-clock time as Unix milliseconds.
    fn unix_millis(&self) -> i64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
