//! ScooterMap Deterministic Simulation Testing (DST) Harness
//!
//! Runs the aggregation worker and the windowed query engine against a
//! simulated broker, a seeded fleet and a store that fails on demand, all
//! on a virtual clock.
//!
//! # Core Principle: Controlled Non-Determinism
//!
//! - **Time**: Virtual clock; worker sleeps and retry backoff advance it
//! - **Delivery**: At-least-once queue with duplicates, reordering and
//!   redelivery of unacked messages
//! - **Randomness**: All entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  payloads  ┌──────────────┐  recv/ack  ┌──────────────────┐
//! │ FleetOracle  │───────────►│ SimTransport │◄──────────►│ AggregationWorker│
//! │ (truth)      │            └──────────────┘            └────────┬─────────┘
//! └──────┬───────┘                                                 │ upsert
//!        │ expected counts   ┌───────────────────┐        ┌────────▼─────────┐
//!        └──────────────────►│ WindowedQueryEngine│◄──────│ FlakyStore       │
//!                            └───────────────────┘  scan  └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use scootermap_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::StoreOutage);
//! assert!(result.passed);
//! ```

mod context;
mod flaky_store;
mod fleet;
mod runner;
pub mod scenarios;
mod transport;

pub use context::SimContext;
pub use flaky_store::FlakyStore;
pub use fleet::{malformed_payload, FleetOracle, SimVehicle, BERLIN_HUBS};
pub use runner::{sim_config, ScenarioResult, ScenarioRunner, SimError};
pub use transport::{SimTransport, TransportStats};
