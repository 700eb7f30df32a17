//! ScooterMap Core - windowed multi-resolution vehicle occupancy over H3
//!
//! This library turns an at-least-once stream of vehicle positions into
//! per-cell occupancy counts:
//! 1. **Duplicate snapshots**: a last-writer-wins upsert keyed by vehicle id makes redelivery harmless
//! 2. **Zoom levels**: each position is encoded once per configured H3 resolution
//! 3. **Presence**: a vehicle counts only while its latest report is inside the occupancy window

pub mod config;
pub mod metrics;
pub mod observation;
pub mod query;
pub mod response;
pub mod sled_store;
pub mod spatial;
pub mod state;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use config::{duration_millis, ConfigError, EngineConfig};
pub use metrics::{MetricsSnapshot, WorkerMetrics};
pub use observation::{Observation, RejectReason};
pub use query::{OccupancyCell, OccupancyQuery, OccupancyReport, OccupancyStats, QueryError, WindowedQueryEngine};
pub use response::{feature_collection, heatmap_json, FeatureCollection, HeatmapResponse};
pub use sled_store::SledStore;
pub use spatial::{CellSet, GeoPoint, GeometryCache, ResolutionSet, SpatialError, SpatialIndex};
pub use state::{MemoryStore, StoreError, StoreStats, UpsertOutcome, VehicleState, VehicleStateStore};
pub use worker::{AggregationWorker, BatchId, BatchReport, SweepReport, WorkerError};
