//! Windowed Query Engine - per-cell vehicle counts over a recency window.
//!
//! Queries never mutate state and run concurrently with ingestion. Each
//! query works on one `scan_since` snapshot, so it never sees a half-applied
//! batch.
//!
//! A vehicle is counted once, in the cell of its latest accepted position,
//! if that position was observed inside the window.

use geo::Polygon;
use h3o::CellIndex;
use scootermap_env::MobilityContext;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{duration_millis, ConfigError, EngineConfig};
use crate::spatial::{GeoPoint, GeometryCache, ResolutionSet};
use crate::state::{StoreError, StoreStats, VehicleState, VehicleStateStore};

/// Query errors
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Unsupported resolution {requested}; configured resolutions are {supported:?}")]
    UnsupportedResolution { requested: u8, supported: Vec<u8> },

    #[error("Query window must be positive")]
    InvalidWindow,

    /// The store scan did not finish within the query timeout. Retryable.
    #[error("Store scan timed out after {0} ms")]
    Timeout(u64),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Query task failed: {0}")]
    Task(String),
}

impl QueryError {
    /// Whether the caller may retry the same query.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueryError::Timeout(_) => true,
            QueryError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Occupancy query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OccupancyQuery {
    /// Falls back to the configured default resolution
    pub resolution: Option<u8>,
    /// Inclusive lower bound on the per-cell count
    pub min_count: u32,
    /// Falls back to the configured occupancy window
    pub window: Option<Duration>,
}

impl Default for OccupancyQuery {
    fn default() -> Self {
        Self {
            resolution: None,
            min_count: 1,
            window: None,
        }
    }
}

impl OccupancyQuery {
    pub fn at_resolution(resolution: u8) -> Self {
        Self {
            resolution: Some(resolution),
            ..Self::default()
        }
    }

    pub fn with_min_count(mut self, min_count: u32) -> Self {
        self.min_count = min_count;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }
}

/// Distinct-vehicle count for one cell, before geometry is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellTally {
    pub cell: CellIndex,
    pub count: usize,
    /// Newest `observed_at_ms` among the vehicles in the cell
    pub last_updated_ms: i64,
}

/// One occupied cell in a report.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyCell {
    pub cell_id: CellIndex,
    pub count: usize,
    pub center: GeoPoint,
    pub boundary: Polygon<f64>,
    pub last_updated_ms: i64,
}

/// Result of one occupancy query; cells are ordered by cell id.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyReport {
    pub resolution: u8,
    pub cells: Vec<OccupancyCell>,
    pub total_vehicles: usize,
    pub cell_count: usize,
    pub min_count: u32,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
}

impl OccupancyReport {
    /// Count for `cell`, 0 if absent from the report.
    pub fn count_for(&self, cell: CellIndex) -> usize {
        self.cells
            .binary_search_by(|c| c.cell_id.cmp(&cell))
            .map(|i| self.cells[i].count)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Store statistics plus occupied cells per configured resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyStats {
    pub store: StoreStats,
    /// Vehicles inside the default occupancy window
    pub active_vehicles: usize,
    /// Distinct occupied cells per resolution, inside the default window
    pub cells_by_resolution: BTreeMap<u8, usize>,
    pub window_start_ms: i64,
}

/// Groups rows by their cell at `resolution` and counts distinct vehicles.
///
/// Rows without a cell at that resolution are skipped. Cells with fewer than
/// `min_count` vehicles are dropped.
pub fn aggregate(rows: &[VehicleState], resolution: u8, min_count: u32) -> Vec<CellTally> {
    let mut groups: BTreeMap<CellIndex, (BTreeSet<&str>, i64)> = BTreeMap::new();

    for row in rows {
        let Some(cell) = row.cells.get(resolution) else {
            continue;
        };
        let (members, newest) = groups.entry(cell).or_insert_with(|| (BTreeSet::new(), i64::MIN));
        members.insert(row.vehicle_id.as_str());
        *newest = (*newest).max(row.observed_at_ms);
    }

    groups
        .into_iter()
        .filter(|(_, (members, _))| members.len() >= min_count as usize)
        .map(|(cell, (members, newest))| CellTally {
            cell,
            count: members.len(),
            last_updated_ms: newest,
        })
        .collect()
}

/// Read-only query side over a [`VehicleStateStore`].
pub struct WindowedQueryEngine<Ctx: MobilityContext> {
    context: Arc<Ctx>,
    store: Arc<dyn VehicleStateStore>,
    resolutions: ResolutionSet,
    default_resolution: u8,
    default_window: Duration,
    timeout: Duration,
    geometry: Arc<GeometryCache>,
}

impl<Ctx: MobilityContext> WindowedQueryEngine<Ctx> {
    pub fn new(
        context: Arc<Ctx>,
        store: Arc<dyn VehicleStateStore>,
        config: &EngineConfig,
    ) -> Result<Self, ConfigError> {
        let resolutions = config.validate()?;
        Ok(Self {
            context,
            store,
            resolutions,
            default_resolution: config.default_resolution,
            default_window: config.occupancy_window,
            timeout: config.query_timeout,
            geometry: Arc::new(GeometryCache::new()),
        })
    }

    pub fn resolutions(&self) -> &ResolutionSet {
        &self.resolutions
    }

    fn plan(&self, query: &OccupancyQuery) -> Result<(u8, Duration), QueryError> {
        let resolution = query.resolution.unwrap_or(self.default_resolution);
        if !self.resolutions.contains(resolution) {
            return Err(QueryError::UnsupportedResolution {
                requested: resolution,
                supported: self.resolutions.as_u8(),
            });
        }

        let window = query.window.unwrap_or(self.default_window);
        if window.is_zero() {
            return Err(QueryError::InvalidWindow);
        }
        Ok((resolution, window))
    }

    /// Answers `query` as of `now_ms`, scanning the store on the calling thread.
    pub fn occupancy_at(&self, query: &OccupancyQuery, now_ms: i64) -> Result<OccupancyReport, QueryError> {
        let (resolution, window) = self.plan(query)?;
        let window_start_ms = window_start(now_ms, window);
        let rows = self.store.scan_since(window_start_ms)?;
        Ok(self.build_report(&rows, resolution, query.min_count, window_start_ms, now_ms))
    }

    /// Answers `query` as of the context clock, bounding the store scan
    /// with the configured query timeout.
    pub async fn occupancy(&self, query: &OccupancyQuery) -> Result<OccupancyReport, QueryError> {
        let (resolution, window) = self.plan(query)?;
        let now_ms = self.context.unix_millis();
        let window_start_ms = window_start(now_ms, window);

        let store = Arc::clone(&self.store);
        let scan = tokio::task::spawn_blocking(move || store.scan_since(window_start_ms));
        let rows = match tokio::time::timeout(self.timeout, scan).await {
            Ok(joined) => joined.map_err(|e| QueryError::Task(e.to_string()))??,
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                warn!(resolution, timeout_ms, "occupancy scan timed out");
                return Err(QueryError::Timeout(timeout_ms));
            }
        };

        Ok(self.build_report(&rows, resolution, query.min_count, window_start_ms, now_ms))
    }

    fn build_report(
        &self,
        rows: &[VehicleState],
        resolution: u8,
        min_count: u32,
        window_start_ms: i64,
        now_ms: i64,
    ) -> OccupancyReport {
        let cells: Vec<OccupancyCell> = aggregate(rows, resolution, min_count)
            .into_iter()
            .map(|tally| {
                let geometry = self.geometry.get(tally.cell);
                OccupancyCell {
                    cell_id: tally.cell,
                    count: tally.count,
                    center: geometry.center,
                    boundary: geometry.boundary,
                    last_updated_ms: tally.last_updated_ms,
                }
            })
            .collect();

        let total_vehicles = cells.iter().map(|c| c.count).sum();
        debug!(resolution, cells = cells.len(), total_vehicles, "occupancy query");

        OccupancyReport {
            resolution,
            cell_count: cells.len(),
            cells,
            total_vehicles,
            min_count,
            window_start_ms,
            window_end_ms: now_ms,
        }
    }

    /// Store statistics as of `now_ms`, with occupied cells counted inside
    /// the default window at every configured resolution.
    pub fn stats_at(&self, now_ms: i64) -> Result<OccupancyStats, QueryError> {
        let all = self.store.scan_since(i64::MIN)?;
        Ok(self.build_stats(all, now_ms))
    }

    /// [`stats_at`](Self::stats_at) as of the context clock, with the full
    /// scan bounded by the query timeout.
    pub async fn stats(&self) -> Result<OccupancyStats, QueryError> {
        let now_ms = self.context.unix_millis();
        let store = Arc::clone(&self.store);
        let scan = tokio::task::spawn_blocking(move || store.scan_since(i64::MIN));
        let all = match tokio::time::timeout(self.timeout, scan).await {
            Ok(joined) => joined.map_err(|e| QueryError::Task(e.to_string()))??,
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                warn!(timeout_ms, "stats scan timed out");
                return Err(QueryError::Timeout(timeout_ms));
            }
        };
        Ok(self.build_stats(all, now_ms))
    }

    fn build_stats(&self, all: Vec<VehicleState>, now_ms: i64) -> OccupancyStats {
        let window_start_ms = window_start(now_ms, self.default_window);
        let active: Vec<VehicleState> = all
            .iter()
            .filter(|row| row.observed_at_ms >= window_start_ms)
            .cloned()
            .collect();

        let cells_by_resolution = self
            .resolutions
            .as_u8()
            .into_iter()
            .map(|r| (r, aggregate(&active, r, 1).len()))
            .collect();

        OccupancyStats {
            store: StoreStats::from_rows(&all),
            active_vehicles: active.len(),
            cells_by_resolution,
            window_start_ms,
        }
    }
}

fn window_start(now_ms: i64, window: Duration) -> i64 {
    now_ms.saturating_sub(duration_millis(window))
}
