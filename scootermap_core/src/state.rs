//! Vehicle State Store - the single source of truth for occupancy.
//!
//! One row per vehicle holding its latest accepted position and the cell id
//! at every configured resolution. The Aggregation Worker is the only
//! writer; any number of query engines read concurrently.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

use crate::observation::Observation;
use crate::spatial::CellSet;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is temporarily unreachable; retry later
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Backend I/O failure
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Stored data could not be decoded
    #[error("Corrupt store state: {0}")]
    Corrupt(String),

    /// A previous writer panicked while holding the commit gate
    #[error("Store lock poisoned")]
    Poisoned,

    /// The store could not be opened (e.g. another writer holds it)
    #[error("Failed to open store: {0}")]
    Open(String),
}

impl StoreError {
    /// Transient errors are retried with backoff; the rest fail the batch immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Backend(_))
    }
}

/// Latest known position of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub vehicle_id: String,
    pub feed_id: String,
    pub lat: f64,
    pub lon: f64,
    /// Cell id per configured resolution, each encoded from (lat, lon)
    pub cells: CellSet,
    /// Provider timestamp (Unix milliseconds); never decreases for a vehicle
    pub observed_at_ms: i64,
    /// Worker clock when the row was built (Unix milliseconds)
    pub ingested_at_ms: i64,
    #[serde(default)]
    pub is_reserved: bool,
    #[serde(default)]
    pub is_disabled: bool,
    #[serde(default)]
    pub vehicle_type_id: Option<String>,
}

impl VehicleState {
    /// Builds a candidate row from a validated observation.
    pub fn from_observation(observation: Observation, cells: CellSet, ingested_at_ms: i64) -> Self {
        Self {
            vehicle_id: observation.vehicle_id,
            feed_id: observation.feed_id,
            lat: observation.lat,
            lon: observation.lon,
            cells,
            observed_at_ms: observation.observed_at,
            ingested_at_ms,
            is_reserved: observation.is_reserved,
            is_disabled: observation.is_disabled,
            vehicle_type_id: observation.vehicle_type_id,
        }
    }

    /// The upsert rule: a candidate wins only if strictly newer.
    #[inline]
    pub fn supersedes(&self, existing: &VehicleState) -> bool {
        self.observed_at_ms > existing.observed_at_ms
    }
}

/// Result of applying one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    /// First sightings
    pub inserted: usize,
    /// Rows replaced by a strictly newer observation
    pub updated: usize,
    /// Candidates dropped as duplicate or out-of-order
    pub stale: usize,
}

impl UpsertOutcome {
    pub fn applied(&self) -> usize {
        self.inserted + self.updated
    }

    /// Folds a single-candidate decision into the outcome.
    pub fn record(&mut self, existing: Option<&VehicleState>, candidate: &VehicleState) -> bool {
        match existing {
            None => {
                self.inserted += 1;
                true
            }
            Some(current) if candidate.supersedes(current) => {
                self.updated += 1;
                true
            }
            Some(_) => {
                self.stale += 1;
                false
            }
        }
    }
}

/// Summary of store contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub vehicle_count: usize,
    pub oldest_observed_ms: Option<i64>,
    pub newest_observed_ms: Option<i64>,
}

impl StoreStats {
    pub fn from_rows(rows: &[VehicleState]) -> Self {
        Self {
            vehicle_count: rows.len(),
            oldest_observed_ms: rows.iter().map(|r| r.observed_at_ms).min(),
            newest_observed_ms: rows.iter().map(|r| r.observed_at_ms).max(),
        }
    }
}

/// Storage contract shared by the worker (writer) and query engines (readers).
///
/// Implementations must be thread-safe and must make each
/// `upsert_if_newer` / `delete_older_than` call atomic: readers observe
/// either none or all of it.
pub trait VehicleStateStore: Send + Sync {
    /// Applies every candidate that is a first sighting or strictly newer than
    /// the stored row, as one atomic commit.
    ///
    /// Callers pass at most one candidate per vehicle.
    fn upsert_if_newer(&self, candidates: &[VehicleState]) -> Result<UpsertOutcome, StoreError>;

    /// Rows with `observed_at_ms >= since_ms`, read from one consistent snapshot.
    fn scan_since(&self, since_ms: i64) -> Result<Vec<VehicleState>, StoreError>;

    /// Deletes rows with `observed_at_ms < cutoff_ms`. Returns the number removed.
    fn delete_older_than(&self, cutoff_ms: i64) -> Result<usize, StoreError>;

    /// Current row for a vehicle.
    fn get(&self, vehicle_id: &str) -> Result<Option<VehicleState>, StoreError>;

    /// Number of stored vehicles.
    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let rows = self.scan_since(i64::MIN)?;
        Ok(StoreStats::from_rows(&rows))
    }
}

/// In-memory store (tests and simulation).
///
/// The whole map sits behind one `RwLock`, so a commit holding the write
/// lock is atomic with respect to every reader.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<BTreeMap<String, VehicleState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VehicleStateStore for MemoryStore {
    fn upsert_if_newer(&self, candidates: &[VehicleState]) -> Result<UpsertOutcome, StoreError> {
        let mut rows = self.rows.write().map_err(|_| StoreError::Poisoned)?;
        let mut outcome = UpsertOutcome::default();

        for candidate in candidates {
            if outcome.record(rows.get(&candidate.vehicle_id), candidate) {
                rows.insert(candidate.vehicle_id.clone(), candidate.clone());
            }
        }

        Ok(outcome)
    }

    fn scan_since(&self, since_ms: i64) -> Result<Vec<VehicleState>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned)?;
        Ok(rows
            .values()
            .filter(|row| row.observed_at_ms >= since_ms)
            .cloned()
            .collect())
    }

    fn delete_older_than(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let mut rows = self.rows.write().map_err(|_| StoreError::Poisoned)?;
        let before = rows.len();
        rows.retain(|_, row| row.observed_at_ms >= cutoff_ms);
        Ok(before - rows.len())
    }

    fn get(&self, vehicle_id: &str) -> Result<Option<VehicleState>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned)?;
        Ok(rows.get(vehicle_id).cloned())
    }

    fn len(&self) -> Result<usize, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned)?;
        Ok(rows.len())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::spatial::{ResolutionSet, SpatialIndex};

    /// Row for `vehicle_id` at `(lat, lon)` observed at `observed_at_ms`,
    /// indexed at resolutions 6..=9.
    pub fn row(vehicle_id: &str, lat: f64, lon: f64, observed_at_ms: i64) -> VehicleState {
        let index = SpatialIndex::new(ResolutionSet::new(&[6, 7, 8, 9]).unwrap());
        VehicleState {
            vehicle_id: vehicle_id.to_string(),
            feed_id: "berlin".to_string(),
            lat,
            lon,
            cells: index.cells_for(lat, lon).unwrap(),
            observed_at_ms,
            ingested_at_ms: observed_at_ms,
            is_reserved: false,
            is_disabled: false,
            vehicle_type_id: None,
        }
    }

    /// Shared contract checks run against every store implementation.
    pub fn check_store_contract(store: &dyn VehicleStateStore) {
        // First sighting
        let outcome = store.upsert_if_newer(&[row("a", 52.52, 13.40, 1_000)]).unwrap();
        assert_eq!(outcome, UpsertOutcome { inserted: 1, updated: 0, stale: 0 });

        // Newer wins, equal and older lose
        let outcome = store
            .upsert_if_newer(&[row("a", 52.53, 13.41, 2_000), row("b", 52.50, 13.30, 1_500)])
            .unwrap();
        assert_eq!(outcome, UpsertOutcome { inserted: 1, updated: 1, stale: 0 });

        let outcome = store
            .upsert_if_newer(&[row("a", 0.0, 0.0, 2_000), row("b", 0.0, 0.0, 500)])
            .unwrap();
        assert_eq!(outcome, UpsertOutcome { inserted: 0, updated: 0, stale: 2 });

        let a = store.get("a").unwrap().unwrap();
        assert_eq!(a.observed_at_ms, 2_000);
        assert_eq!(a.lat, 52.53);
        assert_eq!(store.len().unwrap(), 2);

        // Scans are inclusive of the lower bound
        let ids: Vec<String> = store
            .scan_since(1_500)
            .unwrap()
            .into_iter()
            .map(|r| r.vehicle_id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(store.scan_since(1_501).unwrap().len(), 1);

        // Retention removes strictly older rows only
        assert_eq!(store.delete_older_than(1_500).unwrap(), 0);
        assert_eq!(store.delete_older_than(1_501).unwrap(), 1);
        assert!(store.get("b").unwrap().is_none());

        let stats = store.stats().unwrap();
        assert_eq!(stats.vehicle_count, 1);
        assert_eq!(stats.oldest_observed_ms, Some(2_000));
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{check_store_contract, row};
    use super::*;

    #[test]
    fn test_memory_store_contract() {
        check_store_contract(&MemoryStore::new());
    }

    #[test]
    fn test_supersedes_is_strict() {
        let older = row("a", 52.52, 13.40, 1_000);
        let same = row("a", 52.60, 13.50, 1_000);
        let newer = row("a", 52.60, 13.50, 1_001);
        assert!(!same.supersedes(&older));
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
    }

    #[test]
    fn test_reapplying_batch_is_noop() {
        let store = MemoryStore::new();
        let batch = vec![row("a", 52.52, 13.40, 1_000), row("b", 52.50, 13.30, 1_000)];

        store.upsert_if_newer(&batch).unwrap();
        let first = store.scan_since(i64::MIN).unwrap();

        let outcome = store.upsert_if_newer(&batch).unwrap();
        assert_eq!(outcome.stale, 2);
        assert_eq!(store.scan_since(i64::MIN).unwrap(), first);
    }

    #[test]
    fn test_empty_store_stats() {
        let store = MemoryStore::new();
        assert!(store.is_empty().unwrap());
        assert_eq!(store.stats().unwrap(), StoreStats::default());
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("x".into()).is_transient());
        assert!(StoreError::Backend("x".into()).is_transient());
        assert!(!StoreError::Corrupt("x".into()).is_transient());
        assert!(!StoreError::Poisoned.is_transient());
    }
}
