//! Sled-based durable Vehicle State Store.
//!
//! Layout (two trees in one database):
//! - `vehicles`: vehicle id -> JSON-encoded [`VehicleState`]
//! - `observed`: order-preserving `observed_at_ms` (8 bytes) ++ vehicle id -> empty
//!
//! The time index turns `scan_since` and the retention sweep into range
//! scans. Both trees change inside one sled transaction per commit; the
//! commit gate keeps readers from iterating while a commit is in progress.

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Transactional, Tree};
use std::path::Path;
use std::sync::RwLock;
use tracing::debug;

use crate::state::{StoreError, UpsertOutcome, VehicleState, VehicleStateStore};

const VEHICLES_TREE: &str = "vehicles";
const OBSERVED_TREE: &str = "observed";

/// Durable store backed by an embedded sled database.
///
/// sled holds an exclusive file lock on the database directory, so opening
/// the same path from a second writer process fails with `StoreError::Open`.
pub struct SledStore {
    db: sled::Db,
    vehicles: Tree,
    observed: Tree,
    /// Writers take it exclusively, scans take it shared
    gate: RwLock<()>,
}

impl SledStore {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)
            .map_err(|e| StoreError::Open(format!("Failed to open sled DB: {}", e)))?;
        Self::from_db(db)
    }

    /// Create a temporary store (for testing)
    pub fn open_temp() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::Open(format!("Failed to open temp DB: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let vehicles = db.open_tree(VEHICLES_TREE).map_err(backend)?;
        let observed = db.open_tree(OBSERVED_TREE).map_err(backend)?;
        Ok(Self {
            db,
            vehicles,
            observed,
            gate: RwLock::new(()),
        })
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::Backend(format!("Flush failed: {}", e)))?;
        Ok(())
    }
}

/// Maps `i64` onto `u64` so big-endian bytes sort in numeric order.
fn time_key(observed_at_ms: i64) -> [u8; 8] {
    ((observed_at_ms as u64) ^ (1u64 << 63)).to_be_bytes()
}

fn index_key(observed_at_ms: i64, vehicle_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + vehicle_id.len());
    key.extend_from_slice(&time_key(observed_at_ms));
    key.extend_from_slice(vehicle_id.as_bytes());
    key
}

fn encode(state: &VehicleState) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(state).map_err(|e| StoreError::Corrupt(format!("Encode failed: {}", e)))
}

fn decode(bytes: &[u8]) -> Result<VehicleState, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt(format!("Decode failed: {}", e)))
}

fn backend(e: sled::Error) -> StoreError {
    match e {
        sled::Error::Corruption { .. } => StoreError::Corrupt(e.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

fn unwrap_tx(e: TransactionError<StoreError>) -> StoreError {
    match e {
        TransactionError::Abort(inner) => inner,
        TransactionError::Storage(storage) => backend(storage),
    }
}

impl VehicleStateStore for SledStore {
    fn upsert_if_newer(&self, candidates: &[VehicleState]) -> Result<UpsertOutcome, StoreError> {
        if candidates.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        // Encode outside the transaction; the closure may run more than once.
        let encoded = candidates
            .iter()
            .map(|c| encode(c).map(|bytes| (c, bytes)))
            .collect::<Result<Vec<_>, _>>()?;

        let _gate = self.gate.write().map_err(|_| StoreError::Poisoned)?;

        let outcome = (&self.vehicles, &self.observed)
            .transaction(|(vehicles, observed)| {
                let mut outcome = UpsertOutcome::default();

                for (candidate, bytes) in &encoded {
                    let key = candidate.vehicle_id.as_bytes();
                    let existing = match vehicles.get(key)? {
                        Some(raw) => Some(decode(&raw).map_err(ConflictableTransactionError::Abort)?),
                        None => None,
                    };

                    if !outcome.record(existing.as_ref(), candidate) {
                        continue;
                    }
                    if let Some(previous) = &existing {
                        observed.remove(index_key(previous.observed_at_ms, &previous.vehicle_id))?;
                    }
                    vehicles.insert(key, bytes.as_slice())?;
                    observed.insert(
                        index_key(candidate.observed_at_ms, &candidate.vehicle_id),
                        &[] as &[u8],
                    )?;
                }

                Ok::<_, ConflictableTransactionError<StoreError>>(outcome)
            })
            .map_err(unwrap_tx)?;

        self.flush()?;
        debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            stale = outcome.stale,
            "sled commit"
        );
        Ok(outcome)
    }

    fn scan_since(&self, since_ms: i64) -> Result<Vec<VehicleState>, StoreError> {
        let _gate = self.gate.read().map_err(|_| StoreError::Poisoned)?;

        let mut rows = Vec::new();
        for entry in self.observed.range(time_key(since_ms)..) {
            let (key, _) = entry.map_err(backend)?;
            let vehicle_id = &key[8..];
            let raw = self.vehicles.get(vehicle_id).map_err(backend)?.ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "Index entry without vehicle row: {}",
                    String::from_utf8_lossy(vehicle_id)
                ))
            })?;
            rows.push(decode(&raw)?);
        }
        Ok(rows)
    }

    fn delete_older_than(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let _gate = self.gate.write().map_err(|_| StoreError::Poisoned)?;

        let expired = self
            .observed
            .range(..time_key(cutoff_ms))
            .keys()
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        if expired.is_empty() {
            return Ok(0);
        }

        (&self.vehicles, &self.observed)
            .transaction(|(vehicles, observed)| {
                for key in &expired {
                    observed.remove(key.as_ref())?;
                    vehicles.remove(&key[8..])?;
                }
                Ok::<_, ConflictableTransactionError<StoreError>>(())
            })
            .map_err(unwrap_tx)?;

        self.flush()?;
        Ok(expired.len())
    }

    fn get(&self, vehicle_id: &str) -> Result<Option<VehicleState>, StoreError> {
        match self.vehicles.get(vehicle_id.as_bytes()).map_err(backend)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.vehicles.len())
    }
}
