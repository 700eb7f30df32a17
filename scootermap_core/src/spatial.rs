//! The "SPACE" adapter - H3 hexagonal indexing at a fixed set of resolutions
//!
//! The hexagon math lives in h3o. This module only:
//! - validates the configured resolution set
//! - encodes a point into one cell per resolution, each computed directly
//!   from the point (H3 children do not tile their parent exactly, so
//!   rolling a fine cell up with `parent` can land in a different coarse
//!   cell than encoding the point at the coarse resolution)
//! - resolves and caches cell geometry for query output

use geo::{LineString, Polygon};
use h3o::{CellIndex, LatLng, Resolution};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use thiserror::Error;

use crate::config::ConfigError;

/// Spatial indexing errors
#[derive(Debug, Error)]
pub enum SpatialError {
    #[error("Invalid coordinates: {0}")]
    InvalidCoordinates(String),
}

/// A WGS84 point in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl From<LatLng> for GeoPoint {
    fn from(ll: LatLng) -> Self {
        Self {
            lat: ll.lat(),
            lon: ll.lng(),
        }
    }
}

/// Ordered, de-duplicated set of H3 resolutions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionSet {
    resolutions: Vec<Resolution>,
}

impl ResolutionSet {
    /// Builds the set from raw resolution numbers (any order, duplicates allowed).
    pub fn new(raw: &[u8]) -> Result<Self, ConfigError> {
        if raw.is_empty() {
            return Err(ConfigError::NoResolutions);
        }
        let mut numbers = raw.to_vec();
        numbers.sort_unstable();
        numbers.dedup();

        let resolutions = numbers
            .into_iter()
            .map(|r| Resolution::try_from(r).map_err(|_| ConfigError::InvalidResolution(r)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { resolutions })
    }

    /// Returns true if `resolution` is configured.
    pub fn contains(&self, resolution: u8) -> bool {
        self.get(resolution).is_some()
    }

    /// Looks up a configured resolution by number.
    pub fn get(&self, resolution: u8) -> Option<Resolution> {
        self.resolutions
            .iter()
            .copied()
            .find(|r| u8::from(*r) == resolution)
    }

    /// Iterates resolutions from coarsest to finest.
    pub fn iter(&self) -> impl Iterator<Item = Resolution> + '_ {
        self.resolutions.iter().copied()
    }

    /// Resolution numbers, ascending.
    pub fn as_u8(&self) -> Vec<u8> {
        self.resolutions.iter().map(|r| u8::from(*r)).collect()
    }

    pub fn len(&self) -> usize {
        self.resolutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolutions.is_empty()
    }
}

/// One cell id per configured resolution for a single position.
///
/// Serialized as `{ "7": "872a1008effffff", ... }` so stored rows stay
/// readable and independent of h3o's internal representation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CellSet(#[serde(with = "cell_map_serde")] BTreeMap<u8, CellIndex>);

impl CellSet {
    /// Cell at the given resolution, if that resolution was indexed.
    pub fn get(&self, resolution: u8) -> Option<CellIndex> {
        self.0.get(&resolution).copied()
    }

    pub fn insert(&mut self, resolution: u8, cell: CellIndex) {
        self.0.insert(resolution, cell);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates `(resolution, cell)` pairs, coarsest first.
    pub fn iter(&self) -> impl Iterator<Item = (u8, CellIndex)> + '_ {
        self.0.iter().map(|(r, c)| (*r, *c))
    }
}

/// Encodes points into H3 cells at the configured resolutions.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    resolutions: ResolutionSet,
}

impl SpatialIndex {
    /// Create a new SpatialIndex for the given resolution set
    pub fn new(resolutions: ResolutionSet) -> Self {
        Self { resolutions }
    }

    pub fn resolutions(&self) -> &ResolutionSet {
        &self.resolutions
    }

    /// Convert WGS84 coordinates to an H3 cell at a single resolution.
    pub fn cell_for(&self, lat: f64, lon: f64, resolution: Resolution) -> Result<CellIndex, SpatialError> {
        let latlng = LatLng::new(lat, lon)
            .map_err(|e| SpatialError::InvalidCoordinates(format!("{:?}", e)))?;
        Ok(latlng.to_cell(resolution))
    }

    /// Encode a point at every configured resolution.
    pub fn cells_for(&self, lat: f64, lon: f64) -> Result<CellSet, SpatialError> {
        let latlng = LatLng::new(lat, lon)
            .map_err(|e| SpatialError::InvalidCoordinates(format!("{:?}", e)))?;

        let mut cells = CellSet::default();
        for resolution in self.resolutions.iter() {
            cells.insert(u8::from(resolution), latlng.to_cell(resolution));
        }
        Ok(cells)
    }

    /// Center point of a cell.
    pub fn center_of(cell: CellIndex) -> GeoPoint {
        LatLng::from(cell).into()
    }

    /// Cell outline as a closed polygon (x = longitude, y = latitude).
    pub fn boundary_of(cell: CellIndex) -> Polygon<f64> {
        Polygon::new(LineString::from(cell.boundary()), vec![])
    }

    /// Ancestor of `cell` at a coarser resolution.
    ///
    /// Returns `None` if `coarser` is finer than the cell itself.
    pub fn parent_of(cell: CellIndex, coarser: Resolution) -> Option<CellIndex> {
        cell.parent(coarser)
    }
}

/// Cached geometry for one cell.
#[derive(Debug, Clone)]
pub struct CellGeometry {
    pub center: GeoPoint,
    pub boundary: Polygon<f64>,
}

/// Thread-safe geometry cache keyed by cell id.
///
/// Geometry is a pure function of the cell id, so entries never go stale.
#[derive(Debug, Default)]
pub struct GeometryCache {
    entries: RwLock<HashMap<CellIndex, CellGeometry>>,
}

impl GeometryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the geometry for `cell`, computing it on first use.
    pub fn get(&self, cell: CellIndex) -> CellGeometry {
        if let Ok(entries) = self.entries.read() {
            if let Some(hit) = entries.get(&cell) {
                return hit.clone();
            }
        }

        let geometry = CellGeometry {
            center: SpatialIndex::center_of(cell),
            boundary: SpatialIndex::boundary_of(cell),
        };
        // A poisoned cache only costs recomputation.
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(cell, geometry.clone());
        }
        geometry
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

mod cell_map_serde {
    use h3o::CellIndex;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        cells: &BTreeMap<u8, CellIndex>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let as_strings: BTreeMap<String, String> = cells
            .iter()
            .map(|(r, c)| (r.to_string(), c.to_string()))
            .collect();
        as_strings.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u8, CellIndex>, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(r, c)| {
                let resolution = r.parse::<u8>().map_err(D::Error::custom)?;
                let cell = c.parse::<CellIndex>().map_err(D::Error::custom)?;
                Ok((resolution, cell))
            })
            .collect()
    }
}
