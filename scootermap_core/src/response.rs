//! Presentation shapes for occupancy reports.
//!
//! - [`heatmap_json`]: per-hexagon list with center, boundary and metadata
//! - [`feature_collection`]: GeoJSON `FeatureCollection` of cell polygons,
//!   coordinates as `[lon, lat]` with closed rings

use chrono::{DateTime, SecondsFormat};
use serde::Serialize;

use crate::query::{OccupancyCell, OccupancyReport};
use crate::spatial::GeoPoint;

/// ISO-8601 UTC rendering of Unix milliseconds.
pub fn iso_millis(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HexagonEntry {
    pub h3_index: String,
    pub center: GeoPoint,
    /// Boundary vertices, without the closing point
    pub boundary: Vec<GeoPoint>,
    pub count: usize,
    pub last_updated: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapMetadata {
    pub min_count_filter: u32,
    pub available_resolutions: Vec<u8>,
    pub window_start: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapResponse {
    pub resolution: u8,
    pub timestamp: String,
    pub hexagons: Vec<HexagonEntry>,
    pub total_vehicles: usize,
    pub hexagon_count: usize,
    pub metadata: HeatmapMetadata,
}

fn vertices(cell: &OccupancyCell) -> Vec<GeoPoint> {
    let ring: Vec<GeoPoint> = cell
        .boundary
        .exterior()
        .coords()
        .map(|c| GeoPoint { lat: c.y, lon: c.x })
        .collect();
    match ring.split_last() {
        Some((last, open)) if Some(last) == open.first() => open.to_vec(),
        _ => ring,
    }
}

/// Heatmap payload for `report`; `available` lists the configured resolutions.
pub fn heatmap_json(report: &OccupancyReport, available: &[u8]) -> HeatmapResponse {
    let hexagons: Vec<HexagonEntry> = report
        .cells
        .iter()
        .map(|cell| HexagonEntry {
            h3_index: cell.cell_id.to_string(),
            center: cell.center,
            boundary: vertices(cell),
            count: cell.count,
            last_updated: iso_millis(cell.last_updated_ms),
        })
        .collect();

    HeatmapResponse {
        resolution: report.resolution,
        timestamp: iso_millis(report.window_end_ms),
        hexagon_count: hexagons.len(),
        total_vehicles: report.total_vehicles,
        hexagons,
        metadata: HeatmapMetadata {
            min_count_filter: report.min_count,
            available_resolutions: available.to_vec(),
            window_start: iso_millis(report.window_start_ms),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolygonGeometry {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub coordinates: Vec<Vec<[f64; 2]>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureProperties {
    pub h3_index: String,
    pub count: usize,
    pub resolution: u8,
    pub last_updated: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub geometry: PolygonGeometry,
    pub properties: FeatureProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionProperties {
    pub timestamp: String,
    pub resolution: u8,
    pub total_vehicles: usize,
    pub hexagon_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub features: Vec<Feature>,
    pub properties: CollectionProperties,
}

/// GeoJSON view of `report`.
pub fn feature_collection(report: &OccupancyReport) -> FeatureCollection {
    let features: Vec<Feature> = report
        .cells
        .iter()
        .map(|cell| {
            let mut ring: Vec<[f64; 2]> = vertices(cell).iter().map(|p| [p.lon, p.lat]).collect();
            if let Some(first) = ring.first().copied() {
                ring.push(first);
            }
            Feature {
                kind: "Feature",
                geometry: PolygonGeometry {
                    kind: "Polygon",
                    coordinates: vec![ring],
                },
                properties: FeatureProperties {
                    h3_index: cell.cell_id.to_string(),
                    count: cell.count,
                    resolution: report.resolution,
                    last_updated: iso_millis(cell.last_updated_ms),
                },
            }
        })
        .collect();

    FeatureCollection {
        kind: "FeatureCollection",
        properties: CollectionProperties {
            timestamp: iso_millis(report.window_end_ms),
            resolution: report.resolution,
            total_vehicles: features.iter().map(|f| f.properties.count).sum(),
            hexagon_count: features.len(),
        },
        features,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::query::{OccupancyQuery, WindowedQueryEngine};
    use crate::state::test_support::row;
    use crate::state::{MemoryStore, VehicleStateStore};
    use crate::testing::{ManualContext, EPOCH_MS};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn report() -> OccupancyReport {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_if_newer(&[
                row("a", 52.5219, 13.4132, EPOCH_MS),
                row("b", 52.5219, 13.4132, EPOCH_MS + 5_000),
                row("c", 52.5074, 13.3373, EPOCH_MS),
            ])
            .unwrap();
        WindowedQueryEngine::new(ManualContext::shared(), store, &EngineConfig::default())
            .unwrap()
            .occupancy_at(&OccupancyQuery::at_resolution(8), EPOCH_MS + 10_000)
            .unwrap()
    }

    #[test]
    fn test_iso_millis() {
        assert_eq!(iso_millis(EPOCH_MS), "2024-01-01T00:00:00.000Z");
        assert_eq!(iso_millis(EPOCH_MS + 1_500), "2024-01-01T00:00:01.500Z");
    }

    #[test]
    fn test_heatmap_totals_and_metadata() {
        let heatmap = heatmap_json(&report(), &[6, 7, 8, 9]);

        assert_eq!(heatmap.resolution, 8);
        assert_eq!(heatmap.hexagon_count, 2);
        assert_eq!(heatmap.total_vehicles, 3);
        assert_eq!(heatmap.metadata.available_resolutions, vec![6, 7, 8, 9]);
        assert_eq!(heatmap.timestamp, "2024-01-01T00:00:10.000Z");

        let busiest = heatmap.hexagons.iter().find(|h| h.count == 2).unwrap();
        assert_eq!(busiest.last_updated, "2024-01-01T00:00:05.000Z");
        assert!(busiest.boundary.len() >= 6);
        assert_ne!(busiest.boundary.first(), busiest.boundary.last());
    }

    #[test]
    fn test_feature_rings_are_closed_lon_lat() {
        let collection = feature_collection(&report());
        assert_eq!(collection.kind, "FeatureCollection");
        assert_eq!(collection.properties.total_vehicles, 3);

        for feature in &collection.features {
            let ring = &feature.geometry.coordinates[0];
            assert_eq!(ring.first(), ring.last());
            // Berlin: lon ~13, lat ~52
            assert_relative_eq!(ring[0][0], 13.4, epsilon = 0.2);
            assert_relative_eq!(ring[0][1], 52.5, epsilon = 0.2);
        }
    }

    #[test]
    fn test_feature_collection_serializes_geojson_keys() {
        let value = serde_json::to_value(feature_collection(&report())).unwrap();
        assert_eq!(value["type"], "FeatureCollection");
        assert_eq!(value["features"][0]["type"], "Feature");
        assert_eq!(value["features"][0]["geometry"]["type"], "Polygon");
        assert_eq!(value["features"][0]["properties"]["resolution"], 8);
    }
}
