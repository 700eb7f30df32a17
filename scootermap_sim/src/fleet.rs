//! Ground truth fleet for simulation.
//!
//! The FleetOracle plays the feed poller:
//! - A seeded fleet of vehicles parked around Berlin hubs
//! - Repeated poll snapshots (every vehicle reported on every poll)
//! - GPS jitter on each report, occasional relocation between polls
//!
//! It also remembers the last report per vehicle, which is exactly what the
//! store must converge to.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use scootermap_core::{Observation, SpatialIndex};
use std::collections::{BTreeMap, BTreeSet};

/// Hubs the fleet is spread around (lat, lon).
pub const BERLIN_HUBS: [(f64, f64); 4] = [
    (52.5219, 13.4132), // Alexanderplatz
    (52.5074, 13.3373), // Zoologischer Garten
    (52.4993, 13.4180), // Kreuzberg
    (52.5096, 13.3759), // Potsdamer Platz
];

const FEEDS: [&str; 3] = ["nextbike", "tier", "dott"];

/// Standard deviation of GPS jitter per report (degrees, ~1 m)
const GPS_JITTER_DEG: f64 = 0.00001;

/// Spread of parking spots around a hub (degrees, ~1 km)
const HUB_SPREAD_DEG: f64 = 0.01;

/// Step of a relocation between polls (degrees, ~200 m)
const RELOCATION_STEP_DEG: f64 = 0.002;

/// A simulated vehicle's true parking spot.
#[derive(Debug, Clone, PartialEq)]
pub struct SimVehicle {
    pub vehicle_id: String,
    pub feed_id: String,
    pub lat: f64,
    pub lon: f64,
    pub vehicle_type_id: String,
}

/// Seeded synthetic fleet.
pub struct FleetOracle {
    rng: ChaCha8Rng,
    vehicles: Vec<SimVehicle>,
    last_reports: BTreeMap<String, Observation>,
    relocation_probability: f64,
}

impl FleetOracle {
    /// Creates `fleet_size` vehicles spread over the Berlin hubs.
    pub fn new(seed: u64, fleet_size: usize) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let vehicles = (0..fleet_size)
            .map(|i| {
                let (hub_lat, hub_lon) = BERLIN_HUBS[i % BERLIN_HUBS.len()];
                let feed = FEEDS[i % FEEDS.len()];
                SimVehicle {
                    vehicle_id: format!("{feed}-{i:04}"),
                    feed_id: feed.to_string(),
                    lat: hub_lat + gaussian(&mut rng, HUB_SPREAD_DEG),
                    lon: hub_lon + gaussian(&mut rng, HUB_SPREAD_DEG),
                    vehicle_type_id: if i % 2 == 0 { "scooter" } else { "bike" }.to_string(),
                }
            })
            .collect();

        Self {
            rng,
            vehicles,
            last_reports: BTreeMap::new(),
            relocation_probability: 0.1,
        }
    }

    pub fn set_relocation_probability(&mut self, probability: f64) {
        self.relocation_probability = probability.clamp(0.0, 1.0);
    }

    pub fn vehicles(&self) -> &[SimVehicle] {
        &self.vehicles
    }

    /// Moves a vehicle to an exact spot (for hand-built scenarios).
    pub fn place(&mut self, index: usize, lat: f64, lon: f64) {
        if let Some(vehicle) = self.vehicles.get_mut(index) {
            vehicle.lat = lat;
            vehicle.lon = lon;
        }
    }

    /// One poll snapshot observed at `observed_at_ms`.
    pub fn poll(&mut self, observed_at_ms: i64) -> Vec<Observation> {
        let mut observations = Vec::with_capacity(self.vehicles.len());
        for i in 0..self.vehicles.len() {
            if self.rng.gen_bool(self.relocation_probability) {
                let dlat = gaussian(&mut self.rng, RELOCATION_STEP_DEG);
                let dlon = gaussian(&mut self.rng, RELOCATION_STEP_DEG);
                self.vehicles[i].lat += dlat;
                self.vehicles[i].lon += dlon;
            }
            let observation = self.report(i, observed_at_ms);
            observations.push(observation);
        }
        observations
    }

    /// Report for a single vehicle, with jitter.
    pub fn report(&mut self, index: usize, observed_at_ms: i64) -> Observation {
        let jitter_lat = gaussian(&mut self.rng, GPS_JITTER_DEG);
        let jitter_lon = gaussian(&mut self.rng, GPS_JITTER_DEG);
        let is_reserved = self.rng.gen_bool(0.05);
        let vehicle = &self.vehicles[index % self.vehicles.len()];

        let observation = Observation {
            vehicle_id: vehicle.vehicle_id.clone(),
            feed_id: vehicle.feed_id.clone(),
            lat: vehicle.lat + jitter_lat,
            lon: vehicle.lon + jitter_lon,
            observed_at: observed_at_ms,
            is_reserved,
            is_disabled: false,
            vehicle_type_id: Some(vehicle.vehicle_type_id.clone()),
        };

        let newer = self
            .last_reports
            .get(&observation.vehicle_id)
            .map_or(true, |previous| observation.observed_at > previous.observed_at);
        if newer {
            self.last_reports
                .insert(observation.vehicle_id.clone(), observation.clone());
        }
        observation
    }

    /// Newest report per vehicle.
    pub fn last_reports(&self) -> &BTreeMap<String, Observation> {
        &self.last_reports
    }

    /// Expected distinct-vehicle count per cell for vehicles last seen at or
    /// after `since_ms`.
    pub fn expected_counts(
        &self,
        index: &SpatialIndex,
        resolution: u8,
        since_ms: i64,
    ) -> BTreeMap<String, usize> {
        let mut members: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
        for report in self.last_reports.values() {
            if report.observed_at < since_ms {
                continue;
            }
            let cell = index
                .cells_for(report.lat, report.lon)
                .ok()
                .and_then(|cells| cells.get(resolution));
            if let Some(cell) = cell {
                members
                    .entry(cell.to_string())
                    .or_default()
                    .insert(report.vehicle_id.as_str());
            }
        }
        members.into_iter().map(|(cell, ids)| (cell, ids.len())).collect()
    }
}

fn gaussian(rng: &mut ChaCha8Rng, std_dev: f64) -> f64 {
    let z: f64 = StandardNormal.sample(rng);
    z * std_dev
}

/// A payload the worker must reject, cycling through every rejection kind.
pub fn malformed_payload(i: usize, now_ms: i64) -> Vec<u8> {
    match i % 5 {
        0 => b"{truncated".to_vec(),
        1 => format!(r#"{{"feedId":"tier","lat":52.5,"lon":13.4,"observedAt":{now_ms}}}"#).into_bytes(),
        2 => format!(r#"{{"vehicleId":"bad-{i}","lat":123.0,"lon":13.4,"observedAt":{now_ms}}}"#).into_bytes(),
        3 => format!(r#"{{"vehicleId":"bad-{i}","lat":52.5,"lon":13.4}}"#).into_bytes(),
        _ => format!(
            r#"{{"vehicleId":"bad-{i}","lat":52.5,"lon":13.4,"observedAt":{}}}"#,
            now_ms + 86_400_000
        )
        .into_bytes(),
    }
}
