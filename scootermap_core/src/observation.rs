//! Observation wire format, decoding and validation.
//!
//! One transport message carries one JSON record:
//!
//! ```text
//! {"vehicleId":"dott-1f3a","feedId":"berlin","lat":52.52,"lon":13.40,"observedAt":1704067200000}
//! ```
//!
//! Coordinates may arrive as numbers or numeric strings (some GBFS feeds
//! quote them). Anything that cannot be turned into a valid observation is
//! rejected with a [`RejectReason`] and counted, never propagated.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::duration_millis;

/// A single vehicle position report, as published by the feed poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub vehicle_id: String,
    pub feed_id: String,
    pub lat: f64,
    pub lon: f64,
    /// Unix milliseconds
    pub observed_at: i64,
    #[serde(default)]
    pub is_reserved: bool,
    #[serde(default)]
    pub is_disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_type_id: Option<String>,
}

/// Why an inbound record was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum RejectReason {
    #[error("payload is not a valid observation record")]
    Malformed,

    #[error("missing vehicle id")]
    MissingVehicleId,

    #[error("missing or unparseable observedAt")]
    MissingTimestamp,

    #[error("coordinates missing, non-finite or out of range")]
    InvalidCoordinates,

    #[error("observedAt is too far in the future")]
    FutureTimestamp,
}

impl RejectReason {
    /// Stable label for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Malformed => "malformed",
            RejectReason::MissingVehicleId => "missing_vehicle_id",
            RejectReason::MissingTimestamp => "missing_timestamp",
            RejectReason::InvalidCoordinates => "invalid_coordinates",
            RejectReason::FutureTimestamp => "future_timestamp",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Coordinate {
    Number(f64),
    Text(String),
}

impl Coordinate {
    fn value(&self) -> Option<f64> {
        match self {
            Coordinate::Number(v) => Some(*v),
            Coordinate::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Lenient mirror of [`Observation`] so missing fields map to a reason.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawObservation {
    vehicle_id: Option<String>,
    feed_id: Option<String>,
    lat: Option<Coordinate>,
    lon: Option<Coordinate>,
    observed_at: Option<i64>,
    #[serde(default)]
    is_reserved: bool,
    #[serde(default)]
    is_disabled: bool,
    vehicle_type_id: Option<String>,
}

impl Observation {
    /// Decodes one transport payload.
    pub fn decode(payload: &[u8]) -> Result<Self, RejectReason> {
        let raw: RawObservation = serde_json::from_slice(payload).map_err(|_| RejectReason::Malformed)?;

        let vehicle_id = raw
            .vehicle_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(RejectReason::MissingVehicleId)?;

        let lat = raw.lat.as_ref().and_then(Coordinate::value);
        let lon = raw.lon.as_ref().and_then(Coordinate::value);
        let (lat, lon) = match (lat, lon) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => return Err(RejectReason::InvalidCoordinates),
        };

        let observed_at = raw.observed_at.ok_or(RejectReason::MissingTimestamp)?;

        Ok(Self {
            vehicle_id,
            feed_id: raw.feed_id.unwrap_or_else(|| "unknown".to_string()),
            lat,
            lon,
            observed_at,
            is_reserved: raw.is_reserved,
            is_disabled: raw.is_disabled,
            vehicle_type_id: raw.vehicle_type_id,
        })
    }

    /// Checks geographic bounds and clock skew against the worker clock.
    pub fn validate(&self, now_ms: i64, max_future_skew: Duration) -> Result<(), RejectReason> {
        if !self.lat.is_finite()
            || !self.lon.is_finite()
            || !(-90.0..=90.0).contains(&self.lat)
            || !(-180.0..=180.0).contains(&self.lon)
        {
            return Err(RejectReason::InvalidCoordinates);
        }

        let horizon = now_ms.saturating_add(duration_millis(max_future_skew));
        if self.observed_at > horizon {
            return Err(RejectReason::FutureTimestamp);
        }

        Ok(())
    }

    /// Decode and validate in one step.
    pub fn parse(payload: &[u8], now_ms: i64, max_future_skew: Duration) -> Result<Self, RejectReason> {
        let observation = Self::decode(payload)?;
        observation.validate(now_ms, max_future_skew)?;
        Ok(observation)
    }

    /// Encodes the record for publishing.
    pub fn to_payload(&self) -> Vec<u8> {
        // Serializing a struct of plain fields cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_704_067_200_000;
    const SKEW: Duration = Duration::from_secs(300);

    fn sample() -> Observation {
        Observation {
            vehicle_id: "dott-1".to_string(),
            feed_id: "berlin".to_string(),
            lat: 52.52,
            lon: 13.405,
            observed_at: NOW,
            is_reserved: false,
            is_disabled: false,
            vehicle_type_id: Some("scooter".to_string()),
        }
    }

    #[test]
    fn test_payload_decodes_back() {
        let obs = sample();
        let decoded = Observation::decode(&obs.to_payload()).unwrap();
        assert_eq!(decoded, obs);
    }

    #[test]
    fn test_string_coordinates_accepted() {
        let payload = br#"{"vehicleId":"a","feedId":"f","lat":"52.5","lon":" 13.4 ","observedAt":1}"#;
        let obs = Observation::decode(payload).unwrap();
        assert_eq!(obs.lat, 52.5);
        assert_eq!(obs.lon, 13.4);
    }

    #[test]
    fn test_missing_vehicle_id() {
        let payload = br#"{"feedId":"f","lat":52.5,"lon":13.4,"observedAt":1}"#;
        assert_eq!(Observation::decode(payload), Err(RejectReason::MissingVehicleId));

        let blank = br#"{"vehicleId":"  ","lat":52.5,"lon":13.4,"observedAt":1}"#;
        assert_eq!(Observation::decode(blank), Err(RejectReason::MissingVehicleId));
    }

    #[test]
    fn test_unparseable_coordinates() {
        let payload = br#"{"vehicleId":"a","lat":"north","lon":13.4,"observedAt":1}"#;
        assert_eq!(Observation::decode(payload), Err(RejectReason::InvalidCoordinates));

        let missing = br#"{"vehicleId":"a","lon":13.4,"observedAt":1}"#;
        assert_eq!(Observation::decode(missing), Err(RejectReason::InvalidCoordinates));
    }

    #[test]
    fn test_missing_timestamp() {
        let payload = br#"{"vehicleId":"a","lat":52.5,"lon":13.4}"#;
        assert_eq!(Observation::decode(payload), Err(RejectReason::MissingTimestamp));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert_eq!(Observation::decode(b"not json"), Err(RejectReason::Malformed));
        assert_eq!(Observation::decode(b"[1,2,3]"), Err(RejectReason::Malformed));
    }

    #[test]
    fn test_feed_id_defaults_to_unknown() {
        let payload = br#"{"vehicleId":"a","lat":52.5,"lon":13.4,"observedAt":1}"#;
        assert_eq!(Observation::decode(payload).unwrap().feed_id, "unknown");
    }

    #[test]
    fn test_out_of_range_coordinates_rejected() {
        let mut obs = sample();
        obs.lat = 91.0;
        assert_eq!(obs.validate(NOW, SKEW), Err(RejectReason::InvalidCoordinates));

        let mut obs = sample();
        obs.lon = -180.5;
        assert_eq!(obs.validate(NOW, SKEW), Err(RejectReason::InvalidCoordinates));
    }

    #[test]
    fn test_future_skew_boundary() {
        let mut obs = sample();
        obs.observed_at = NOW + 300_000;
        assert!(obs.validate(NOW, SKEW).is_ok());

        obs.observed_at = NOW + 300_001;
        assert_eq!(obs.validate(NOW, SKEW), Err(RejectReason::FutureTimestamp));
    }

    #[test]
    fn test_unbounded_skew_accepts_current_observations() {
        let mut obs = sample();
        assert!(obs.validate(NOW, Duration::MAX).is_ok());
        assert!(obs.validate(NOW, Duration::from_secs(u64::MAX)).is_ok());

        obs.observed_at = i64::MAX;
        assert!(obs.validate(NOW, Duration::MAX).is_ok());
    }

    #[test]
    fn test_old_observations_are_valid() {
        // Staleness is decided by the upsert policy and the window, not here.
        let mut obs = sample();
        obs.observed_at = NOW - 86_400_000;
        assert!(obs.validate(NOW, SKEW).is_ok());
    }
}
