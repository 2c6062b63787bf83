use chrono::Utc;
use geoutils::Location;

use crate::models::{DeviceReport, HistoryRecord, LastLocation, LocationUpdate, Vehicle};

/// Produces `HistoryRecord`, `LastLocation`, and `LocationUpdate`
/// artifacts from a validated `DeviceReport` bound to a `Vehicle`.
pub struct Transformer;

impl Transformer {
    pub fn new() -> Self {
        Self
    }

    /// Resolves the raw wall-clock timestamp, substituting current time
    /// (and counting a "timestamp fixed" outcome) when the device value
    /// does not parse.
    pub fn resolve_timestamp(&self, raw: &str) -> (String, bool) {
        if chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").is_ok() {
            (raw.to_string(), false)
        } else {
            (Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(), true)
        }
    }

    /// Builds the three downstream artifacts from one accepted report.
    pub fn transform(
        &self,
        report: &DeviceReport,
        vehicle: &Vehicle,
    ) -> (HistoryRecord, LastLocation, LocationUpdate, bool) {
        let (raw_timestamp, timestamp_fixed) = self.resolve_timestamp(&report.timestamp);

        let history = HistoryRecord::from_report(report, vehicle, raw_timestamp.clone());

        let last_location = LastLocation {
            vehicle_id: vehicle.vehicle_id,
            imei: Some(vehicle.imei.clone()),
            device_id: Some(report.device_id.clone()),
            latitude: report.latitude.unwrap_or_default(),
            longitude: report.longitude.unwrap_or_default(),
            speed: report.speed,
            heading: report.heading,
            status: Some(report.status.clone()),
            ignition: report.normalized_ignition(),
            vehicle_status: report.vehicle_status.clone(),
            raw_timestamp,
            accepted_at: Utc::now(),
        };

        let update = LocationUpdate::from(&history);

        (history, last_location, update, timestamp_fixed)
    }

    /// Strips non-ASCII bytes and trims surrounding whitespace ahead of
    /// JSON/CSV parsing.
    pub fn clean_payload(raw: &str) -> String {
        raw.chars().filter(|c| c.is_ascii()).collect::<String>().trim().to_string()
    }

    /// Converts a hex-encoded payload to ASCII when it is even-length and
    /// entirely hex digits; otherwise returns `None`.
    pub fn hex_to_ascii(payload: &str) -> Option<String> {
        let trimmed = payload.trim();
        if trimmed.is_empty() || trimmed.len() % 2 != 0 {
            return None;
        }
        if !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let mut bytes = Vec::with_capacity(trimmed.len() / 2);
        let chars: Vec<char> = trimmed.chars().collect();
        for pair in chars.chunks(2) {
            let byte_str: String = pair.iter().collect();
            let byte = u8::from_str_radix(&byte_str, 16).ok()?;
            bytes.push(byte);
        }
        String::from_utf8(bytes).ok()
    }

    /// Great-circle distance between two points in kilometers (R=6371km).
    pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
        let a = Location::new(lat1, lon1);
        let b = Location::new(lat2, lon2);
        a.haversine_distance_to(&b).meters() / 1000.0
    }

    pub fn kmh_to_mph(kmh: f64) -> f64 {
        kmh * 0.621371
    }

    pub fn kmh_to_ms(kmh: f64) -> f64 {
        kmh / 3.6
    }

    pub fn mph_to_kmh(mph: f64) -> f64 {
        mph / 0.621371
    }
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrips_ascii_json() {
        let original = r#"{"deviceId":"D1"}"#;
        let hex: String = original.bytes().map(|b| format!("{b:02x}")).collect();
        assert_eq!(Transformer::hex_to_ascii(&hex).unwrap(), original);
    }

    #[test]
    fn hex_rejects_odd_length_or_non_hex() {
        assert!(Transformer::hex_to_ascii("abc").is_none());
        assert!(Transformer::hex_to_ascii("zz").is_none());
    }

    #[test]
    fn unparseable_timestamp_is_substituted_and_flagged() {
        let t = Transformer::new();
        let (_, fixed) = t.resolve_timestamp("not-a-timestamp");
        assert!(fixed);
        let (_, fixed) = t.resolve_timestamp("2025-06-15 14:30:00");
        assert!(!fixed);
    }

    #[test]
    fn haversine_known_distance_is_approximately_correct() {
        // Paris to London, roughly 344 km great-circle.
        let km = Transformer::haversine_km(48.8566, 2.3522, 51.5074, -0.1278);
        assert!((300.0..400.0).contains(&km), "got {km}");
    }

    #[test]
    fn clean_payload_strips_non_ascii_and_trims() {
        let cleaned = Transformer::clean_payload("  héllo ");
        assert_eq!(cleaned, "hllo");
    }
}
