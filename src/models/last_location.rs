use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::device_report::Ignition;

/// Mutable, one-row-per-vehicle "where is it now" record. Keyed by imei
/// when present, falling back to deviceId (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastLocation {
    pub vehicle_id: i64,
    pub imei: Option<String>,
    pub device_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub status: Option<String>,
    pub ignition: Ignition,
    pub vehicle_status: Option<String>,
    /// Device-supplied raw wall-clock string; compared for monotonicity.
    pub raw_timestamp: String,
    /// Wall-clock time the core accepted the write, used for the
    /// MIN_UPDATE_INTERVAL rate limit — distinct from `raw_timestamp`.
    pub accepted_at: DateTime<Utc>,
}

/// Timestamp format emitted on the wire: `YYYY-MM-DD HH:MM:SS`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parses the raw wall-clock timestamp for ordering comparisons only;
/// the string value is always what gets persisted (no tz conversion).
pub fn parse_raw_timestamp(raw: &str) -> Option<chrono::NaiveDateTime> {
    chrono::NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).ok()
}

impl LastLocation {
    /// Invariant I2: refuse a write whose timestamp is strictly earlier
    /// than what's currently stored. Unparseable timestamps on either
    /// side are treated as not-older (can't prove staleness), matching
    /// the "no timezone conversion, stored raw" policy — comparison is
    /// advisory, not authoritative.
    pub fn is_stale_compared_to(&self, candidate_raw_timestamp: &str) -> bool {
        match (
            parse_raw_timestamp(&self.raw_timestamp),
            parse_raw_timestamp(candidate_raw_timestamp),
        ) {
            (Some(current), Some(candidate)) => candidate < current,
            _ => false,
        }
    }
}
