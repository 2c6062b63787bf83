use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::device_report::{AdditionalData, Ignition};
use super::{DeviceReport, Vehicle};

/// Immutable, append-only snapshot of one accepted report bound to a
/// vehicle. Never updated after insert (invariant I1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub vehicle_id: i64,
    pub imei: String,
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub ignition: Ignition,
    pub status: String,
    pub vehicle_status: Option<String>,
    pub gsm_strength: Option<i64>,
    /// Device-supplied wall-clock string, stored verbatim (no tz math).
    pub raw_timestamp: String,
    pub additional_data: AdditionalData,
    pub time_intervals: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn from_report(report: &DeviceReport, vehicle: &Vehicle, raw_timestamp: String) -> Self {
        Self {
            vehicle_id: vehicle.vehicle_id,
            imei: vehicle.imei.clone(),
            device_id: report.device_id.clone(),
            latitude: report.latitude.unwrap_or_default(),
            longitude: report.longitude.unwrap_or_default(),
            speed: report.speed,
            heading: report.heading,
            ignition: report.normalized_ignition(),
            status: report.status.clone(),
            vehicle_status: report.vehicle_status.clone(),
            gsm_strength: report.gsm_strength,
            raw_timestamp,
            additional_data: report.decoded_additional_data(),
            time_intervals: report.time_intervals.clone(),
            received_at: report.received_at.unwrap_or_else(Utc::now),
        }
    }

    /// The identity used for (deviceId, timestamp) dedup per invariant I1.
    pub fn dedup_key(&self) -> (String, String) {
        (self.device_id.clone(), self.raw_timestamp.clone())
    }
}
