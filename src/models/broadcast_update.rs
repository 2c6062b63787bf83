use serde::{Deserialize, Serialize};

use super::device_report::{AdditionalData, Ignition};
use super::HistoryRecord;

/// Event shape emitted to downstream real-time subscribers. The wire
/// format of the transport itself is out of scope; only this shape is
/// specified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub raw_timestamp: String,
    pub speed: Option<f64>,
    pub ignition: Ignition,
    pub heading: Option<f64>,
    pub vehicle_status: Option<String>,
    pub gsm_strength: Option<i64>,
    pub additional_data: AdditionalData,
    pub time_intervals: Option<String>,
}

impl From<&HistoryRecord> for LocationUpdate {
    fn from(record: &HistoryRecord) -> Self {
        Self {
            device_id: record.device_id.clone(),
            latitude: record.latitude,
            longitude: record.longitude,
            raw_timestamp: record.raw_timestamp.clone(),
            speed: record.speed,
            ignition: record.ignition,
            heading: record.heading,
            vehicle_status: record.vehicle_status.clone(),
            gsm_strength: record.gsm_strength,
            additional_data: record.additional_data.clone(),
            time_intervals: record.time_intervals.clone(),
        }
    }
}
