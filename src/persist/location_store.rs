use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::cache::VehicleCache;
use crate::errors::Result;
use crate::metrics::Counter;
use crate::models::LastLocation;

use super::database::DatabaseService;

const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Upserts `LastLocation`, enforcing per-device update cadence and
/// timestamp monotonicity (invariant I2).
pub struct LocationStore {
    db: Arc<DatabaseService>,
    cache: Arc<VehicleCache>,
    last_accepted: DashMap<String, Instant>,
    pub rate_limited: Counter,
    pub skipped_stale: Counter,
    pub upserted: Counter,
}

impl LocationStore {
    pub fn new(db: Arc<DatabaseService>, cache: Arc<VehicleCache>) -> Self {
        Self {
            db,
            cache,
            last_accepted: DashMap::new(),
            rate_limited: Counter::new(),
            skipped_stale: Counter::new(),
            upserted: Counter::new(),
        }
    }

    fn rate_limit_key(candidate: &LastLocation) -> String {
        candidate
            .device_id
            .clone()
            .or_else(|| candidate.imei.clone())
            .unwrap_or_else(|| candidate.vehicle_id.to_string())
    }

    /// (a) rate-limit, (b) resolve existing row, (c) merge/adopt stable
    /// identifiers, (d) write, (e) refresh cache. Returns `true` if the
    /// write was applied.
    pub async fn upsert(&self, candidate: LastLocation) -> Result<bool> {
        let key = Self::rate_limit_key(&candidate);
        if let Some(last) = self.last_accepted.get(&key) {
            if last.elapsed() < MIN_UPDATE_INTERVAL {
                self.rate_limited.incr();
                return Ok(false);
            }
        }

        let existing = self.resolve_existing(&candidate).await?;
        if let Some(existing) = &existing {
            if existing.is_stale_compared_to(&candidate.raw_timestamp) {
                self.skipped_stale.incr();
                return Ok(false);
            }
        }

        let merged = Self::merge(existing, candidate);
        self.db.upsert_last_location_with_retry(&merged).await?;
        self.cache.put_location(merged.clone());
        self.last_accepted.insert(key, Instant::now());
        self.upserted.incr();
        debug!(vehicle_id = merged.vehicle_id, "last location upserted");
        Ok(true)
    }

    async fn resolve_existing(&self, candidate: &LastLocation) -> Result<Option<LastLocation>> {
        if let Some(imei) = &candidate.imei {
            if let Some(cached) = self.cache.location_by_imei(imei) {
                return Ok(Some(cached));
            }
            if let Some(found) = self.db.fetch_last_location_by_imei(imei).await? {
                return Ok(Some(found));
            }
        }
        if let Some(device_id) = &candidate.device_id {
            if let Some(cached) = self.cache.location_by_device_id(device_id) {
                return Ok(Some(cached));
            }
            if let Some(found) = self.db.fetch_last_location_by_device_id(device_id).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Adopts the new location/speed/status/ignition/heading/vehicleStatus;
    /// if the existing row lacks an identifier the candidate carries, it
    /// is adopted — otherwise stable identifiers must already agree
    /// (invariant I3 is enforced earlier, at the binding-check step).
    fn merge(existing: Option<LastLocation>, candidate: LastLocation) -> LastLocation {
        match existing {
            None => candidate,
            Some(mut row) => {
                row.latitude = candidate.latitude;
                row.longitude = candidate.longitude;
                row.speed = candidate.speed;
                row.heading = candidate.heading;
                row.status = candidate.status;
                row.ignition = candidate.ignition;
                row.vehicle_status = candidate.vehicle_status;
                row.raw_timestamp = candidate.raw_timestamp;
                row.accepted_at = candidate.accepted_at;
                if row.imei.is_none() {
                    row.imei = candidate.imei;
                }
                if row.device_id.is_none() {
                    row.device_id = candidate.device_id;
                }
                row
            }
        }
    }

    /// Collapses a batch by `deviceId`, keeping only the row with the
    /// latest raw timestamp per device, then applies each surviving row.
    pub async fn upsert_bulk(&self, candidates: Vec<LastLocation>) -> Result<usize> {
        let mut latest: HashMap<String, LastLocation> = HashMap::new();
        for candidate in candidates {
            let key = candidate
                .device_id
                .clone()
                .unwrap_or_else(|| candidate.vehicle_id.to_string());
            match latest.get(&key) {
                Some(current) if current.raw_timestamp >= candidate.raw_timestamp => {}
                _ => {
                    latest.insert(key, candidate);
                }
            }
        }

        let mut applied = 0;
        for candidate in latest.into_values() {
            if self.upsert(candidate).await? {
                applied += 1;
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::device_report::Ignition;

    fn location(device_id: &str, raw_timestamp: &str) -> LastLocation {
        LastLocation {
            vehicle_id: 1,
            imei: None,
            device_id: Some(device_id.to_string()),
            latitude: 1.0,
            longitude: 2.0,
            speed: None,
            heading: None,
            status: None,
            ignition: Ignition::Off,
            vehicle_status: None,
            raw_timestamp: raw_timestamp.to_string(),
            accepted_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn merge_adopts_missing_identifiers_without_overwriting_present_ones() {
        let mut existing = location("D1", "2025-06-15 14:00:00");
        existing.imei = None;
        let candidate = {
            let mut c = location("D1", "2025-06-15 14:05:00");
            c.imei = Some("123456789012345".to_string());
            c
        };
        let merged = LocationStore::merge(Some(existing), candidate);
        assert_eq!(merged.imei.as_deref(), Some("123456789012345"));
        assert_eq!(merged.device_id.as_deref(), Some("D1"));
    }

    #[test]
    fn bulk_collapse_keeps_latest_timestamp_per_device() {
        let candidates = vec![
            location("D1", "2025-06-15 14:00:00"),
            location("D1", "2025-06-15 14:05:00"),
            location("D2", "2025-06-15 13:00:00"),
        ];
        let mut latest: HashMap<String, LastLocation> = HashMap::new();
        for c in candidates {
            let key = c.device_id.clone().unwrap();
            match latest.get(&key) {
                Some(current) if current.raw_timestamp >= c.raw_timestamp => {}
                _ => {
                    latest.insert(key, c);
                }
            }
        }
        assert_eq!(latest.get("D1").unwrap().raw_timestamp, "2025-06-15 14:05:00");
        assert_eq!(latest.get("D2").unwrap().raw_timestamp, "2025-06-15 13:00:00");
    }
}
