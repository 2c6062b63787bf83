use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use moka::sync::Cache;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::models::{LastLocation, Vehicle};
use crate::persist::DatabaseService;

/// Read-through cache in front of `DatabaseService` for vehicle lookups
/// and last-known-location reads. Five independent maps are kept in
/// sync: Vehicle-by-IMEI, Vehicle-by-ID, LastLocation-by-deviceId,
/// LastLocation-by-IMEI, deviceId→IMEI. A vehicle mutation invalidates
/// all five for the affected keys.
pub struct VehicleCache {
    db: Arc<DatabaseService>,
    vehicle_by_imei: Cache<String, Vehicle>,
    vehicle_by_id: Cache<i64, Vehicle>,
    location_by_device_id: Cache<String, LastLocation>,
    location_by_imei: Cache<String, LastLocation>,
    device_to_imei: Cache<String, String>,
    access_counts: DashMap<String, u64>,
}

impl VehicleCache {
    pub fn new(db: Arc<DatabaseService>, config: &CacheConfig) -> Self {
        let write_expiry = Duration::from_secs(config.expire_after_write_mins * 60);
        let access_expiry = Duration::from_secs(config.expire_after_access_mins * 60);
        let location_expiry = Duration::from_secs(config.location_expiry_mins * 60);

        let vehicle_by_imei = Cache::builder()
            .max_capacity(config.max_size)
            .time_to_live(write_expiry)
            .time_to_idle(access_expiry)
            .build();
        let vehicle_by_id = Cache::builder()
            .max_capacity(config.max_size)
            .time_to_live(write_expiry)
            .time_to_idle(access_expiry)
            .build();
        let location_by_device_id = Cache::builder()
            .max_capacity(config.max_size * 2)
            .time_to_live(location_expiry)
            .build();
        let location_by_imei = Cache::builder()
            .max_capacity(config.max_size * 2)
            .time_to_live(location_expiry)
            .build();
        let device_to_imei = Cache::builder()
            .max_capacity(config.max_size)
            .time_to_live(write_expiry)
            .time_to_idle(access_expiry)
            .build();

        Self {
            db,
            vehicle_by_imei,
            vehicle_by_id,
            location_by_device_id,
            location_by_imei,
            device_to_imei,
            access_counts: DashMap::new(),
        }
    }

    fn note_access(&self, key: &str) {
        *self.access_counts.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Read-through lookup by IMEI; falls through to the database on a
    /// cache miss and populates all relevant caches.
    pub async fn lookup_by_imei(&self, imei: &str) -> crate::errors::Result<Option<Vehicle>> {
        self.note_access(imei);
        if let Some(v) = self.vehicle_by_imei.get(imei) {
            return Ok(Some(v));
        }
        let fetched = self.db.fetch_vehicle_by_imei(imei).await?;
        if let Some(v) = &fetched {
            self.populate_vehicle(v.clone());
        }
        Ok(fetched)
    }

    pub async fn lookup_by_id(&self, vehicle_id: i64) -> crate::errors::Result<Option<Vehicle>> {
        if let Some(v) = self.vehicle_by_id.get(&vehicle_id) {
            return Ok(Some(v));
        }
        let fetched = self.db.fetch_vehicle_by_id(vehicle_id).await?;
        if let Some(v) = &fetched {
            self.populate_vehicle(v.clone());
        }
        Ok(fetched)
    }

    pub fn populate_vehicle(&self, vehicle: Vehicle) {
        self.vehicle_by_id.insert(vehicle.vehicle_id, vehicle.clone());
        self.vehicle_by_imei.insert(vehicle.imei.clone(), vehicle.clone());
        if let Some(device_id) = &vehicle.device_id {
            self.device_to_imei
                .insert(device_id.clone(), vehicle.imei.clone());
        }
    }

    /// Invalidates all five caches for the keys touched by a vehicle
    /// mutation (e.g. first-bind of deviceId).
    pub fn invalidate_vehicle(&self, vehicle: &Vehicle) {
        self.vehicle_by_imei.invalidate(&vehicle.imei);
        self.vehicle_by_id.invalidate(&vehicle.vehicle_id);
        self.location_by_imei.invalidate(&vehicle.imei);
        if let Some(device_id) = &vehicle.device_id {
            self.device_to_imei.invalidate(device_id);
            self.location_by_device_id.invalidate(device_id);
        }
    }

    pub fn location_by_device_id(&self, device_id: &str) -> Option<LastLocation> {
        self.location_by_device_id.get(device_id)
    }

    pub fn location_by_imei(&self, imei: &str) -> Option<LastLocation> {
        self.location_by_imei.get(imei)
    }

    pub fn put_location(&self, location: LastLocation) {
        if let Some(device_id) = &location.device_id {
            self.location_by_device_id
                .insert(device_id.clone(), location.clone());
        }
        if let Some(imei) = &location.imei {
            self.location_by_imei.insert(imei.clone(), location);
        }
    }

    /// Periodic maintenance tick (every 5 minutes in production): logs
    /// cache stats and prefetches the top-100 most-accessed keys.
    pub async fn maintenance_tick(&self) {
        debug!(
            vehicle_by_imei = self.vehicle_by_imei.entry_count(),
            vehicle_by_id = self.vehicle_by_id.entry_count(),
            location_by_device_id = self.location_by_device_id.entry_count(),
            location_by_imei = self.location_by_imei.entry_count(),
            "vehicle cache stats"
        );

        let mut top: Vec<(String, u64)> = self
            .access_counts
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1));
        top.truncate(100);

        for (imei, _) in top {
            if self.vehicle_by_imei.get(&imei).is_none() {
                if let Ok(Some(v)) = self.db.fetch_vehicle_by_imei(&imei).await {
                    self.populate_vehicle(v);
                }
            }
        }
        info!(tracked_keys = self.access_counts.len(), "cache maintenance tick complete");
    }
}
