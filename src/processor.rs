use std::sync::Arc;

use chrono::Timelike;
use tracing::{info, warn};

use crate::broadcast::Broadcaster;
use crate::cache::VehicleCache;
use crate::config::ProcessorConfig;
use crate::health::HealthMonitor;
use crate::ingest::{Transformer, Validator};
use crate::metrics::Counter;
use crate::models::{AlertEvent, DeviceReport};
use crate::persist::{BatchPersister, LocationStore};

/// Per-record orchestration (§4.6): validate, resolve the owning
/// vehicle, enforce the deviceId binding, transform, persist, broadcast,
/// and raise any threshold alerts — in that order, for one record.
pub struct Processor {
    config: ProcessorConfig,
    validator: Validator,
    transformer: Transformer,
    cache: Arc<VehicleCache>,
    persister: Arc<BatchPersister>,
    location_store: Arc<LocationStore>,
    broadcaster: Arc<Broadcaster>,
    db: Arc<crate::persist::DatabaseService>,
    health_monitor: Arc<HealthMonitor>,
    pub accepted: Counter,
    pub invalid: Counter,
    pub unknown_vehicle: Counter,
    pub binding_mismatch: Counter,
    pub rejected_records: Counter,
    pub timestamps_fixed: Counter,
    pub hex_conversions: Counter,
    pub speeding_alerts: Counter,
    pub quiet_hours_alerts: Counter,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
    pub errors: Vec<IndexedError>,
}

#[derive(Debug, Clone)]
pub struct IndexedError {
    pub index: usize,
    pub errors: Vec<String>,
}

impl Processor {
    pub fn new(
        config: ProcessorConfig,
        cache: Arc<VehicleCache>,
        persister: Arc<BatchPersister>,
        location_store: Arc<LocationStore>,
        broadcaster: Arc<Broadcaster>,
        db: Arc<crate::persist::DatabaseService>,
        health_monitor: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            config,
            validator: Validator::new(),
            transformer: Transformer::new(),
            cache,
            persister,
            location_store,
            broadcaster,
            db,
            health_monitor,
            accepted: Counter::new(),
            invalid: Counter::new(),
            unknown_vehicle: Counter::new(),
            binding_mismatch: Counter::new(),
            rejected_records: Counter::new(),
            timestamps_fixed: Counter::new(),
            hex_conversions: Counter::new(),
            speeding_alerts: Counter::new(),
            quiet_hours_alerts: Counter::new(),
        }
    }

    /// Processes one record end to end. `Ok(())` means it was accepted
    /// (persisted and broadcast); `Err(errors)` means it was dropped,
    /// with `errors` already counted against the matching metric.
    pub async fn process_one(&self, report: DeviceReport) -> Result<(), Vec<String>> {
        let outcome = self.validator.validate(&report);
        if !outcome.is_valid() {
            self.invalid.incr();
            self.health_monitor.record_message_received(false);
            return Err(outcome.errors);
        }
        self.health_monitor.record_message_received(true);

        let vehicle = match self.cache.lookup_by_imei(&report.imei).await {
            Ok(Some(v)) => v,
            Ok(None) => {
                self.unknown_vehicle.incr();
                return Err(vec!["unknown vehicle".to_string()]);
            }
            Err(e) => {
                self.unknown_vehicle.incr();
                return Err(vec![format!("vehicle lookup failed: {e}")]);
            }
        };

        let vehicle = if vehicle.binding_conflicts_with(&report.device_id) {
            self.binding_mismatch.incr();
            return Err(vec!["binding mismatch".to_string()]);
        } else if !vehicle.is_bound() {
            match self.db.bind_device_id(vehicle.vehicle_id, &report.device_id).await {
                Ok(bound) => {
                    self.cache.invalidate_vehicle(&vehicle);
                    self.cache.populate_vehicle(bound.clone());
                    info!(vehicle_id = bound.vehicle_id, device_id = %report.device_id, "bound deviceId to vehicle");
                    bound
                }
                Err(e) => {
                    return Err(vec![format!("binding write failed: {e}")]);
                }
            }
        } else {
            vehicle
        };

        let (history, last_location, update, timestamp_fixed) =
            self.transformer.transform(&report, &vehicle);
        if timestamp_fixed {
            self.timestamps_fixed.incr();
        }

        if !self.persister.enqueue(history).await {
            self.rejected_records.incr();
            return Err(vec!["rejected: batch queues full".to_string()]);
        }

        if let Err(e) = self.location_store.upsert(last_location).await {
            warn!(device_id = %report.device_id, error = %e, "location upsert failed after enqueue");
        }

        self.broadcaster.emit(update);
        self.accepted.incr();
        self.check_alerts(&report);

        Ok(())
    }

    /// Processes a list of records independently, in order, returning a
    /// `{total, ok, failed}` summary plus per-index errors — failures in
    /// one element never affect the others.
    pub async fn process_batch(&self, reports: Vec<DeviceReport>) -> BatchResult {
        let total = reports.len();
        let mut ok = 0;
        let mut errors = Vec::new();

        for (index, report) in reports.into_iter().enumerate() {
            match self.process_one(report).await {
                Ok(()) => ok += 1,
                Err(errs) => errors.push(IndexedError { index, errors: errs }),
            }
        }

        BatchResult {
            total,
            ok,
            failed: errors.len(),
            errors,
        }
    }

    /// Alert checks per §4.6: speeding, and ignition left ON during
    /// quiet hours (server local time).
    fn check_alerts(&self, report: &DeviceReport) {
        if let Some(speed) = report.speed {
            if speed > self.config.speed_alert_threshold_kmh {
                let alert = AlertEvent::warn(
                    "speeding",
                    format!("device {} exceeded speed threshold: {speed} km/h", report.device_id),
                )
                .with_metric("speed_kmh", speed, self.config.speed_alert_threshold_kmh);
                self.speeding_alerts.incr();
                warn!(category = %alert.category, message = %alert.message, "processor alert raised");
            }
        }

        if report.normalized_ignition() == crate::models::device_report::Ignition::On
            && self.in_quiet_hours()
        {
            let alert = AlertEvent::info(
                "quiet-hours-ignition",
                format!("device {} ignition ON during quiet hours", report.device_id),
            );
            self.quiet_hours_alerts.incr();
            info!(category = %alert.category, message = %alert.message, "processor alert raised");
        }
    }

    fn in_quiet_hours(&self) -> bool {
        let hour = chrono::Local::now().hour();
        let start = self.config.quiet_hours_start;
        let end = self.config.quiet_hours_end;
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}
