use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder};
use tracing::{debug, error, info, warn};

use crate::config::DatabaseConfig;
use crate::errors::{IngestError, Result};
use crate::models::device_report::Ignition;
use crate::models::{HistoryRecord, LastLocation, Vehicle};

const BULK_CHUNK_SIZE: usize = 500;

/// Thin wrapper around a Postgres connection pool. Schema (§6):
/// `vehicle` (imei unique, device_id set on first bind), `vehicle_history`
/// (append-only), `vehicle_last_location` (one row per vehicle, upsert
/// by imei then device_id). Timestamps are stored as the device-provided
/// wall-clock string, with no timezone conversion.
#[derive(Clone)]
pub struct DatabaseService {
    pool: PgPool,
}

impl DatabaseService {
    pub async fn new(database_url: &str, config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.connection_timeout_secs))
            .idle_timeout(std::time::Duration::from_secs(config.idle_timeout_secs))
            .connect(database_url)
            .await?;

        sqlx::query("SELECT 1").fetch_one(&pool).await?;
        info!("connected to Postgres");

        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| true)
            .unwrap_or_else(|e| {
                error!(error = %e, "database health check failed");
                false
            })
    }

    pub async fn fetch_vehicle_by_imei(&self, imei: &str) -> Result<Option<Vehicle>> {
        let row = sqlx::query_as::<_, Vehicle>(
            "SELECT vehicle_id, imei, device_id, vehicle_number FROM vehicle WHERE imei = $1",
        )
        .bind(imei)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn fetch_vehicle_by_id(&self, vehicle_id: i64) -> Result<Option<Vehicle>> {
        let row = sqlx::query_as::<_, Vehicle>(
            "SELECT vehicle_id, imei, device_id, vehicle_number FROM vehicle WHERE vehicle_id = $1",
        )
        .bind(vehicle_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// First-bind only: sets `device_id` on a vehicle that doesn't have
    /// one yet. Never overwrites an existing binding (invariant I3 is
    /// enforced by the caller before reaching here).
    pub async fn bind_device_id(&self, vehicle_id: i64, device_id: &str) -> Result<Vehicle> {
        let row = sqlx::query_as::<_, Vehicle>(
            "UPDATE vehicle SET device_id = $1 WHERE vehicle_id = $2 AND device_id IS NULL
             RETURNING vehicle_id, imei, device_id, vehicle_number",
        )
        .bind(device_id)
        .bind(vehicle_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(v) => Ok(v),
            None => self
                .fetch_vehicle_by_id(vehicle_id)
                .await?
                .ok_or_else(|| IngestError::processing("vehicle disappeared during bind")),
        }
    }

    /// Bulk-inserts a chunk of history records in one transaction.
    /// Callers fall back to `insert_history_one` per record on failure.
    pub async fn insert_history_bulk(&self, records: &[HistoryRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in records.chunks(BULK_CHUNK_SIZE) {
            let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
                "INSERT INTO vehicle_history (
                    vehicle_id, imei, device_id, latitude, longitude, speed, heading,
                    ignition, status, vehicle_status, gsm_strength, raw_timestamp,
                    additional_data, time_intervals, received_at
                ) ",
            );
            builder.push_values(chunk, |mut b, r| {
                b.push_bind(r.vehicle_id)
                    .push_bind(&r.imei)
                    .push_bind(&r.device_id)
                    .push_bind(r.latitude)
                    .push_bind(r.longitude)
                    .push_bind(r.speed)
                    .push_bind(r.heading)
                    .push_bind(r.ignition.as_str())
                    .push_bind(&r.status)
                    .push_bind(&r.vehicle_status)
                    .push_bind(r.gsm_strength)
                    .push_bind(&r.raw_timestamp)
                    .push_bind(sqlx::types::Json(&r.additional_data))
                    .push_bind(&r.time_intervals)
                    .push_bind(r.received_at);
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Per-record fallback path used by the batch persister when a bulk
    /// insert fails; isolates one bad record from the rest of the chunk.
    pub async fn insert_history_one(&self, record: &HistoryRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO vehicle_history (
                vehicle_id, imei, device_id, latitude, longitude, speed, heading,
                ignition, status, vehicle_status, gsm_strength, raw_timestamp,
                additional_data, time_intervals, received_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
        )
        .bind(record.vehicle_id)
        .bind(&record.imei)
        .bind(&record.device_id)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(record.speed)
        .bind(record.heading)
        .bind(record.ignition.as_str())
        .bind(&record.status)
        .bind(&record.vehicle_status)
        .bind(record.gsm_strength)
        .bind(&record.raw_timestamp)
        .bind(sqlx::types::Json(&record.additional_data))
        .bind(&record.time_intervals)
        .bind(record.received_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_last_location_by_imei(&self, imei: &str) -> Result<Option<LastLocation>> {
        let row = sqlx::query_as::<_, LastLocationRow>(
            "SELECT vehicle_id, imei, device_id, latitude, longitude, speed, heading,
                    status, ignition, vehicle_status, raw_timestamp, accepted_at
             FROM vehicle_last_location WHERE imei = $1",
        )
        .bind(imei)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn fetch_last_location_by_device_id(
        &self,
        device_id: &str,
    ) -> Result<Option<LastLocation>> {
        let row = sqlx::query_as::<_, LastLocationRow>(
            "SELECT vehicle_id, imei, device_id, latitude, longitude, speed, heading,
                    status, ignition, vehicle_status, raw_timestamp, accepted_at
             FROM vehicle_last_location WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Upserts by `vehicle_id` (the stable key once a row exists);
    /// resolution by imei/deviceId happens one layer up in
    /// `LocationStore`, which already knows which vehicle this write
    /// belongs to.
    pub async fn upsert_last_location(&self, loc: &LastLocation) -> Result<()> {
        sqlx::query(
            "INSERT INTO vehicle_last_location (
                vehicle_id, imei, device_id, latitude, longitude, speed, heading,
                status, ignition, vehicle_status, raw_timestamp, accepted_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
            ON CONFLICT (vehicle_id) DO UPDATE SET
                imei = EXCLUDED.imei,
                device_id = EXCLUDED.device_id,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                speed = EXCLUDED.speed,
                heading = EXCLUDED.heading,
                status = EXCLUDED.status,
                ignition = EXCLUDED.ignition,
                vehicle_status = EXCLUDED.vehicle_status,
                raw_timestamp = EXCLUDED.raw_timestamp,
                accepted_at = EXCLUDED.accepted_at",
        )
        .bind(loc.vehicle_id)
        .bind(&loc.imei)
        .bind(&loc.device_id)
        .bind(loc.latitude)
        .bind(loc.longitude)
        .bind(loc.speed)
        .bind(loc.heading)
        .bind(&loc.status)
        .bind(loc.ignition.as_str())
        .bind(&loc.vehicle_status)
        .bind(&loc.raw_timestamp)
        .bind(loc.accepted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bounded retry for transient data-access errors, used by
    /// `LocationStore` per §7 (up to 3 attempts, 1s backoff).
    pub async fn upsert_last_location_with_retry(&self, loc: &LastLocation) -> Result<()> {
        const ATTEMPTS: u32 = 3;
        let mut last_err = None;
        for attempt in 1..=ATTEMPTS {
            match self.upsert_last_location(loc).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() && attempt < ATTEMPTS => {
                    warn!(attempt, error = %e, "transient error upserting last location, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| IngestError::processing("retry loop exited unexpectedly")))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LastLocationRow {
    vehicle_id: i64,
    imei: Option<String>,
    device_id: Option<String>,
    latitude: f64,
    longitude: f64,
    speed: Option<f64>,
    heading: Option<f64>,
    status: Option<String>,
    ignition: String,
    vehicle_status: Option<String>,
    raw_timestamp: String,
    accepted_at: chrono::DateTime<chrono::Utc>,
}

impl From<LastLocationRow> for LastLocation {
    fn from(row: LastLocationRow) -> Self {
        LastLocation {
            vehicle_id: row.vehicle_id,
            imei: row.imei,
            device_id: row.device_id,
            latitude: row.latitude,
            longitude: row.longitude,
            speed: row.speed,
            heading: row.heading,
            status: row.status,
            ignition: if row.ignition == Ignition::On.as_str() {
                Ignition::On
            } else {
                Ignition::Off
            },
            vehicle_status: row.vehicle_status,
            raw_timestamp: row.raw_timestamp,
            accepted_at: row.accepted_at,
        }
    }
}

/// Applies the crate's embedded schema migrations at boot.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| IngestError::Internal(e.into()))?;
    debug!("migrations applied");
    Ok(())
}

/// Runs migrations at startup, logging and continuing on failure rather
/// than aborting boot — an already-applied or externally-managed schema
/// is a normal deployment shape, not a fatal condition.
pub async fn run_migrations_best_effort(db: &DatabaseService) {
    match run_migrations(&db.pool).await {
        Ok(()) => info!("schema migrations up to date"),
        Err(e) => warn!(error = %e, "schema migration step failed, continuing with existing schema"),
    }
}
