use anyhow::Result;
use config::ConfigError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub pool: PoolConfig,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
    pub health: HealthConfig,
    pub processing: ProcessorConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topics: Vec<String>,
    pub keep_alive_secs: u64,
    pub connection_timeout_secs: u64,
    pub max_inflight: u16,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub initial: usize,
    pub min: usize,
    pub max: usize,
    pub scale_up_threshold: usize,
    pub devices_per_conn: usize,
    pub acquire_timeout_secs: u64,
    pub reconnect_cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// External enqueue-level buffer size (distinct from the worker's
    /// internal flush cut-off — spec.md §9 leaves open whether this is
    /// intentional; see DESIGN.md).
    pub enqueue_buffer_size: usize,
    /// Worker-internal flush cut-off.
    pub worker_batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_wait_ms: u64,
    pub parallel_queues: usize,
    pub overflow_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_size: u64,
    pub expire_after_write_mins: u64,
    pub expire_after_access_mins: u64,
    pub location_expiry_mins: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
    pub min_healthy_connections: usize,
    pub max_connection_failure_rate: f64,
    pub memory_issue_pct: f64,
    pub memory_warning_pct: f64,
    pub thread_warning_count: usize,
    pub message_timeout_secs: u64,
    pub invalid_message_rate_warning: f64,
    pub batch_queue_warning_size: usize,
    pub connection_success_rate_issue: f64,
    pub connection_success_rate_warning: f64,
    pub avg_connect_time_warning_secs: f64,
    pub min_active_devices_issue: usize,
    pub min_active_devices_warning: usize,
    pub cb_failure_threshold: u32,
    pub cb_timeout_secs: u64,
    pub cb_half_open_max_calls: u32,
    pub alert_rate_limit_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub speed_alert_threshold_kmh: f64,
    pub device_timeout_mins: u64,
    pub quiet_hours_start: u32,
    pub quiet_hours_end: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json_format: bool,
}

/// Reads `key`, falling back to `default` on missing/unparseable value.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        if s.trim().is_empty() {
            None
        } else {
            Some(s)
        }
    })
}

impl AppConfig {
    /// Loads configuration from environment variables only, mirroring
    /// the no-file ambient-config style of the rest of this crate.
    pub fn load() -> Result<Self, ConfigError> {
        let broker_url =
            std::env::var("MQTT_BROKER_URL").unwrap_or_else(|_| "tcp://localhost:1883".into());
        let topics = std::env::var("MQTT_TOPICS")
            .unwrap_or_else(|_| "devices/+/location".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        Ok(Self {
            mqtt: MqttConfig {
                broker_url,
                client_id: std::env::var("MQTT_CLIENT_ID")
                    .unwrap_or_else(|_| "geotrack-ingest".to_string()),
                username: env_opt("MQTT_USERNAME"),
                password: env_opt("MQTT_PASSWORD"),
                topics,
                keep_alive_secs: env_or("MQTT_KEEP_ALIVE_SECS", 45),
                connection_timeout_secs: env_or("MQTT_CONNECTION_TIMEOUT_SECS", 20),
                max_inflight: env_or("MQTT_MAX_INFLIGHT", 500),
                enabled: env_or("MQTT_ENABLED", true),
            },
            pool: PoolConfig {
                initial: env_or("POOL_INITIAL", 15),
                min: env_or("POOL_MIN", 10),
                max: env_or("POOL_MAX", 35),
                scale_up_threshold: env_or("POOL_SCALE_UP_THRESHOLD", 3),
                devices_per_conn: env_or("POOL_DEVICES_PER_CONN", 15),
                acquire_timeout_secs: env_or("POOL_ACQUIRE_TIMEOUT_SECS", 3),
                reconnect_cooldown_secs: env_or("POOL_RECONNECT_COOLDOWN_SECS", 30),
            },
            batch: BatchConfig {
                enqueue_buffer_size: env_or("BATCH_ENQUEUE_BUFFER_SIZE", 1000),
                worker_batch_size: env_or("BATCH_WORKER_BATCH_SIZE", 100),
                flush_interval_ms: env_or("BATCH_FLUSH_INTERVAL_MS", 500),
                max_wait_ms: env_or("BATCH_MAX_WAIT_MS", 5000),
                parallel_queues: env_or("BATCH_PARALLEL_THREADS", 4),
                overflow_capacity: env_or("BATCH_OVERFLOW_CAPACITY", 10_000),
            },
            cache: CacheConfig {
                max_size: env_or("CACHE_MAX_SIZE", 10_000),
                expire_after_write_mins: env_or("CACHE_EXPIRE_AFTER_WRITE_MINS", 60),
                expire_after_access_mins: env_or("CACHE_EXPIRE_AFTER_ACCESS_MINS", 30),
                location_expiry_mins: env_or("CACHE_LOCATION_EXPIRY_MINS", 10),
            },
            health: HealthConfig {
                check_interval_secs: env_or("HEALTH_CHECK_INTERVAL_SECS", 30),
                min_healthy_connections: env_or("HEALTH_MIN_CONNECTIONS", 3),
                max_connection_failure_rate: env_or("HEALTH_MAX_FAILURE_RATE", 0.10),
                memory_issue_pct: env_or("HEALTH_MEMORY_ISSUE_PCT", 85.0),
                memory_warning_pct: env_or("HEALTH_MEMORY_WARNING_PCT", 75.0),
                thread_warning_count: env_or("HEALTH_THREAD_WARNING_COUNT", 500),
                message_timeout_secs: env_or("HEALTH_MESSAGE_TIMEOUT_SECS", 300),
                invalid_message_rate_warning: env_or("HEALTH_INVALID_RATE_WARNING", 0.05),
                batch_queue_warning_size: env_or("HEALTH_BATCH_QUEUE_WARNING_SIZE", 1000),
                connection_success_rate_issue: env_or("HEALTH_CONN_SUCCESS_ISSUE", 0.95),
                connection_success_rate_warning: env_or("HEALTH_CONN_SUCCESS_WARNING", 0.98),
                avg_connect_time_warning_secs: env_or("HEALTH_AVG_CONNECT_WARNING_SECS", 5.0),
                min_active_devices_issue: env_or("HEALTH_MIN_ACTIVE_DEVICES_ISSUE", 0),
                min_active_devices_warning: env_or("HEALTH_MIN_ACTIVE_DEVICES_WARNING", 10),
                cb_failure_threshold: env_or("HEALTH_CB_FAILURE_THRESHOLD", 5),
                cb_timeout_secs: env_or("HEALTH_CB_TIMEOUT_SECS", 60),
                cb_half_open_max_calls: env_or("HEALTH_CB_HALF_OPEN_MAX_CALLS", 3),
                alert_rate_limit_secs: env_or("HEALTH_ALERT_RATE_LIMIT_SECS", 300),
            },
            processing: ProcessorConfig {
                speed_alert_threshold_kmh: env_or("PROCESSOR_SPEED_ALERT_KMH", 120.0),
                device_timeout_mins: env_or("PROCESSOR_DEVICE_TIMEOUT_MINS", 30),
                quiet_hours_start: env_or("PROCESSOR_QUIET_HOURS_START", 22),
                quiet_hours_end: env_or("PROCESSOR_QUIET_HOURS_END", 6),
            },
            database: DatabaseConfig {
                host: std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env_or("DB_PORT", 5432),
                database: std::env::var("DB_DATABASE").unwrap_or_else(|_| "geotrack".to_string()),
                username: std::env::var("DB_USERNAME").unwrap_or_else(|_| "user".to_string()),
                password: std::env::var("DB_PASSWORD").unwrap_or_else(|_| "pass".to_string()),
                max_connections: env_or("DB_MAX_CONNECTIONS", 20),
                min_connections: env_or("DB_MIN_CONNECTIONS", 5),
                connection_timeout_secs: env_or("DB_CONNECTION_TIMEOUT_SECS", 30),
                idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", 600),
            },
            logging: LoggingConfig {
                level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
                json_format: env_or("LOGGING_JSON_FORMAT", true),
            },
        })
    }

    pub fn database_url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.database.username,
            self.database.password,
            self.database.host,
            self.database.port,
            self.database.database
        )
    }

    /// Parses `broker_url` and checks scheme/host/port per §4.1's edge
    /// policy. Fatal on failure — callers should abort startup.
    pub fn parsed_broker_url(&self) -> anyhow::Result<url::Url> {
        let parsed = url::Url::parse(&self.mqtt.broker_url)?;
        let scheme_ok = matches!(parsed.scheme(), "tcp" | "ssl" | "ws" | "wss");
        if !scheme_ok {
            anyhow::bail!("unsupported MQTT broker scheme: {}", parsed.scheme());
        }
        if parsed.host_str().is_none() {
            anyhow::bail!("MQTT broker URL is missing a host");
        }
        match parsed.port() {
            Some(p) if p > 0 => {}
            _ => anyhow::bail!("MQTT broker URL must carry a positive port"),
        }
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mqtt.enabled {
            self.parsed_broker_url()?;
            if self.mqtt.topics.is_empty() {
                anyhow::bail!("at least one MQTT topic must be configured");
            }
            for topic in &self.mqtt.topics {
                validate_topic_filter(topic)?;
            }
        }

        if self.database.host.is_empty() {
            anyhow::bail!("database host must not be empty");
        }
        if self.database.database.is_empty() {
            anyhow::bail!("database name must not be empty");
        }

        if self.batch.worker_batch_size == 0 {
            anyhow::bail!("batch worker size must be greater than 0");
        }
        if self.batch.parallel_queues == 0 {
            anyhow::bail!("batch.parallel_queues must be greater than 0");
        }
        if self.pool.min > self.pool.max {
            anyhow::bail!("pool.min must not exceed pool.max");
        }

        Ok(())
    }

    pub fn default_dev() -> Self {
        Self {
            mqtt: MqttConfig {
                broker_url: "tcp://localhost:1883".to_string(),
                client_id: "geotrack-ingest-dev".to_string(),
                username: None,
                password: None,
                topics: vec!["devices/+/location".to_string()],
                keep_alive_secs: 45,
                connection_timeout_secs: 20,
                max_inflight: 500,
                enabled: true,
            },
            pool: PoolConfig {
                initial: 15,
                min: 10,
                max: 35,
                scale_up_threshold: 3,
                devices_per_conn: 15,
                acquire_timeout_secs: 3,
                reconnect_cooldown_secs: 30,
            },
            batch: BatchConfig {
                enqueue_buffer_size: 1000,
                worker_batch_size: 100,
                flush_interval_ms: 500,
                max_wait_ms: 5000,
                parallel_queues: 4,
                overflow_capacity: 10_000,
            },
            cache: CacheConfig {
                max_size: 10_000,
                expire_after_write_mins: 60,
                expire_after_access_mins: 30,
                location_expiry_mins: 10,
            },
            health: HealthConfig {
                check_interval_secs: 30,
                min_healthy_connections: 3,
                max_connection_failure_rate: 0.10,
                memory_issue_pct: 85.0,
                memory_warning_pct: 75.0,
                thread_warning_count: 500,
                message_timeout_secs: 300,
                invalid_message_rate_warning: 0.05,
                batch_queue_warning_size: 1000,
                connection_success_rate_issue: 0.95,
                connection_success_rate_warning: 0.98,
                avg_connect_time_warning_secs: 5.0,
                min_active_devices_issue: 0,
                min_active_devices_warning: 10,
                cb_failure_threshold: 5,
                cb_timeout_secs: 60,
                cb_half_open_max_calls: 3,
                alert_rate_limit_secs: 300,
            },
            processing: ProcessorConfig {
                speed_alert_threshold_kmh: 120.0,
                device_timeout_mins: 30,
                quiet_hours_start: 22,
                quiet_hours_end: 6,
            },
            database: DatabaseConfig {
                host: "localhost".to_string(),
                port: 5432,
                database: "geotrack".to_string(),
                username: "user".to_string(),
                password: "pass".to_string(),
                max_connections: 20,
                min_connections: 5,
                connection_timeout_secs: 30,
                idle_timeout_secs: 600,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json_format: true,
            },
        }
    }

    pub fn display_safe(&self) -> AppConfigSafe {
        AppConfigSafe {
            mqtt: MqttConfigSafe {
                broker_url: self.mqtt.broker_url.clone(),
                client_id: self.mqtt.client_id.clone(),
                topics: self.mqtt.topics.clone(),
                has_credentials: self.mqtt.username.is_some() && self.mqtt.password.is_some(),
            },
            database: DatabaseConfigSafe {
                host: self.database.host.clone(),
                port: self.database.port,
                database: self.database.database.clone(),
                max_connections: self.database.max_connections,
            },
            pool: self.pool.clone(),
            batch: self.batch.clone(),
        }
    }
}

/// `+` must not appear adjacent to another `+`, and `#` may only
/// terminate the filter (§6).
fn validate_topic_filter(topic: &str) -> anyhow::Result<()> {
    if topic.len() > 255 {
        anyhow::bail!("topic filter '{topic}' exceeds 255 bytes");
    }
    if topic.contains("++") {
        anyhow::bail!("topic filter '{topic}' contains adjacent '+' wildcards");
    }
    if let Some(pos) = topic.find('#') {
        if pos != topic.len() - 1 {
            anyhow::bail!("topic filter '{topic}' uses '#' somewhere other than the end");
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct AppConfigSafe {
    pub mqtt: MqttConfigSafe,
    pub database: DatabaseConfigSafe,
    pub pool: PoolConfig,
    pub batch: BatchConfig,
}

#[derive(Debug, Serialize)]
pub struct MqttConfigSafe {
    pub broker_url: String,
    pub client_id: String,
    pub topics: Vec<String>,
    pub has_credentials: bool,
}

#[derive(Debug, Serialize)]
pub struct DatabaseConfigSafe {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub max_connections: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dev_validates() {
        AppConfig::default_dev().validate().unwrap();
    }

    #[test]
    fn topic_filter_rejects_double_plus() {
        assert!(validate_topic_filter("devices/++/location").is_err());
    }

    #[test]
    fn topic_filter_rejects_hash_not_at_end() {
        assert!(validate_topic_filter("devices/#/location").is_err());
    }

    #[test]
    fn topic_filter_accepts_trailing_hash() {
        assert!(validate_topic_filter("devices/#").is_ok());
    }

    #[test]
    fn broker_url_requires_supported_scheme() {
        let mut cfg = AppConfig::default_dev();
        cfg.mqtt.broker_url = "http://localhost:1883".to_string();
        assert!(cfg.parsed_broker_url().is_err());
        cfg.mqtt.broker_url = "ssl://localhost:8883".to_string();
        assert!(cfg.parsed_broker_url().is_ok());
    }
}
