use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use sysinfo::System;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::HealthConfig;
use crate::models::{AlertEvent, AlertLevel};
use crate::mqtt::ConnectionPool;
use crate::persist::BatchPersister;

use super::circuit_breaker::CircuitBreaker;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SubsystemHealth {
    pub available: bool,
    pub healthy: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub metrics: HashMap<String, f64>,
}

impl SubsystemHealth {
    fn ok() -> Self {
        Self {
            available: true,
            healthy: true,
            ..Default::default()
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Periodic end-to-end health assessment (every 30s by default) and the
/// automatic failsafe built on top of a `CircuitBreaker`. Produces
/// rate-limited alerts and triggers advisory recovery actions.
pub struct HealthMonitor {
    config: HealthConfig,
    pool: Arc<ConnectionPool>,
    persister: Arc<BatchPersister>,
    pub circuit_breaker: CircuitBreaker,
    last_message_at: AtomicU64,
    active_device_count: AtomicI64,
    invalid_message_count: AtomicU64,
    total_message_count: AtomicU64,
    sys: Mutex<System>,
    last_alert_at: DashMap<String, std::time::Instant>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, pool: Arc<ConnectionPool>, persister: Arc<BatchPersister>) -> Self {
        let circuit_breaker = CircuitBreaker::new(
            config.cb_failure_threshold,
            Duration::from_secs(config.cb_timeout_secs),
            config.cb_half_open_max_calls,
        );
        Self {
            config,
            pool,
            persister,
            circuit_breaker,
            last_message_at: AtomicU64::new(now_millis()),
            active_device_count: AtomicI64::new(0),
            invalid_message_count: AtomicU64::new(0),
            total_message_count: AtomicU64::new(0),
            sys: Mutex::new(System::new()),
            last_alert_at: DashMap::new(),
        }
    }

    pub fn record_message_received(&self, valid: bool) {
        self.last_message_at.store(now_millis(), Ordering::Release);
        self.total_message_count.fetch_add(1, Ordering::Relaxed);
        if !valid {
            self.invalid_message_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_active_devices(&self, count: i64) {
        self.active_device_count.store(count, Ordering::Relaxed);
    }

    /// Runs one assessment cycle. Returns `None` when the circuit breaker
    /// is OPEN and this cycle was skipped entirely (P5).
    pub async fn run_once(&self) -> Option<Vec<AlertEvent>> {
        if !self.circuit_breaker.allow_check() {
            return None;
        }

        let pool_health = self.assess_pool().await;
        let memory_health = self.assess_memory().await;
        let message_health = self.assess_messages();
        let queue_health = self.assess_queue();
        let device_health = self.assess_devices();

        let overall_healthy = [&pool_health, &memory_health, &message_health, &queue_health, &device_health]
            .iter()
            .all(|s| s.healthy);

        if overall_healthy {
            self.circuit_breaker.record_success();
        } else {
            self.circuit_breaker.record_failure();
        }

        let mut alerts = Vec::new();
        for subsystem in [&pool_health, &memory_health, &message_health, &queue_health, &device_health] {
            for issue in &subsystem.issues {
                if let Some(alert) = self.rate_limited_alert(AlertLevel::Critical, issue) {
                    alerts.push(alert);
                }
            }
            for warning in &subsystem.warnings {
                if let Some(alert) = self.rate_limited_alert(AlertLevel::Warn, warning) {
                    alerts.push(alert);
                }
            }
        }

        if !overall_healthy {
            self.trigger_recovery_actions().await;
        }

        Some(alerts)
    }

    fn rate_limited_alert(&self, level: AlertLevel, message: &str) -> Option<AlertEvent> {
        let key = format!("{message:?}:{level:?}");
        let window = Duration::from_secs(self.config.alert_rate_limit_secs);
        if let Some(last) = self.last_alert_at.get(&key) {
            if last.elapsed() < window {
                return None;
            }
        }
        self.last_alert_at.insert(key, std::time::Instant::now());
        Some(match level {
            AlertLevel::Critical => AlertEvent::critical("health", message),
            AlertLevel::Warn => AlertEvent::warn("health", message),
            AlertLevel::Info => AlertEvent::info("health", message),
        })
    }

    async fn assess_pool(&self) -> SubsystemHealth {
        let mut health = SubsystemHealth::ok();
        let available = self.pool.available().await;
        let total = self.pool.total().await;
        let success_rate = self.pool.success_rate();

        health.metrics.insert("available".into(), available as f64);
        health.metrics.insert("total".into(), total as f64);
        health.metrics.insert("success_rate".into(), success_rate);

        if available < self.config.min_healthy_connections {
            health.healthy = false;
            health
                .issues
                .push(format!("only {available} healthy MQTT connections, need >= {}", self.config.min_healthy_connections));
        }
        if success_rate < self.config.connection_success_rate_issue {
            health.healthy = false;
            health.issues.push(format!("connection success rate {success_rate:.2} below issue threshold"));
        } else if success_rate < self.config.connection_success_rate_warning {
            health.warnings.push(format!("connection success rate {success_rate:.2} below warning threshold"));
        }
        health.available = total > 0;
        health
    }

    async fn assess_memory(&self) -> SubsystemHealth {
        let mut health = SubsystemHealth::ok();
        let mut sys = self.sys.lock().await;
        sys.refresh_memory();

        let total = sys.total_memory().max(1);
        let used = sys.used_memory();
        let pct = used as f64 / total as f64 * 100.0;
        // sysinfo reports OS-level process/thread counts, not a precise
        // per-process thread tally; treated as an advisory proxy.
        let process_count = sysinfo::System::new_all().processes().len();

        health.metrics.insert("memory_pct".into(), pct);
        health.metrics.insert("os_process_count".into(), process_count as f64);

        if pct > self.config.memory_issue_pct {
            health.healthy = false;
            health.issues.push(format!("memory usage {pct:.1}% above issue threshold"));
        } else if pct > self.config.memory_warning_pct {
            health.warnings.push(format!("memory usage {pct:.1}% above warning threshold"));
        }
        if process_count > self.config.thread_warning_count {
            health.warnings.push(format!("OS process count {process_count} above warning threshold"));
        }
        health
    }

    fn assess_messages(&self) -> SubsystemHealth {
        let mut health = SubsystemHealth::ok();
        let elapsed_ms = now_millis().saturating_sub(self.last_message_at.load(Ordering::Acquire));
        let elapsed = Duration::from_millis(elapsed_ms);
        health.metrics.insert("seconds_since_last_message".into(), elapsed.as_secs_f64());

        if elapsed > Duration::from_secs(self.config.message_timeout_secs) {
            health.healthy = false;
            health.issues.push(format!("no message received for {:?}", elapsed));
        }

        let total = self.total_message_count.load(Ordering::Relaxed);
        let invalid = self.invalid_message_count.load(Ordering::Relaxed);
        if total > 0 {
            let rate = invalid as f64 / total as f64;
            health.metrics.insert("invalid_rate".into(), rate);
            if rate > self.config.invalid_message_rate_warning {
                health.warnings.push(format!("invalid message rate {rate:.2} above warning threshold"));
            }
        }
        health
    }

    fn assess_queue(&self) -> SubsystemHealth {
        let mut health = SubsystemHealth::ok();
        let enqueued = self.persister.enqueued.get();
        let flushed = self.persister.flushed.get();
        let pending = enqueued.saturating_sub(flushed * 1);
        health.metrics.insert("rejected_total".into(), self.persister.rejected.get() as f64);
        if (pending as usize) > self.config.batch_queue_warning_size {
            health.warnings.push(format!("batch queue backlog ~{pending} above warning threshold"));
        }
        health
    }

    fn assess_devices(&self) -> SubsystemHealth {
        let mut health = SubsystemHealth::ok();
        let active = self.active_device_count.load(Ordering::Relaxed).max(0) as usize;
        health.metrics.insert("active_devices".into(), active as f64);

        if active <= self.config.min_active_devices_issue {
            health.healthy = false;
            health.issues.push("no active devices reporting".to_string());
        } else if active < self.config.min_active_devices_warning {
            health.warnings.push(format!("only {active} active devices"));
        }
        health
    }

    /// Advisory recovery on an unhealthy result: nudge the pool to sweep
    /// for dead sessions now rather than waiting for its own tick.
    async fn trigger_recovery_actions(&self) {
        warn!("health check unhealthy, triggering pool health sweep");
        self.pool.health_tick().await;
        info!("advisory: consider releasing idle caches under memory pressure");
    }
}
