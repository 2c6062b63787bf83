use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertLevel {
    Info,
    Warn,
    Critical,
}

/// Emitted by HealthMonitor and Processor; consumed by an out-of-scope
/// alert sink (email/SMS transport is not implemented here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub level: AlertLevel,
    pub category: String,
    pub message: String,
    pub first_detected: DateTime<Utc>,
    pub metric: Option<String>,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
}

impl AlertEvent {
    pub fn info(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: AlertLevel::Info,
            category: category.into(),
            message: message.into(),
            first_detected: Utc::now(),
            metric: None,
            value: None,
            threshold: None,
        }
    }

    pub fn warn(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: AlertLevel::Warn,
            category: category.into(),
            message: message.into(),
            first_detected: Utc::now(),
            metric: None,
            value: None,
            threshold: None,
        }
    }

    pub fn critical(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: AlertLevel::Critical,
            category: category.into(),
            message: message.into(),
            first_detected: Utc::now(),
            metric: None,
            value: None,
            threshold: None,
        }
    }

    pub fn with_metric(mut self, metric: impl Into<String>, value: f64, threshold: f64) -> Self {
        self.metric = Some(metric.into());
        self.value = Some(value);
        self.threshold = Some(threshold);
        self
    }

    /// Key used for the one-alert-per-(AlertType)-per-5-minutes rate limit.
    pub fn rate_limit_key(&self) -> String {
        format!("{}:{}", self.category, self.level_tag())
    }

    fn level_tag(&self) -> &'static str {
        match self.level {
            AlertLevel::Info => "info",
            AlertLevel::Warn => "warn",
            AlertLevel::Critical => "critical",
        }
    }
}
