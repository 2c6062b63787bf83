use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    MqttConnection(#[from] rumqttc::ConnectionError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Circuit breaker open, rejecting call")]
    CircuitOpen,

    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    pub fn processing(msg: impl Into<String>) -> Self {
        Self::Processing(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// A connection attempt was actively rejected by the broker for a
    /// reason that will not change on retry (bad client id, bad
    /// credentials) — distinct from `Connection`, which covers transient
    /// transport/DNS failures.
    pub fn connection_rejected(msg: impl Into<String>) -> Self {
        Self::ConnectionRejected(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Whether a caller may retry this condition (§7: transient store
    /// errors and transport errors are retryable, input/lookup errors
    /// are not).
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) | Self::Mqtt(_) | Self::MqttConnection(_) => {
                true
            }
            Self::ConnectionRejected(_) => false,
            Self::Database(sqlx::Error::PoolTimedOut) => true,
            Self::Database(sqlx::Error::Io(_)) => true,
            Self::PoolExhausted(_) => true,
            _ => false,
        }
    }

    /// Suggested backoff before a retry, based on the error kind.
    pub fn retry_delay(&self) -> std::time::Duration {
        match self {
            Self::Connection(_) => std::time::Duration::from_secs(5),
            Self::Timeout(_) => std::time::Duration::from_secs(2),
            Self::Mqtt(_) | Self::MqttConnection(_) => std::time::Duration::from_secs(3),
            Self::Database(_) => std::time::Duration::from_secs(1),
            Self::PoolExhausted(_) => std::time::Duration::from_millis(500),
            _ => std::time::Duration::from_secs(1),
        }
    }
}
