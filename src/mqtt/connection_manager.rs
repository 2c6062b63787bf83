use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rumqttc::{AsyncClient, ConnectionError, Event, MqttOptions, Packet, QoS};
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::errors::{IngestError, Result};

use super::session::{Session, SessionState};

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(32);
const BACKOFF_MULTIPLIER: u32 = 2;
const JITTER_FACTOR: f64 = 0.10;

/// Creates and maintains one MQTT session at a time, owning the
/// connect/subscribe/disconnect handshake. A `ConnectionPool` holds many
/// of these to satisfy concurrent publish load.
pub struct ConnectionManager {
    config: MqttConfig,
    sequence: AtomicU32,
}

impl ConnectionManager {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            sequence: AtomicU32::new(0),
        }
    }

    /// Builds a session with a unique clientId and memory-only
    /// persistence. Does not connect yet — call `connect`.
    pub fn create(&self) -> Result<Session> {
        let parsed = self.parsed_broker()?;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let client_id = format!(
            "{}-{}-{:x}-{}",
            self.config.client_id,
            chrono::Utc::now().timestamp_millis(),
            rand::thread_rng().gen::<u32>(),
            seq
        );

        let host = parsed.host_str().unwrap_or("localhost").to_string();
        let port = parsed.port().unwrap_or(1883);
        let mut options = MqttOptions::new(client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs));
        options.set_clean_session(true);
        options.set_connection_timeout(self.config.connection_timeout_secs);
        options.set_inflight(self.config.max_inflight);

        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user, pass);
        }

        let (client, event_loop) = AsyncClient::new(options, self.config.max_inflight as usize);
        Ok(Session::new(client_id, client, event_loop))
    }

    fn parsed_broker(&self) -> Result<url::Url> {
        let parsed = url::Url::parse(&self.config.broker_url)
            .map_err(|e| IngestError::connection(format!("invalid broker URL: {e}")))?;
        if !matches!(parsed.scheme(), "tcp" | "ssl" | "ws" | "wss") {
            return Err(IngestError::connection(format!(
                "unsupported MQTT scheme: {}",
                parsed.scheme()
            )));
        }
        if parsed.host_str().is_none() || parsed.port().unwrap_or(0) == 0 {
            return Err(IngestError::connection(
                "broker URL must carry a host and positive port",
            ));
        }
        Ok(parsed)
    }

    /// Drives the session's event loop until CONNECTED or all attempts
    /// are exhausted, with exponential backoff and jitter between tries.
    /// Non-retryable failures (bad credentials, unsupported protocol)
    /// surface immediately.
    pub async fn connect(&self, session: &Arc<Session>) -> Result<()> {
        session.set_state(SessionState::Connecting);

        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_connect_once(session).await {
                Ok(()) => {
                    session.set_state(SessionState::Connected);
                    if !self.config.topics.is_empty() {
                        self.subscribe(session, &self.config.topics).await?;
                    }
                    return Ok(());
                }
                Err(e) if !e.is_recoverable() => {
                    session.set_state(SessionState::Closed);
                    error!(client_id = %session.client_id, error = %e, "non-retryable MQTT connect failure");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        client_id = %session.client_id,
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        error = %e,
                        "MQTT connect attempt failed, backing off"
                    );
                    if attempt == MAX_ATTEMPTS {
                        session.set_state(SessionState::Closed);
                        return Err(e);
                    }
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }

        session.set_state(SessionState::Closed);
        Err(IngestError::connection("exhausted connect attempts"))
    }

    async fn try_connect_once(&self, session: &Arc<Session>) -> Result<()> {
        let mut event_loop = session.event_loop.lock().await;
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    use rumqttc::ConnectReturnCode::*;
                    return match ack.code {
                        Success => {
                            info!(client_id = %session.client_id, "MQTT session connected");
                            Ok(())
                        }
                        BadClientId | NotAuthorized | BadUserNamePassword => {
                            Err(IngestError::connection_rejected(format!(
                                "non-retryable connect rejection: {:?}",
                                ack.code
                            )))
                        }
                        other => Err(IngestError::connection(format!(
                            "connect rejected: {other:?}"
                        ))),
                    };
                }
                Ok(_) => continue,
                Err(ConnectionError::MqttState(_)) | Err(ConnectionError::Io(_)) => {
                    return Err(IngestError::connection("transport error during connect"));
                }
                Err(e) => {
                    debug!(error = %e, "connect poll error");
                    return Err(IngestError::MqttConnection(e));
                }
            }
        }
    }

    /// Subscribes at QoS 1; requires the session to already be connected.
    pub async fn subscribe(&self, session: &Session, topics: &[String]) -> Result<()> {
        if !session.is_connected() {
            return Err(IngestError::connection(
                "cannot subscribe: session is not connected",
            ));
        }
        for topic in topics {
            session
                .client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(IngestError::Mqtt)?;
            debug!(client_id = %session.client_id, %topic, "subscribed");
        }
        Ok(())
    }

    /// Idempotent disconnect with a bounded wait; resources are released
    /// even if the broker round-trip errors or times out.
    pub async fn disconnect(&self, session: &Session, timeout: Duration) -> Result<()> {
        if session.state() == SessionState::Closed {
            return Ok(());
        }
        let result = tokio::time::timeout(timeout, session.client.disconnect()).await;
        session.set_state(SessionState::Closed);
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(client_id = %session.client_id, error = %e, "disconnect returned an error, releasing anyway");
                Ok(())
            }
            Err(_) => {
                warn!(client_id = %session.client_id, "disconnect timed out, releasing anyway");
                Ok(())
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_MULTIPLIER.saturating_pow(attempt.saturating_sub(1));
    let base = (INITIAL_BACKOFF * exp).min(MAX_BACKOFF);
    let jitter_range = base.as_secs_f64() * JITTER_FACTOR;
    let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    let secs = (base.as_secs_f64() + jitter).max(0.0);
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_max_by_more_than_jitter() {
        for attempt in 1..=MAX_ATTEMPTS {
            let delay = backoff_delay(attempt);
            assert!(delay <= MAX_BACKOFF + MAX_BACKOFF.mul_f64(JITTER_FACTOR));
        }
    }

    #[test]
    fn backoff_grows_with_attempt_number() {
        assert!(backoff_delay(1).as_secs_f64() <= backoff_delay(3).as_secs_f64() + 1.0);
    }
}
