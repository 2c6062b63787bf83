use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use rumqttc::QoS;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::PoolConfig;
use crate::errors::{IngestError, Result};
use crate::metrics::{Counter, Gauge};

use super::connection_manager::ConnectionManager;
use super::session::{Session, SessionState};

const SLOW_PUBLISH_WARNING: Duration = Duration::from_secs(2);

/// Holds N MQTT sessions for outbound publish, scaling to sustained load
/// and recovering failed sessions in the background. Publish callers
/// never see a raw `Session` past `release`.
pub struct ConnectionPool {
    manager: Arc<ConnectionManager>,
    config: PoolConfig,
    sessions: RwLock<Vec<Arc<Session>>>,
    round_robin: AtomicUsize,
    reconnecting: DashMap<String, Instant>,
    /// Sessions currently handed out by `acquire` and not yet `release`d;
    /// keeps concurrent acquirers from sharing one session.
    checked_out: DashSet<String>,
    active_devices: Gauge,
    messages_per_sec: Gauge,
    pub acquired_total: Counter,
    pub acquire_timeouts: Counter,
    pub connect_failures: Counter,
    pub connect_successes: Counter,
    acquire_lock: Mutex<()>,
    poll_tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ConnectionPool {
    pub async fn new(manager: Arc<ConnectionManager>, config: PoolConfig) -> Result<Arc<Self>> {
        let pool = Arc::new(Self {
            manager,
            config,
            sessions: RwLock::new(Vec::new()),
            round_robin: AtomicUsize::new(0),
            reconnecting: DashMap::new(),
            checked_out: DashSet::new(),
            active_devices: Gauge::new(),
            messages_per_sec: Gauge::new(),
            acquired_total: Counter::new(),
            acquire_timeouts: Counter::new(),
            connect_failures: Counter::new(),
            connect_successes: Counter::new(),
            acquire_lock: Mutex::new(()),
            poll_tasks: std::sync::Mutex::new(Vec::new()),
        });
        let initial = pool.config.initial;
        pool.fill_to(initial).await;
        Ok(pool)
    }

    async fn fill_to(self: &Arc<Self>, target: usize) {
        let current = self.sessions.read().await.len();
        if current >= target {
            return;
        }
        let to_add = target - current;
        let mut joins = Vec::with_capacity(to_add);
        for _ in 0..to_add {
            let manager = self.manager.clone();
            joins.push(tokio::spawn(async move {
                let session = manager.create()?;
                let session = Arc::new(session);
                manager.connect(&session).await?;
                Ok::<_, IngestError>(session)
            }));
        }
        let mut new_sessions = Vec::with_capacity(to_add);
        for join in joins {
            match join.await {
                Ok(Ok(session)) => {
                    self.connect_successes.incr();
                    new_sessions.push(session);
                }
                Ok(Err(e)) => {
                    self.connect_failures.incr();
                    warn!(error = %e, "failed to establish pooled MQTT session");
                }
                Err(e) => {
                    self.connect_failures.incr();
                    warn!(error = %e, "session creation task panicked");
                }
            }
        }

        {
            let mut sessions = self.sessions.write().await;
            sessions.extend(new_sessions.iter().cloned());
        }
        for session in new_sessions {
            self.spawn_poll_task(session);
        }
    }

    /// Drives a pooled session's event loop, mirroring the dedicated
    /// ingest session's own poll loop — without this, queued publishes
    /// never actually leave the process. Exits (and hands the session to
    /// background reconnect) on the first I/O error or broker disconnect.
    async fn poll_session(self: Arc<Self>, session: Arc<Session>) {
        loop {
            let mut event_loop = session.event_loop.lock().await;
            let outcome = event_loop.poll().await;
            drop(event_loop);
            match outcome {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::Disconnect)) => {
                    session.set_state(SessionState::Disconnected);
                    self.release(session);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(client_id = %session.client_id, error = %e, "pooled session event loop error");
                    session.set_state(SessionState::Disconnected);
                    self.release(session);
                    return;
                }
            }
        }
    }

    fn spawn_poll_task(self: &Arc<Self>, session: Arc<Session>) {
        let pool = self.clone();
        let handle = tokio::spawn(async move {
            pool.poll_session(session).await;
        });
        self.poll_tasks
            .lock()
            .expect("poll tasks lock poisoned")
            .push(handle);
    }

    async fn available_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|s| s.is_connected())
            .count()
    }

    /// Prefers an available connected, not-checked-out session; grows the
    /// pool if under MAX; otherwise round-robins over connected,
    /// not-checked-out sessions; fails after `ACQUIRE_TIMEOUT` with a
    /// pool-exhausted error.
    pub async fn acquire(self: &Arc<Self>) -> Result<Arc<Session>> {
        let timeout = Duration::from_secs(self.config.acquire_timeout_secs);
        let deadline = Instant::now() + timeout;

        loop {
            // Serialize pool-growth decisions so concurrent acquirers
            // don't race past MAX.
            let _guard = self.acquire_lock.lock().await;
            {
                let sessions = self.sessions.read().await;
                if let Some(session) = sessions
                    .iter()
                    .find(|s| s.is_connected() && !self.checked_out.contains(&s.client_id))
                {
                    self.checked_out.insert(session.client_id.clone());
                    self.acquired_total.incr();
                    return Ok(session.clone());
                }
            }

            let total = self.sessions.read().await.len();
            if total < self.config.max {
                drop(_guard);
                self.fill_to(total + 1).await;
            } else {
                drop(_guard);
                let sessions = self.sessions.read().await;
                let available: Vec<Arc<Session>> = sessions
                    .iter()
                    .filter(|s| s.is_connected() && !self.checked_out.contains(&s.client_id))
                    .cloned()
                    .collect();
                drop(sessions);
                if !available.is_empty() {
                    let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % available.len();
                    let session = available[idx].clone();
                    self.checked_out.insert(session.client_id.clone());
                    self.acquired_total.incr();
                    return Ok(session);
                }
            }

            if Instant::now() >= deadline {
                self.acquire_timeouts.incr();
                return Err(IngestError::PoolExhausted(format!(
                    "no connected session available after {timeout:?}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Releases a checked-out session back to the pool. If it's no
    /// longer connected, schedules a background reconnect under the
    /// cooldown instead of returning it to circulation.
    pub fn release(self: &Arc<Self>, session: Arc<Session>) {
        self.checked_out.remove(&session.client_id);
        if session.is_connected() {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            pool.schedule_reconnect(session).await;
        });
    }

    async fn schedule_reconnect(self: &Arc<Self>, session: Arc<Session>) {
        let cooldown = Duration::from_secs(self.config.reconnect_cooldown_secs);
        if let Some(last) = self.reconnecting.get(&session.client_id) {
            if last.elapsed() < cooldown {
                return;
            }
        }
        self.reconnecting
            .insert(session.client_id.clone(), Instant::now());
        session.set_state(SessionState::Disconnected);
        if let Err(e) = self.manager.connect(&session).await {
            warn!(client_id = %session.client_id, error = %e, "background reconnect failed");
        } else {
            info!(client_id = %session.client_id, "background reconnect succeeded");
            self.spawn_poll_task(session);
        }
    }

    /// Acquires a session, publishes at QoS 1 non-retained, then
    /// releases. Logs a warning if the publish itself is slow.
    pub async fn publish(self: &Arc<Self>, topic: &str, payload: bytes::Bytes) -> Result<()> {
        let session = self.acquire().await?;
        let start = Instant::now();
        let result = session
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(IngestError::Mqtt);
        let elapsed = start.elapsed();
        if elapsed > SLOW_PUBLISH_WARNING {
            warn!(%topic, ?elapsed, "slow MQTT publish");
        }
        session.touch().await;
        self.release(session);
        result
    }

    /// Scale-up decision per §4.2: any of {available<3, active_devices
    /// over 70% of device capacity, high throughput with low headroom,
    /// active/total ratio>0.8}.
    pub async fn should_scale_up(&self) -> bool {
        let sessions = self.sessions.read().await;
        let total = sessions.len();
        if total == 0 {
            return true;
        }
        let available = sessions.iter().filter(|s| s.is_connected()).count();
        drop(sessions);

        let device_capacity = total * self.config.devices_per_conn;
        let active_devices = self.active_devices.get().max(0) as usize;
        let msgs_per_sec = self.messages_per_sec.get().max(0) as usize;

        available < self.config.scale_up_threshold
            || (device_capacity > 0 && active_devices as f64 > device_capacity as f64 * 0.7)
            || (msgs_per_sec > 100 && available < 5)
            || (total > 0 && (total - available) as f64 / total as f64 > 0.8)
    }

    /// Runs once per scaling tick (every 60s in production); adds up to
    /// 3 sessions when scale-up conditions hold and the pool is below
    /// MAX.
    pub async fn scale_tick(self: &Arc<Self>) {
        if !self.should_scale_up().await {
            return;
        }
        let total = self.sessions.read().await.len();
        if total >= self.config.max {
            return;
        }
        let target = (total + 3).min(self.config.max);
        info!(from = total, to = target, "scaling MQTT connection pool up");
        self.fill_to(target).await;
    }

    /// Marks disconnected sessions for background reconnect without
    /// dropping their slot in the pool.
    pub async fn health_tick(self: &Arc<Self>) {
        let sessions = self.sessions.read().await.clone();
        for session in sessions {
            if !session.is_connected() {
                self.release(session);
            }
        }
    }

    pub fn record_active_devices(&self, count: usize) {
        self.active_devices.set(count as i64);
    }

    pub fn record_throughput(&self, msgs_per_sec: usize) {
        self.messages_per_sec.set(msgs_per_sec as i64);
    }

    pub async fn total(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn available(&self) -> usize {
        self.available_count().await
    }

    /// Connection success rate over the lifetime of the pool, used by
    /// the health monitor.
    pub fn success_rate(&self) -> f64 {
        let total = self.connect_successes.get() + self.connect_failures.get();
        if total == 0 {
            1.0
        } else {
            self.connect_successes.get() as f64 / total as f64
        }
    }

    /// Disconnects every held session with a per-session timeout, aborts
    /// the per-session poll tasks, and releases resources even on
    /// partial failure.
    pub async fn shutdown(&self, per_session_timeout: Duration) {
        let sessions = self.sessions.write().await;
        for session in sessions.iter() {
            if let Err(e) = self.manager.disconnect(session, per_session_timeout).await {
                warn!(client_id = %session.client_id, error = %e, "error disconnecting session during shutdown");
            }
        }
        drop(sessions);

        let handles = std::mem::take(&mut *self.poll_tasks.lock().expect("poll tasks lock poisoned"));
        for handle in handles {
            handle.abort();
        }
    }
}
