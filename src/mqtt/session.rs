use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rumqttc::{AsyncClient, EventLoop};
use tokio::sync::Mutex;

/// Lifecycle of one MQTT session, owned exclusively by a `ConnectionPool`
/// slot at any moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninit,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

impl SessionState {
    fn from_tag(tag: u8) -> Self {
        match tag {
            0 => SessionState::Uninit,
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Disconnected,
            _ => SessionState::Closed,
        }
    }

    fn tag(self) -> u8 {
        match self {
            SessionState::Uninit => 0,
            SessionState::Connecting => 1,
            SessionState::Connected => 2,
            SessionState::Disconnected => 3,
            SessionState::Closed => 4,
        }
    }
}

/// One live MQTT client connection. The event loop is driven by a
/// dedicated background task spawned at `connect` time; publishers only
/// ever touch `client`.
pub struct Session {
    pub client_id: String,
    pub client: AsyncClient,
    pub event_loop: Arc<Mutex<EventLoop>>,
    state: AtomicU8,
    pub created_at: Instant,
    pub last_activity: Arc<Mutex<Instant>>,
}

impl Session {
    pub fn new(client_id: String, client: AsyncClient, event_loop: EventLoop) -> Self {
        let now = Instant::now();
        Self {
            client_id,
            client,
            event_loop: Arc::new(Mutex::new(event_loop)),
            state: AtomicU8::new(SessionState::Uninit.tag()),
            created_at: now,
            last_activity: Arc::new(Mutex::new(now)),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_tag(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state.tag(), Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish()
    }
}
