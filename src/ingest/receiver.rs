use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::metrics::Counter;
use crate::models::DeviceReport;
use crate::processor::Processor;

use super::transformer::Transformer;

const BATCH_SIZE: usize = 100;
const MAX_BATCH_WAIT: Duration = Duration::from_secs(2);
const DEVICE_INACTIVITY_EVICTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ReceivedReport {
    pub report: DeviceReport,
    pub topic: String,
}

#[derive(Debug)]
pub enum DecodedPayload {
    Single(DeviceReport),
    Batch(Vec<DeviceReport>),
}

struct DeviceTrackingEntry {
    first_seen: Instant,
    last_seen: Instant,
    message_count: u64,
}

/// Inbound path from subscribed MQTT topics into the `Processor`.
/// Decodes JSON/CSV/hex payloads, extracts a `deviceId`, and buffers
/// decoded reports into one MPMC queue that flushes by size or age.
pub struct MessageReceiver {
    queue_tx: mpsc::Sender<DeviceReport>,
    device_tracking: DashMap<String, DeviceTrackingEntry>,
    pub hex_conversions: Counter,
    pub decode_errors: Counter,
}

impl MessageReceiver {
    pub fn new(processor: Arc<Processor>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(BATCH_SIZE * 4);
        let receiver = Arc::new(Self {
            queue_tx: tx,
            device_tracking: DashMap::new(),
            hex_conversions: Counter::new(),
            decode_errors: Counter::new(),
        });

        tokio::spawn(flush_loop(rx, processor));

        let tracking = receiver.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                interval.tick().await;
                tracking.evict_inactive_devices();
            }
        });

        receiver
    }

    /// Decodes one inbound message and enqueues its report(s) for
    /// batched processing. Returns an error string (never panics) for
    /// malformed payloads; the caller counts these as dropped.
    pub async fn ingest(&self, topic: &str, payload: &[u8]) -> Result<(), String> {
        if payload.is_empty() {
            return Err("empty payload".to_string());
        }

        let text = String::from_utf8_lossy(payload).to_string();
        let decoded = self.decode(topic, &text)?;

        match decoded {
            DecodedPayload::Single(report) => self.track_and_enqueue(report).await,
            DecodedPayload::Batch(reports) => {
                for report in reports {
                    self.track_and_enqueue(report).await;
                }
            }
        }
        Ok(())
    }

    fn decode(&self, topic: &str, raw: &str) -> Result<DecodedPayload, String> {
        let cleaned = Transformer::clean_payload(raw);
        if cleaned.is_empty() {
            return Err("empty after cleaning".to_string());
        }

        let candidate = if let Some(ascii) = Transformer::hex_to_ascii(&cleaned) {
            self.hex_conversions.incr();
            ascii
        } else {
            cleaned
        };

        if let Ok(mut report) = serde_json::from_str::<DeviceReport>(&candidate) {
            self.apply_topic_device_id(&mut report, topic);
            report.received_at = Some(chrono::Utc::now());
            return Ok(DecodedPayload::Single(report));
        }

        if let Ok(mut reports) = serde_json::from_str::<Vec<DeviceReport>>(&candidate) {
            let now = chrono::Utc::now();
            for report in reports.iter_mut() {
                self.apply_topic_device_id(report, topic);
                report.received_at = Some(now);
            }
            return Ok(DecodedPayload::Batch(reports));
        }

        if let Some(mut report) = DeviceReport::from_csv(&candidate) {
            self.apply_topic_device_id(&mut report, topic);
            report.received_at = Some(chrono::Utc::now());
            return Ok(DecodedPayload::Single(report));
        }

        self.decode_errors.incr();
        Err(format!("unrecognized payload format on topic '{topic}'"))
    }

    /// `deviceId` comes from the JSON field first, else a `/device/{id}/`
    /// topic segment, else the sanitized topic string.
    fn apply_topic_device_id(&self, report: &mut DeviceReport, topic: &str) {
        if !report.device_id.trim().is_empty() {
            return;
        }
        if let Some(from_topic) = extract_device_segment(topic) {
            report.device_id = from_topic;
        } else {
            report.device_id = sanitize_topic(topic);
        }
    }

    async fn track_and_enqueue(&self, report: DeviceReport) {
        self.track_device(&report.device_id);
        if self.queue_tx.send(report).await.is_err() {
            debug!("message receiver queue closed, dropping report");
        }
    }

    fn track_device(&self, device_id: &str) {
        let now = Instant::now();
        let mut is_new = false;
        self.device_tracking
            .entry(device_id.to_string())
            .and_modify(|entry| {
                entry.last_seen = now;
                entry.message_count += 1;
            })
            .or_insert_with(|| {
                is_new = true;
                DeviceTrackingEntry {
                    first_seen: now,
                    last_seen: now,
                    message_count: 1,
                }
            });
        if is_new {
            info!(device_id, "new device observed");
        }
    }

    fn evict_inactive_devices(&self) {
        let before = self.device_tracking.len();
        self.device_tracking
            .retain(|_, entry| entry.last_seen.elapsed() < DEVICE_INACTIVITY_EVICTION);
        let evicted = before - self.device_tracking.len();
        if evicted > 0 {
            info!(evicted, "evicted inactive devices from tracking map");
        }
    }

    pub fn active_device_count(&self) -> usize {
        self.device_tracking.len()
    }
}

fn extract_device_segment(topic: &str) -> Option<String> {
    let segments: Vec<&str> = topic.split('/').collect();
    segments
        .iter()
        .position(|s| *s == "device")
        .and_then(|idx| segments.get(idx + 1))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn sanitize_topic(topic: &str) -> String {
    topic
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

async fn flush_loop(mut rx: mpsc::Receiver<DeviceReport>, processor: Arc<Processor>) {
    let mut batch = Vec::with_capacity(BATCH_SIZE);
    let mut oldest: Option<Instant> = None;

    loop {
        let wait = match oldest {
            Some(first) => MAX_BATCH_WAIT.saturating_sub(first.elapsed()),
            None => MAX_BATCH_WAIT,
        };

        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(report)) => {
                if oldest.is_none() {
                    oldest = Some(Instant::now());
                }
                batch.push(report);
                if batch.len() >= BATCH_SIZE {
                    flush(&processor, &mut batch).await;
                    oldest = None;
                }
            }
            Ok(None) => {
                if !batch.is_empty() {
                    flush(&processor, &mut batch).await;
                }
                return;
            }
            Err(_) => {
                if !batch.is_empty() {
                    flush(&processor, &mut batch).await;
                    oldest = None;
                }
            }
        }
    }
}

async fn flush(processor: &Arc<Processor>, batch: &mut Vec<DeviceReport>) {
    let reports = std::mem::take(batch);
    let result = processor.process_batch(reports).await;
    debug!(total = result.total, ok = result.ok, failed = result.failed, "receiver batch flushed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_device_id_from_topic_segment() {
        assert_eq!(
            extract_device_segment("devices/device/ABC123/location"),
            Some("ABC123".to_string())
        );
        assert_eq!(extract_device_segment("devices/+/location"), None);
    }

    #[test]
    fn sanitizes_topic_for_fallback_device_id() {
        assert_eq!(sanitize_topic("devices/D-1/loc"), "devices_D_1_loc");
    }
}
