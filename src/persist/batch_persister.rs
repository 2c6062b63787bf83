use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::BatchConfig;
use crate::metrics::Counter;
use crate::models::HistoryRecord;

use super::database::DatabaseService;

const PRIMARY_OFFER_TIMEOUT: Duration = Duration::from_millis(10);

fn hash_device_id(device_id: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    device_id.hash(&mut hasher);
    hasher.finish()
}

/// Durable, high-throughput writer for `HistoryRecord`s. Routes records
/// across `P` bounded queues by `hash(deviceId) mod P` so per-device
/// FIFO holds within a queue without a single global lock; an overflow
/// queue absorbs records that can't land in their primary queue.
struct Queues {
    primary: Vec<mpsc::Sender<HistoryRecord>>,
    overflow: mpsc::Sender<HistoryRecord>,
}

pub struct BatchPersister {
    /// Holds the only live `Sender` clones; `shutdown` takes this to
    /// actually drop them so workers observe channel closure and exit.
    queues: std::sync::Mutex<Option<Queues>>,
    accepting: AtomicBool,
    pub enqueued: Counter,
    pub rejected: Counter,
    pub flushed: Counter,
    pub saved: Counter,
    pub failed: Counter,
    workers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl BatchPersister {
    pub fn spawn(db: Arc<DatabaseService>, config: BatchConfig) -> Arc<Self> {
        let capacity = config.worker_batch_size * 2;
        let mut queues = Vec::with_capacity(config.parallel_queues);
        let mut receivers = Vec::with_capacity(config.parallel_queues);
        for _ in 0..config.parallel_queues {
            let (tx, rx) = mpsc::channel(capacity);
            queues.push(tx);
            receivers.push(rx);
        }
        let (overflow_tx, overflow_rx) = mpsc::channel(config.overflow_capacity);

        let persister = Arc::new(Self {
            queues: std::sync::Mutex::new(Some(Queues {
                primary: queues,
                overflow: overflow_tx,
            })),
            accepting: AtomicBool::new(true),
            enqueued: Counter::new(),
            rejected: Counter::new(),
            flushed: Counter::new(),
            saved: Counter::new(),
            failed: Counter::new(),
            workers: std::sync::Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(config.parallel_queues + 1);
        for (idx, rx) in receivers.into_iter().enumerate() {
            let db = db.clone();
            let config = config.clone();
            let persister = persister.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(idx, rx, db, config, persister).await;
            }));
        }
        {
            let db = db.clone();
            let config = config.clone();
            let persister = persister.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(usize::MAX, overflow_rx, db, config, persister).await;
            }));
        }

        *persister.workers.lock().expect("workers lock poisoned") = handles;

        persister
    }

    /// Offers a record to its primary queue (10ms timeout); on failure,
    /// tries the overflow queue non-blocking. Returns `false` (and bumps
    /// `rejected`) only when both are full — the caller's back-pressure
    /// signal.
    pub async fn enqueue(&self, record: HistoryRecord) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            self.rejected.incr();
            return false;
        }

        let (primary, overflow) = {
            let guard = self.queues.lock().expect("queues lock poisoned");
            match guard.as_ref() {
                Some(q) => {
                    let idx = (hash_device_id(&record.device_id) as usize) % q.primary.len();
                    (q.primary[idx].clone(), q.overflow.clone())
                }
                None => {
                    self.rejected.incr();
                    return false;
                }
            }
        };

        match tokio::time::timeout(PRIMARY_OFFER_TIMEOUT, primary.send(record.clone())).await {
            Ok(Ok(())) => {
                self.enqueued.incr();
                true
            }
            _ => match overflow.try_send(record) {
                Ok(()) => {
                    self.enqueued.incr();
                    true
                }
                Err(_) => {
                    self.rejected.incr();
                    false
                }
            },
        }
    }

    /// Stops accepting new records, drops the only live `Sender` clones
    /// so workers observe channel closure, then waits up to 30s for
    /// queues to drain before returning (force-flush is implicit:
    /// workers flush whatever remains once their channels close).
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        drop(self.queues.lock().expect("queues lock poisoned").take());

        let deadline = Instant::now() + Duration::from_secs(30);
        let handles = std::mem::take(&mut *self.workers.lock().expect("workers lock poisoned"));
        for handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!("batch persister worker did not drain within shutdown window");
            }
        }
        info!("batch persister shutdown complete");
    }
}

async fn worker_loop(
    queue_idx: usize,
    mut rx: mpsc::Receiver<HistoryRecord>,
    db: Arc<DatabaseService>,
    config: BatchConfig,
    persister: Arc<BatchPersister>,
) {
    let flush_interval = Duration::from_millis(config.flush_interval_ms);
    let max_wait = Duration::from_millis(config.max_wait_ms);

    let mut batch: Vec<HistoryRecord> = Vec::with_capacity(config.worker_batch_size);
    let mut oldest: Option<Instant> = None;

    loop {
        let wait = match oldest {
            Some(first_seen) => max_wait.saturating_sub(first_seen.elapsed()).min(flush_interval),
            None => flush_interval,
        };

        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(record)) => {
                if oldest.is_none() {
                    oldest = Some(Instant::now());
                }
                batch.push(record);
                if batch.len() >= config.worker_batch_size {
                    flush(queue_idx, &db, &persister, &mut batch).await;
                    oldest = None;
                }
            }
            Ok(None) => {
                // Channel closed: drain whatever remains, then exit.
                if !batch.is_empty() {
                    flush(queue_idx, &db, &persister, &mut batch).await;
                }
                return;
            }
            Err(_) => {
                // Timed out: either the flush interval or max-wait elapsed.
                if !batch.is_empty() {
                    flush(queue_idx, &db, &persister, &mut batch).await;
                    oldest = None;
                }
            }
        }
    }
}

async fn flush(
    queue_idx: usize,
    db: &Arc<DatabaseService>,
    persister: &Arc<BatchPersister>,
    batch: &mut Vec<HistoryRecord>,
) {
    let count = batch.len();
    persister.flushed.incr();
    match db.insert_history_bulk(batch).await {
        Ok(()) => {
            persister.saved.add(count as u64);
        }
        Err(e) => {
            warn!(queue = queue_idx, error = %e, "bulk insert failed, falling back to per-record");
            for record in batch.iter() {
                match db.insert_history_one(record).await {
                    Ok(()) => {
                        persister.saved.incr();
                    }
                    Err(e) => {
                        persister.failed.incr();
                        error!(queue = queue_idx, device_id = %record.device_id, error = %e, "per-record insert failed");
                    }
                }
            }
        }
    }
    batch.clear();
}
