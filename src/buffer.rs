// Write buffer - batches processed records on their way to storage
//
// Records accumulate in memory and are flushed when the buffer reaches its
// threshold or when the periodic timer fires. A flush swaps the whole buffer
// out under the lock, so readers never see a partial batch. Swapped-out
// batches go to a single writer task that persists them in flush order and
// never retries.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::constants::{DEFAULT_FLUSH_INTERVAL, DEFAULT_FLUSH_THRESHOLD};
use crate::record::ProcessedRecord;
use crate::stats::Stats;
use crate::store::{LocationStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferConfig {
    /// Buffered records that trigger an immediate flush
    pub threshold: usize,
    /// Timer period for flushing a non-empty buffer
    pub flush_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FLUSH_THRESHOLD,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

type Batch = Arc<[ProcessedRecord]>;

pub struct WriteBuffer {
    records: Mutex<Vec<ProcessedRecord>>,
    threshold: usize,
    flush_interval: Duration,
    store: Arc<dyn LocationStore>,
    stats: Arc<Stats>,
    /// Batches handed to the writer and not yet settled, oldest first
    pending: Arc<Mutex<VecDeque<Batch>>>,
    settled: Arc<Notify>,
    writer_tx: mpsc::UnboundedSender<Batch>,
}

impl WriteBuffer {
    /// Create the buffer and spawn its writer task. Needs a tokio runtime.
    pub fn new(config: BufferConfig, store: Arc<dyn LocationStore>, stats: Arc<Stats>) -> Self {
        let threshold = config.threshold.max(1);
        let pending = Arc::new(Mutex::new(VecDeque::new()));
        let settled = Arc::new(Notify::new());
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_batches(
            writer_rx,
            store.clone(),
            stats.clone(),
            pending.clone(),
            settled.clone(),
        ));

        Self {
            records: Mutex::new(Vec::with_capacity(threshold)),
            threshold,
            flush_interval: config.flush_interval,
            store,
            stats,
            pending,
            settled,
            writer_tx,
        }
    }

    /// Append a record; reaching the threshold flushes before returning.
    ///
    /// Returns the size of the batch handed to storage, 0 if no flush happened.
    pub fn enqueue(&self, record: ProcessedRecord) -> usize {
        let mut records = lock(&self.records);
        records.push(record);
        if records.len() < self.threshold {
            return 0;
        }
        let batch = mem::replace(&mut *records, Vec::with_capacity(self.threshold));
        self.hand_off(batch)
    }

    /// Swap the buffer for an empty one and queue the old contents for the writer.
    ///
    /// Returns the number of records handed to storage.
    pub fn flush(&self) -> usize {
        let mut records = lock(&self.records);
        let batch = mem::take(&mut *records);
        self.hand_off(batch)
    }

    // Called with the records lock held, so batches reach the writer in swap order
    fn hand_off(&self, batch: Vec<ProcessedRecord>) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let count = batch.len();
        let batch: Batch = batch.into();
        lock(&self.pending).push_back(batch.clone());
        if self.writer_tx.send(batch).is_err() {
            lock(&self.pending).pop_back();
            Stats::incr(&self.stats.persist_failures);
            error!(count, "Writer task is gone, batch dropped");
            return 0;
        }
        count
    }

    /// Wait until every batch handed to storage so far has been written or dropped
    pub async fn wait_idle(&self) {
        loop {
            let settled = self.settled.notified();
            let idle = lock(&self.pending).is_empty();
            if idle {
                return;
            }
            settled.await;
        }
    }

    /// Newest record: the buffer tail, then the newest batch still being
    /// written, then the backend's latest.
    pub async fn get_latest(&self) -> Result<Option<ProcessedRecord>, StoreError> {
        {
            let records = lock(&self.records);
            if let Some(record) = records.last() {
                return Ok(Some(record.clone()));
            }
            // Still under the records lock: a concurrent flush cannot slip a
            // batch past both checks
            let pending = lock(&self.pending);
            if let Some(record) = pending.back().and_then(|batch| batch.last()) {
                return Ok(Some(record.clone()));
            }
        }
        self.store.query_latest().await
    }

    /// Up to `limit` persisted records, oldest first
    pub async fn persisted_recent(&self, limit: usize) -> Result<Vec<ProcessedRecord>, StoreError> {
        self.store.query_recent(limit).await
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.records).is_empty()
    }

    /// Batches queued for or being written by the writer task
    pub fn pending_batches(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Start the periodic flush timer
    pub fn spawn_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        let period = self.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let flushed = buffer.flush();
                if flushed > 0 {
                    debug!(flushed, "Timer flush");
                }
            }
        })
    }

    pub fn persisted_count(&self) -> u64 {
        self.stats.records_persisted.load(Ordering::Relaxed)
    }
}

/// Writer task: one batch at a time, in the order they were flushed
async fn write_batches(
    mut rx: mpsc::UnboundedReceiver<Batch>,
    store: Arc<dyn LocationStore>,
    stats: Arc<Stats>,
    pending: Arc<Mutex<VecDeque<Batch>>>,
    settled: Arc<Notify>,
) {
    while let Some(batch) = rx.recv().await {
        let count = batch.len();
        match store.append_batch(&batch).await {
            Ok(stored) => {
                Stats::add(&stats.records_persisted, stored as u64);
                info!(count, stored, backend = store.name(), "Persisted location batch");
            }
            Err(e) => {
                // Batch is dropped; the loss window is bounded by threshold and interval
                Stats::incr(&stats.persist_failures);
                error!(count, backend = store.name(), "Failed to persist location batch: {}", e);
            }
        }
        lock(&pending).pop_front();
        settled.notify_waiters();
    }
}

// A poisoned buffer lock only means another thread panicked mid-push; the Vec is still valid
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
