// Persistence backends for processed records
//
// Only "append a batch" and "read latest / recent" are required of a backend.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::constants::{STORE_TAIL_CHUNK, STORE_TAIL_RECORDS};
use crate::record::ProcessedRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored record is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage consumed by the write buffer
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Append a batch in order. Returns the number of records actually stored.
    async fn append_batch(&self, records: &[ProcessedRecord]) -> Result<usize, StoreError>;

    /// Most recently persisted record
    async fn query_latest(&self) -> Result<Option<ProcessedRecord>, StoreError>;

    /// Up to `limit` most recent records, oldest first
    async fn query_recent(&self, limit: usize) -> Result<Vec<ProcessedRecord>, StoreError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Process-local store; skips records whose `seq` it already holds
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    records: Vec<ProcessedRecord>,
    seen: HashSet<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.records.is_empty()
    }
}

#[async_trait]
impl LocationStore for MemoryStore {
    async fn append_batch(&self, records: &[ProcessedRecord]) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let mut stored = 0;
        for record in records {
            if inner.seen.insert(record.seq) {
                inner.records.push(record.clone());
                stored += 1;
            }
        }
        Ok(stored)
    }

    async fn query_latest(&self) -> Result<Option<ProcessedRecord>, StoreError> {
        Ok(self.inner.read().await.records.last().cloned())
    }

    async fn query_recent(&self, limit: usize) -> Result<Vec<ProcessedRecord>, StoreError> {
        let inner = self.inner.read().await;
        let start = inner.records.len().saturating_sub(limit);
        Ok(inner.records[start..].to_vec())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Append-only file, one JSON record per line.
///
/// The newest records are kept in memory: they are read from the end of the
/// file on open and extended on every append, so queries never rescan the file.
pub struct JsonLinesStore {
    path: PathBuf,
    tail_capacity: usize,
    // Appends and the tail move together so concurrent batches never interleave lines
    tail: Mutex<VecDeque<ProcessedRecord>>,
}

impl JsonLinesStore {
    /// Open (creating parent directories and the file if needed)
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_tail(path, STORE_TAIL_RECORDS).await
    }

    /// Open, keeping the last `tail_capacity` records queryable
    pub async fn open_with_tail(path: impl AsRef<Path>, tail_capacity: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let tail_capacity = tail_capacity.max(1);
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await?;

        let (tail, terminated) = read_tail(&mut file, tail_capacity).await?;
        if !terminated {
            // Cut off mid-line by a crash; start the next append on a fresh line
            warn!(path = %path.display(), "Store file ends in a partial line");
            file.write_all(b"\n").await?;
            file.flush().await?;
        }
        debug!(path = %path.display(), records = tail.len(), "Opened location store");

        Ok(Self {
            path,
            tail_capacity,
            tail: Mutex::new(tail),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse up to `limit` complete records from the end of `file`.
///
/// Lines that fail to parse are skipped. The flag is false when the file is
/// non-empty and does not end with a newline.
async fn read_tail(
    file: &mut tokio::fs::File,
    limit: usize,
) -> Result<(VecDeque<ProcessedRecord>, bool), StoreError> {
    let len = file.metadata().await?.len();
    let mut pos = len;
    let mut bytes: Vec<u8> = Vec::new();

    // One more newline than records wanted, so the first kept line is whole
    while pos > 0 && bytes.iter().filter(|&&b| b == b'\n').count() <= limit {
        let step = STORE_TAIL_CHUNK.min(pos);
        pos -= step;
        let mut chunk = vec![0u8; step as usize];
        file.seek(SeekFrom::Start(pos)).await?;
        file.read_exact(&mut chunk).await?;
        chunk.extend_from_slice(&bytes);
        bytes = chunk;
    }
    let terminated = bytes.last().map_or(true, |&b| b == b'\n');

    let text = String::from_utf8_lossy(&bytes);
    let mut lines: Vec<&str> = text.split('\n').collect();
    if pos > 0 && !lines.is_empty() {
        // Starts mid-line
        lines.remove(0);
    }

    let mut tail = VecDeque::with_capacity(limit);
    for line in lines.into_iter().rev() {
        if tail.len() == limit {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ProcessedRecord>(line) {
            Ok(record) => tail.push_front(record),
            Err(e) => warn!("Skipping unreadable stored record: {}", e),
        }
    }
    Ok((tail, terminated))
}

#[async_trait]
impl LocationStore for JsonLinesStore {
    async fn append_batch(&self, records: &[ProcessedRecord]) -> Result<usize, StoreError> {
        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }

        let mut tail = self.tail.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;

        tail.extend(records.iter().cloned());
        while tail.len() > self.tail_capacity {
            tail.pop_front();
        }
        debug!(count = records.len(), path = %self.path.display(), "Appended records");
        Ok(records.len())
    }

    async fn query_latest(&self) -> Result<Option<ProcessedRecord>, StoreError> {
        Ok(self.tail.lock().await.back().cloned())
    }

    /// At most the configured tail capacity is available
    async fn query_recent(&self, limit: usize) -> Result<Vec<ProcessedRecord>, StoreError> {
        let tail = self.tail.lock().await;
        let start = tail.len().saturating_sub(limit);
        Ok(tail.iter().skip(start).cloned().collect())
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}
