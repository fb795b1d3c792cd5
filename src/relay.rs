// Downstream relay - forwards every published record to an external backend
//
// Forwarding is fire-and-forget: records are queued to a background worker and
// the dispatch path never waits on the network. Failures reach the caller only
// through the error callback.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::record::ProcessedRecord;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend answered {0}")]
    Status(u16),
    #[error("relay queue full, record dropped")]
    QueueFull,
    #[error("relay closed")]
    Closed,
}

/// Destination for forwarded records
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn forward(&self, record: &ProcessedRecord) -> Result<(), RelayError>;

    /// Human-readable target for logs
    fn target(&self) -> String;
}

/// POSTs each record as JSON to a fixed URL
pub struct HttpDownstream {
    client: reqwest::Client,
    url: String,
}

impl HttpDownstream {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl Downstream for HttpDownstream {
    async fn forward(&self, record: &ProcessedRecord) -> Result<(), RelayError> {
        let response = self.client.post(&self.url).json(record).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Status(status.as_u16()));
        }
        Ok(())
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}

/// Side channel for forwarding failures
pub type ErrorCallback = Arc<dyn Fn(&ProcessedRecord, &RelayError) + Send + Sync>;

/// Background forwarding worker
pub struct Relay {
    tx: Mutex<Option<mpsc::Sender<ProcessedRecord>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    on_error: ErrorCallback,
}

impl Relay {
    /// Start the worker; at most `queue` records wait for the backend
    pub fn spawn(downstream: Arc<dyn Downstream>, queue: usize, on_error: ErrorCallback) -> Self {
        let (tx, mut rx) = mpsc::channel::<ProcessedRecord>(queue.max(1));
        let worker_errors = on_error.clone();
        info!(url = %downstream.target(), "Downstream relay started");

        let worker = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                match downstream.forward(&record).await {
                    Ok(()) => debug!(seq = record.seq, "Relayed record"),
                    Err(e) => worker_errors(&record, &e),
                }
            }
            debug!("Relay worker drained");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            on_error,
        }
    }

    /// Queue a record without waiting; returns false if it was dropped
    pub fn submit(&self, record: ProcessedRecord) -> bool {
        let tx = match lock(&self.tx).as_ref() {
            Some(tx) => tx.clone(),
            None => {
                (self.on_error)(&record, &RelayError::Closed);
                return false;
            }
        };
        match tx.try_send(record) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(record)) => {
                (self.on_error)(&record, &RelayError::QueueFull);
                false
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                (self.on_error)(&record, &RelayError::Closed);
                false
            }
        }
    }

    /// Stop accepting records and give queued ones up to `grace` to go out
    pub async fn close(&self, grace: Duration) {
        drop(lock(&self.tx).take());
        let worker = lock(&self.worker).take();
        if let Some(mut worker) = worker {
            if tokio::time::timeout(grace, &mut worker).await.is_err() {
                warn!("Relay did not drain within {:?}, abandoning queued records", grace);
                worker.abort();
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
