// Process-wide counters, reset only on restart

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct Stats {
    pub total_connections: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub decode_errors: AtomicU64,
    pub records_published: AtomicU64,
    pub records_persisted: AtomicU64,
    pub persist_failures: AtomicU64,
    pub relay_failures: AtomicU64,
    pub start_time: DateTime<Utc>,
}

/// Point-in-time copy of [`Stats`] for the status endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub decode_errors: u64,
    pub records_published: u64,
    pub records_persisted: u64,
    pub persist_failures: u64,
    pub relay_failures: u64,
    pub start_time: DateTime<Utc>,
    /// Seconds since start
    pub uptime: i64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            records_published: AtomicU64::new(0),
            records_persisted: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            relay_failures: AtomicU64::new(0),
            start_time: Utc::now(),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            total_connections: load(&self.total_connections),
            messages_received: load(&self.messages_received),
            messages_sent: load(&self.messages_sent),
            decode_errors: load(&self.decode_errors),
            records_published: load(&self.records_published),
            records_persisted: load(&self.records_persisted),
            persist_failures: load(&self.persist_failures),
            relay_failures: load(&self.relay_failures),
            start_time: self.start_time,
            uptime: (Utc::now() - self.start_time).num_seconds(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
