// Broker - process-scoped owner of the registry, write buffer, relay and timers
//
// Lifecycle: new() -> start() spawns the flush and heartbeat timers ->
// shutdown() cancels them, notifies every session and drains the buffer.

use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferConfig, WriteBuffer};
use crate::constants::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HISTORY_SIZE, DEFAULT_RELAY_QUEUE, DEFAULT_SHUTDOWN_GRACE,
    SESSION_QUEUE_CAPACITY, SHUTDOWN_MESSAGE, WELCOME_MESSAGE,
};
use crate::dispatch::Dispatcher;
use crate::fanout::{self, FanoutReport};
use crate::filter::FilterParams;
use crate::geodesy::ReferencePoint;
use crate::heartbeat::HeartbeatMonitor;
use crate::net::messages::ServerMessage;
use crate::record::ProcessedRecord;
use crate::registry::{
    ClientRegistry, Outbound, SendOutcome, SessionHandle, SessionInfo, TransportKind,
};
use crate::relay::{Downstream, Relay, RelayError};
use crate::stats::{Stats, StatsSnapshot};
use crate::store::{LocationStore, StoreError};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub filter: FilterParams,
    pub reference: ReferencePoint,
    pub buffer: BufferConfig,
    pub heartbeat_interval: Duration,
    /// Published records kept for `/locations`
    pub history_size: usize,
    pub welcome_message: String,
    pub shutdown_grace: Duration,
    /// Outbound frames queued per session
    pub queue_capacity: usize,
    /// Records waiting for the downstream relay
    pub relay_queue: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            filter: FilterParams::default(),
            reference: ReferencePoint::default(),
            buffer: BufferConfig::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            history_size: DEFAULT_HISTORY_SIZE,
            welcome_message: WELCOME_MESSAGE.to_string(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            queue_capacity: SESSION_QUEUE_CAPACITY,
            relay_queue: DEFAULT_RELAY_QUEUE,
        }
    }
}

/// Counters plus values derived at snapshot time
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusStats {
    #[serde(flatten)]
    pub counters: StatsSnapshot,
    pub current_connections: usize,
    pub location_history_count: usize,
    pub buffered_records: usize,
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    pub stats: StatusStats,
    pub clients: Vec<SessionInfo>,
}

pub struct Broker {
    config: BrokerConfig,
    registry: Arc<ClientRegistry>,
    buffer: Arc<WriteBuffer>,
    stats: Arc<Stats>,
    history: Mutex<VecDeque<ProcessedRecord>>,
    reference: watch::Sender<ReferencePoint>,
    relay: Option<Relay>,
    next_seq: AtomicU64,
    closing: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    /// Build a broker. Must be called inside a tokio runtime.
    pub fn new(
        config: BrokerConfig,
        store: Arc<dyn LocationStore>,
        downstream: Option<Arc<dyn Downstream>>,
    ) -> Self {
        let stats = Arc::new(Stats::new());
        let registry = Arc::new(ClientRegistry::new(config.queue_capacity));
        let buffer = Arc::new(WriteBuffer::new(config.buffer, store, stats.clone()));
        let (reference, _) = watch::channel(config.reference);

        let relay = downstream.map(|d| {
            let relay_stats = stats.clone();
            let on_error = Arc::new(move |record: &ProcessedRecord, err: &RelayError| {
                Stats::incr(&relay_stats.relay_failures);
                warn!(seq = record.seq, client = record.client_id, "Relay to backend failed: {}", err);
            });
            Relay::spawn(d, config.relay_queue, on_error)
        });

        Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_size)),
            config,
            registry,
            buffer,
            stats,
            reference,
            relay,
            next_seq: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the flush timer and heartbeat monitor. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.buffer.spawn_flusher());
        tasks.push(HeartbeatMonitor::new(self.registry.clone(), self.config.heartbeat_interval).spawn());
        info!(
            flush_threshold = self.buffer.threshold(),
            flush_interval = ?self.config.buffer.flush_interval,
            heartbeat = ?self.config.heartbeat_interval,
            "Broker started"
        );
    }

    /// Seed history and the sequence counter from storage after a restart.
    ///
    /// Returns the number of records restored into history.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let records = self.buffer.persisted_recent(self.config.history_size).await?;
        if let Some(max_seq) = records.iter().map(|r| r.seq).max() {
            self.next_seq.fetch_max(max_seq + 1, Ordering::Relaxed);
        }

        let count = records.len();
        let mut history = lock(&self.history);
        for record in records {
            history.push_back(record);
        }
        while history.len() > self.config.history_size {
            history.pop_front();
        }
        Ok(count)
    }

    /// Register a new transport session and queue its welcome frame.
    ///
    /// Once shutdown has begun the session gets the shutdown notice instead
    /// and is closed straight away.
    pub async fn connect(
        &self,
        transport: TransportKind,
        peer: Option<SocketAddr>,
    ) -> (SessionHandle, mpsc::Receiver<Outbound>) {
        let (handle, rx) = self.registry.register(transport, peer).await;
        Stats::incr(&self.stats.total_connections);

        if self.is_closing() {
            let notice = ServerMessage::ServerShutdown { message: SHUTDOWN_MESSAGE.to_string() };
            self.reply(&handle, &notice);
            handle.close();
            debug!(session = handle.id(), peer = ?peer, "Connection turned away, shutting down");
            return (handle, rx);
        }

        let welcome = ServerMessage::Welcome {
            client_id: handle.id(),
            message: self.config.welcome_message.clone(),
            server_time: Utc::now(),
        };
        self.reply(&handle, &welcome);

        let current = self.registry.len().await;
        info!(
            session = handle.id(),
            transport = ?transport,
            peer = ?peer,
            current,
            "Client connected"
        );
        (handle, rx)
    }

    /// Remove a session after its transport ended. Idempotent.
    pub async fn disconnect(&self, id: u64) {
        if self.registry.remove(id).await.is_some() {
            let current = self.registry.len().await;
            info!(session = id, current, "Client disconnected");
        }
    }

    /// Per-session dispatcher with its own filter state
    pub fn dispatcher(self: &Arc<Self>, handle: SessionHandle) -> Dispatcher {
        Dispatcher::new(handle, Arc::clone(self), self.reference.subscribe())
    }

    /// Queue a direct reply; counts towards messages sent when queued
    pub fn reply(&self, handle: &SessionHandle, message: &ServerMessage) -> bool {
        match handle.send(message) {
            Ok(SendOutcome::Queued) => {
                Stats::incr(&self.stats.messages_sent);
                true
            }
            Ok(outcome) => {
                debug!(session = handle.id(), ?outcome, "Reply not queued");
                false
            }
            Err(e) => {
                error!(session = handle.id(), "Failed to encode reply: {}", e);
                false
            }
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Hand a processed record to every consumer.
    ///
    /// The record is broadcast and enqueued exactly once each, then submitted
    /// to the relay if one is configured.
    pub async fn publish(&self, record: ProcessedRecord) -> FanoutReport {
        {
            let mut history = lock(&self.history);
            history.push_back(record.clone());
            while history.len() > self.config.history_size {
                history.pop_front();
            }
        }

        let update = ServerMessage::LocationUpdate { data: record.clone() };
        let report = match update.encode() {
            Ok(frame) => fanout::broadcast(&self.registry, &frame).await,
            Err(e) => {
                error!(seq = record.seq, "Failed to encode location update: {}", e);
                FanoutReport::default()
            }
        };
        Stats::add(&self.stats.messages_sent, report.delivered as u64);

        self.buffer.enqueue(record.clone());
        if self.is_closing() {
            // No timer left to pick it up
            self.buffer.flush();
        }
        if let Some(relay) = &self.relay {
            relay.submit(record);
        }
        Stats::incr(&self.stats.records_published);
        report
    }

    /// Move the local origin. Every dispatcher resets its filter on its next GPS sample.
    pub fn set_reference(&self, reference: ReferencePoint) {
        let previous = self.reference.send_replace(reference);
        if previous != reference {
            info!(
                latitude = reference.latitude,
                longitude = reference.longitude,
                "Reference point updated"
            );
        }
    }

    pub fn reference(&self) -> ReferencePoint {
        *self.reference.borrow()
    }

    /// Newest `limit` published records, oldest first
    pub fn recent(&self, limit: usize) -> Vec<ProcessedRecord> {
        let history = lock(&self.history);
        let start = history.len().saturating_sub(limit);
        history.iter().skip(start).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        lock(&self.history).len()
    }

    pub async fn latest(&self) -> Result<Option<ProcessedRecord>, StoreError> {
        self.buffer.get_latest().await
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport {
            status: "running",
            stats: StatusStats {
                counters: self.stats.snapshot(),
                current_connections: self.registry.len().await,
                location_history_count: self.history_len(),
                buffered_records: self.buffer.len(),
            },
            clients: self.registry.snapshot().await,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn buffer(&self) -> &Arc<WriteBuffer> {
        &self.buffer
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Stop timers, notify and close every session, then drain storage and relay.
    ///
    /// Each drain step is bounded by the shutdown grace period.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            task.abort();
        }

        let notice = ServerMessage::ServerShutdown { message: SHUTDOWN_MESSAGE.to_string() };
        let handles = self.registry.handles().await;
        info!(sessions = handles.len(), "Shutting down, notifying clients");
        for handle in &handles {
            self.reply(handle, &notice);
            handle.close();
        }

        let flushed = self.buffer.flush();
        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, self.buffer.wait_idle()).await.is_err() {
            warn!(
                batches = self.buffer.pending_batches(),
                "Storage did not finish within {:?}, pending batches abandoned",
                grace
            );
        } else {
            info!(flushed, persisted = self.buffer.persisted_count(), "Write buffer drained");
        }

        if let Some(relay) = &self.relay {
            relay.close(grace).await;
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::record::sample_record;
    use crate::registry::ClientRole;
    use crate::store::{LocationStore, MemoryStore};

    pub(crate) fn test_broker(threshold: usize) -> (Arc<Broker>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = BrokerConfig {
            buffer: BufferConfig { threshold, flush_interval: Duration::from_secs(5) },
            ..Default::default()
        };
        (Arc::new(Broker::new(config, store.clone(), None)), store)
    }

    fn frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Text(text) = item {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_connect_sends_welcome() {
        let (broker, _) = test_broker(50);
        let (handle, mut rx) = broker.connect(TransportKind::WebSocket, None).await;

        let sent = frames(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "welcome");
        assert_eq!(sent[0]["clientId"], handle.id());
        assert_eq!(broker.stats().snapshot().total_connections, 1);
    }

    #[tokio::test]
    async fn test_departed_viewer_gets_nothing() {
        let (broker, _) = test_broker(50);
        let (viewer, mut viewer_rx) = broker.connect(TransportKind::WebSocket, None).await;
        let (tracker, _tracker_rx) = broker.connect(TransportKind::WebSocket, None).await;
        broker.registry().set_role(viewer.id(), ClientRole::Viewer).await;
        broker.registry().set_role(tracker.id(), ClientRole::Tracker).await;
        broker.disconnect(viewer.id()).await;
        frames(&mut viewer_rx);

        let report = broker.publish(sample_record(broker.next_seq())).await;
        assert_eq!(report.delivered, 0);
        assert!(frames(&mut viewer_rx).is_empty());
        // Still enqueued for storage
        assert_eq!(broker.buffer().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_viewer_buffer_and_history_once() {
        let (broker, store) = test_broker(50);
        let (_viewer, mut rx) = broker.connect(TransportKind::WebSocket, None).await;
        frames(&mut rx);

        let report = broker.publish(sample_record(1)).await;
        assert_eq!(report.delivered, 1);

        let sent = frames(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "location_update");
        assert_eq!(sent[0]["data"]["seq"], 1);
        assert_eq!(broker.buffer().len(), 1);
        assert_eq!(broker.recent(10).len(), 1);

        broker.shutdown().await;
        assert_eq!(store.len().await, 1);
        assert_eq!(broker.stats().snapshot().records_published, 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_ordered() {
        let store = Arc::new(MemoryStore::new());
        let config = BrokerConfig { history_size: 3, ..Default::default() };
        let broker = Broker::new(config, store, None);
        for seq in 1..=5 {
            broker.publish(sample_record(seq)).await;
        }
        let seqs: Vec<u64> = broker.recent(50).iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        let seqs: Vec<u64> = broker.recent(2).iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_shutdown_notifies_and_closes_sessions() {
        let (broker, store) = test_broker(50);
        broker.start();
        let (handle, mut rx) = broker.connect(TransportKind::Tcp, None).await;
        broker.publish(sample_record(1)).await;
        broker.publish(sample_record(2)).await;

        broker.shutdown().await;

        let sent = frames(&mut rx);
        assert_eq!(sent.last().unwrap()["type"], "server_shutdown");
        assert!(handle.is_closed());
        assert!(broker.buffer().is_empty());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_connect_and_publish_after_shutdown() {
        let (broker, store) = test_broker(50);
        broker.start();
        broker.shutdown().await;
        assert!(broker.is_closing());

        let (late, mut rx) = broker.connect(TransportKind::WebSocket, None).await;
        assert!(late.is_closed());
        let sent = frames(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "server_shutdown");

        // A frame already in flight from a tracker still reaches storage
        broker.publish(sample_record(1)).await;
        assert!(broker.buffer().is_empty());
        broker.buffer().wait_idle().await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_restore_seeds_history_and_seq() {
        let store = Arc::new(MemoryStore::new());
        let batch: Vec<ProcessedRecord> = (1..=5).map(sample_record).collect();
        store.append_batch(&batch).await.unwrap();

        let config = BrokerConfig { history_size: 3, ..Default::default() };
        let broker = Broker::new(config, store, None);
        assert_eq!(broker.restore().await.unwrap(), 3);

        let seqs: Vec<u64> = broker.recent(50).iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(broker.next_seq(), 6);
    }

    #[tokio::test]
    async fn test_status_report_shape() {
        let (broker, _) = test_broker(50);
        let (h, _rx) = broker.connect(TransportKind::WebSocket, None).await;
        broker.registry().set_role(h.id(), ClientRole::Tracker).await;
        broker.publish(sample_record(1)).await;

        let json = serde_json::to_value(broker.status().await).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["stats"]["totalConnections"], 1);
        assert_eq!(json["stats"]["currentConnections"], 1);
        assert_eq!(json["stats"]["locationHistoryCount"], 1);
        assert_eq!(json["stats"]["bufferedRecords"], 1);
        assert!(json["stats"]["uptime"].is_number());
        assert_eq!(json["clients"][0]["type"], "tracker");
    }

    #[tokio::test]
    async fn test_reference_update() {
        let (broker, _) = test_broker(50);
        let new_ref = ReferencePoint::new(37.5, 127.0).unwrap();
        broker.set_reference(new_ref);
        assert_eq!(broker.reference(), new_ref);
    }
}
