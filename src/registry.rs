// Client registry - the set of live transport sessions
//
// Sessions are created on accept, identified at most once, and destroyed on
// disconnect or heartbeat eviction. Each session owns a bounded outbound queue
// drained by exactly one transport task, which keeps per-session ordering.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::debug;

use crate::net::messages::ServerMessage;

/// Declared role of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Tracker,
    Viewer,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ClientRole {
    /// Unidentified sessions are treated as viewers
    pub fn receives_broadcasts(self) -> bool {
        matches!(self, ClientRole::Viewer | ClientRole::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    WebSocket,
    Tcp,
}

/// Work item for a session's transport task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Serialized JSON frame
    Text(Arc<str>),
    /// Liveness probe; the transport decides how to express it
    Probe,
}

/// Result of queueing a frame on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Outbound queue is full; the frame was dropped for this session
    Full,
    /// Session is closing or gone
    Closed,
}

/// Cloneable handle used to talk to one session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    transport: TransportKind,
    peer: Option<SocketAddr>,
    tx: mpsc::Sender<Outbound>,
    alive: Arc<AtomicBool>,
    /// Unix millis of the last inbound frame
    last_activity: Arc<AtomicI64>,
    closed: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queue an already-serialized frame
    pub fn send_text(&self, text: Arc<str>) -> SendOutcome {
        if self.is_closed() {
            return SendOutcome::Closed;
        }
        match self.tx.try_send(Outbound::Text(text)) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Serialize and queue a message
    pub fn send(&self, message: &ServerMessage) -> Result<SendOutcome, serde_json::Error> {
        Ok(self.send_text(message.encode()?))
    }

    /// Queue a liveness probe
    pub fn probe(&self) -> SendOutcome {
        if self.is_closed() {
            return SendOutcome::Closed;
        }
        match self.tx.try_send(Outbound::Probe) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Record a probe response
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }

    /// Read and clear the liveness flag
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Note inbound activity: bumps last_activity and counts as a probe response
    pub fn touch(&self) {
        self.last_activity.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.mark_alive();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let millis = self.last_activity.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
    }

    /// Stop accepting frames and wake the transport task.
    ///
    /// Frames queued before the close are still written.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_signal.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_signal.notified().await;
    }
}

/// Registry entry
#[derive(Debug, Clone)]
pub struct Session {
    pub handle: SessionHandle,
    pub role: ClientRole,
    pub connected_at: DateTime<Utc>,
}

/// Serializable view of a session for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: u64,
    #[serde(rename = "type")]
    pub role: ClientRole,
    pub transport: TransportKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl From<&Session> for SessionInfo {
    fn from(s: &Session) -> Self {
        SessionInfo {
            id: s.handle.id,
            role: s.role,
            transport: s.handle.transport,
            peer: s.handle.peer.map(|p| p.to_string()),
            connected_at: s.connected_at,
            last_activity: s.handle.last_activity(),
        }
    }
}

/// Concurrent map of live sessions
pub struct ClientRegistry {
    sessions: RwLock<HashMap<u64, Session>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl ClientRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a freshly accepted transport.
    ///
    /// Ids come from a monotonic counter and are never reused. The returned
    /// receiver must be drained by the session's transport task.
    pub async fn register(
        &self,
        transport: TransportKind,
        peer: Option<SocketAddr>,
    ) -> (SessionHandle, mpsc::Receiver<Outbound>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let now = Utc::now();
        let handle = SessionHandle {
            id,
            transport,
            peer,
            tx,
            alive: Arc::new(AtomicBool::new(true)),
            last_activity: Arc::new(AtomicI64::new(now.timestamp_millis())),
            closed: Arc::new(AtomicBool::new(false)),
            close_signal: Arc::new(Notify::new()),
        };
        let session = Session {
            handle: handle.clone(),
            role: ClientRole::Unknown,
            connected_at: now,
        };
        self.sessions.write().await.insert(id, session);
        (handle, rx)
    }

    /// Apply an identify. Only an unidentified session changes role.
    ///
    /// Returns the role in effect afterwards, or None if the session is gone.
    pub async fn set_role(&self, id: u64, role: ClientRole) -> Option<ClientRole> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id)?;
        if session.role == ClientRole::Unknown {
            session.role = role;
        }
        Some(session.role)
    }

    /// Touch a session by id. The handle's own [`SessionHandle::touch`] needs no lock at all.
    pub async fn touch(&self, id: u64) -> bool {
        match self.sessions.read().await.get(&id) {
            Some(session) => {
                session.handle.touch();
                true
            }
            None => false,
        }
    }

    /// Remove a session and close its handle. Idempotent.
    pub async fn remove(&self, id: u64) -> Option<Session> {
        let removed = self.sessions.write().await.remove(&id);
        if let Some(session) = &removed {
            // Closed while the write lock was held; fan-out can no longer see it
            session.handle.close();
            debug!(session = id, "Session removed from registry");
        }
        removed
    }

    pub async fn role(&self, id: u64) -> Option<ClientRole> {
        self.sessions.read().await.get(&id).map(|s| s.role)
    }

    /// Copy of every live handle
    pub async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.read().await.values().map(|s| s.handle.clone()).collect()
    }

    /// Diagnostic listing, ordered by id
    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionInfo> = sessions.values().map(SessionInfo::from).collect();
        list.sort_by_key(|s| s.id);
        list
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Visit every session under the read lock.
    ///
    /// Removal needs the write lock, so no session disappears mid-visit. `f`
    /// must not block.
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Session),
    {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            f(session);
        }
    }
}
