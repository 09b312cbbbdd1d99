//! Peer sessions and the fan-out registry.
//!
//! [`Session`] and [`SessionManager`] are the boundary the connector
//! broadcasts through; [`PeerSession`] and [`SessionHub`] are the
//! in-process implementations.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use tether_core::errors::TetherError;

/// One connected remote peer.
#[async_trait]
pub trait Session: Send + Sync {
    /// Remote peer address.
    fn remote_address(&self) -> String;

    /// Deliver one message to the peer.
    async fn send(&self, message: &Value) -> Result<(), TetherError>;

    /// Stop delivering to the peer.
    async fn close(&self);
}

/// Supplies the current set of connected peers for fan-out.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// All currently connected sessions.
    async fn sessions(&self) -> Vec<Arc<dyn Session>>;
}

/// Channel-backed peer session.
///
/// Frames are serialized once and enqueued with `try_send`; a full or
/// closed queue counts as a drop and surfaces as a send failure.
pub struct PeerSession {
    /// Unique session id.
    pub id: String,
    remote_address: String,
    tx: Mutex<Option<mpsc::Sender<Arc<String>>>>,
    dropped: AtomicU64,
}

impl PeerSession {
    /// Create a session delivering frames into `tx`.
    pub fn new(
        id: impl Into<String>,
        remote_address: impl Into<String>,
        tx: mpsc::Sender<Arc<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            remote_address: remote_address.into(),
            tx: Mutex::new(Some(tx)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Frames dropped because the peer's queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Session for PeerSession {
    fn remote_address(&self) -> String {
        self.remote_address.clone()
    }

    async fn send(&self, message: &Value) -> Result<(), TetherError> {
        let text = serde_json::to_string(message)
            .map_err(|e| TetherError::send_failed(&self.remote_address, e.to_string()))?;
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return Err(TetherError::send_failed(&self.remote_address, "session closed"));
        };
        if tx.try_send(Arc::new(text)).is_ok() {
            Ok(())
        } else {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            counter!("tether_session_drops_total").increment(1);
            Err(TetherError::send_failed(
                &self.remote_address,
                "send queue full or closed",
            ))
        }
    }

    async fn close(&self) {
        debug!(session = %self.id, "closing session");
        let _ = self.tx.lock().take();
    }
}

/// Registry of connected sessions, keyed by session id.
pub struct SessionHub {
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
    /// Atomic counter so count queries never take the read lock.
    active: AtomicUsize,
}

impl SessionHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            active: AtomicUsize::new(0),
        }
    }

    /// Add a session; an existing session under the same id is replaced.
    pub async fn add(&self, session: Arc<PeerSession>) {
        let mut sessions = self.sessions.write().await;
        if sessions.insert(session.id.clone(), session).is_none() {
            let _ = self.active.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove a session by id.
    pub async fn remove(&self, id: &str) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(id).is_some() {
            let _ = self.active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Number of connected sessions.
    pub fn count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Sessions matching `predicate`.
    pub async fn filter(&self, predicate: impl Fn(&PeerSession) -> bool) -> Vec<Arc<PeerSession>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|session| predicate(session))
            .cloned()
            .collect()
    }
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionManager for SessionHub {
    async fn sessions(&self) -> Vec<Arc<dyn Session>> {
        self.sessions
            .read()
            .await
            .values()
            .map(|session| Arc::clone(session) as Arc<dyn Session>)
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
