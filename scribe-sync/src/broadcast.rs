//! Fan-out of encoded frames to the live sessions of each document.
//!
//! ```text
//!   DocumentService (holding the document lock)
//!         │ broadcast(doc_id, frame, exclude = origin)
//!         ▼
//!   ConnectionRegistry ── doc_id ──► { session_id → SessionHandle }
//!                                          │ try_send (bounded)
//!                                          ▼
//!                                    SessionReceiver (one per socket)
//! ```
//!
//! Every session owns a bounded queue. A session whose queue is full is
//! evicted on the spot: its handle is dropped and its receiver reports a
//! 1013 close once the backlog drains. Other sessions are unaffected.
//!
//! Frames are shared as `Arc<Vec<u8>>` so a broadcast encodes once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::close_code;

/// Close code and reason handed to a session when the registry drops it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    fn normal() -> Self {
        Self::new(close_code::NORMAL, "closed")
    }
}

/// What a session's outbound queue yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Arc<Vec<u8>>),
    Close(CloseReason),
}

/// Registry-side end of a session's outbound queue.
pub struct SessionHandle {
    sender: mpsc::Sender<Arc<Vec<u8>>>,
    close: Arc<Mutex<Option<CloseReason>>>,
}

impl SessionHandle {
    /// Create a bounded queue and return both ends.
    pub fn channel(capacity: usize) -> (SessionHandle, SessionReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let close = Arc::new(Mutex::new(None));
        (
            SessionHandle {
                sender,
                close: close.clone(),
            },
            SessionReceiver { receiver, close },
        )
    }

    fn set_close(&self, reason: CloseReason) {
        if let Ok(mut slot) = self.close.lock() {
            slot.get_or_insert(reason);
        }
    }
}

/// Session-side end of the outbound queue.
pub struct SessionReceiver {
    receiver: mpsc::Receiver<Arc<Vec<u8>>>,
    close: Arc<Mutex<Option<CloseReason>>>,
}

impl SessionReceiver {
    /// Next frame, or the close reason once the registry has dropped the handle.
    pub async fn recv(&mut self) -> Outbound {
        match self.receiver.recv().await {
            Some(frame) => Outbound::Frame(frame),
            None => Outbound::Close(
                self.close
                    .lock()
                    .ok()
                    .and_then(|mut slot| slot.take())
                    .unwrap_or_else(CloseReason::normal),
            ),
        }
    }

    /// Non-blocking variant; `None` when nothing is queued yet.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        match self.receiver.try_recv() {
            Ok(frame) => Some(Outbound::Frame(frame)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => Some(Outbound::Close(
                self.close
                    .lock()
                    .ok()
                    .and_then(|mut slot| slot.take())
                    .unwrap_or_else(CloseReason::normal),
            )),
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub frames_delivered: u64,
    pub sessions_evicted: u64,
    pub active_sessions: usize,
}

/// Lock-free counters updated on the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    frames_delivered: AtomicU64,
    sessions_evicted: AtomicU64,
}

/// Live sessions grouped by document id.
///
/// Never takes a document lock; callers may hold one while broadcasting.
pub struct ConnectionRegistry {
    documents: RwLock<HashMap<String, HashMap<Uuid, SessionHandle>>>,
    stats: AtomicBroadcastStats,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a session to a document's group.
    pub async fn register(&self, doc_id: &str, session_id: Uuid, handle: SessionHandle) {
        let mut documents = self.documents.write().await;
        documents
            .entry(doc_id.to_string())
            .or_default()
            .insert(session_id, handle);
        log::debug!("Registered session {session_id} on document {doc_id}");
    }

    /// Remove a session. Returns the number of sessions left on the document.
    pub async fn deregister(&self, doc_id: &str, session_id: &Uuid) -> usize {
        let mut documents = self.documents.write().await;
        let remaining = match documents.get_mut(doc_id) {
            Some(sessions) => {
                sessions.remove(session_id);
                sessions.len()
            }
            None => 0,
        };
        if remaining == 0 {
            documents.remove(doc_id);
        }
        remaining
    }

    /// Queue `frame` for every session on `doc_id` except `exclude`.
    ///
    /// Returns how many sessions accepted the frame. Sessions whose queue is
    /// full are evicted and will close with 1013.
    pub async fn broadcast(&self, doc_id: &str, frame: Arc<Vec<u8>>, exclude: Option<Uuid>) -> usize {
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut lagging = Vec::new();
        {
            let documents = self.documents.read().await;
            let Some(sessions) = documents.get(doc_id) else {
                return 0;
            };
            for (session_id, handle) in sessions {
                if Some(*session_id) == exclude {
                    continue;
                }
                match handle.sender.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => lagging.push(*session_id),
                    // Receiver already gone; the session is on its way out
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
        self.stats
            .frames_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);

        if !lagging.is_empty() {
            let mut documents = self.documents.write().await;
            if let Some(sessions) = documents.get_mut(doc_id) {
                for session_id in lagging {
                    if let Some(handle) = sessions.remove(&session_id) {
                        log::warn!(
                            "Evicting lagging session {session_id} on document {doc_id}"
                        );
                        handle.set_close(CloseReason::new(
                            close_code::TRY_AGAIN_LATER,
                            "outbound queue full",
                        ));
                        self.stats.sessions_evicted.fetch_add(1, Ordering::Relaxed);
                    }
                }
                if sessions.is_empty() {
                    documents.remove(doc_id);
                }
            }
        }

        delivered
    }

    /// Drop every session on a document; each closes with `code`.
    ///
    /// Returns the number of sessions closed.
    pub async fn close_document(&self, doc_id: &str, code: u16, reason: &str) -> usize {
        let removed = self.documents.write().await.remove(doc_id);
        match removed {
            Some(sessions) => {
                for handle in sessions.values() {
                    handle.set_close(CloseReason::new(code, reason));
                }
                log::info!(
                    "Closed {} session(s) on document {doc_id} ({code})",
                    sessions.len()
                );
                sessions.len()
            }
            None => 0,
        }
    }

    /// Drop every session on every document.
    pub async fn close_all(&self, code: u16, reason: &str) -> usize {
        let mut documents = self.documents.write().await;
        let mut closed = 0;
        for (_, sessions) in documents.drain() {
            for handle in sessions.values() {
                handle.set_close(CloseReason::new(code, reason));
            }
            closed += sessions.len();
        }
        closed
    }

    pub async fn session_count(&self, doc_id: &str) -> usize {
        self.documents
            .read()
            .await
            .get(doc_id)
            .map_or(0, HashMap::len)
    }

    pub async fn is_registered(&self, doc_id: &str, session_id: &Uuid) -> bool {
        self.documents
            .read()
            .await
            .get(doc_id)
            .is_some_and(|sessions| sessions.contains_key(session_id))
    }

    /// Documents with at least one live session.
    pub async fn active_documents(&self) -> Vec<String> {
        self.documents.read().await.keys().cloned().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let active_sessions = self.documents.read().await.values().map(HashMap::len).sum();
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            sessions_evicted: self.stats.sessions_evicted.load(Ordering::Relaxed),
            active_sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: &[u8]) -> Arc<Vec<u8>> {
        Arc::new(bytes.to_vec())
    }

    #[tokio::test]
    async fn test_register_deregister() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = SessionHandle::channel(4);
        let id = Uuid::new_v4();

        registry.register("doc", id, handle).await;
        assert_eq!(registry.session_count("doc").await, 1);
        assert!(registry.is_registered("doc", &id).await);

        assert_eq!(registry.deregister("doc", &id).await, 0);
        assert_eq!(registry.session_count("doc").await, 0);
        assert!(registry.active_documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_origin() {
        let registry = ConnectionRegistry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (alice_handle, mut alice_rx) = SessionHandle::channel(4);
        let (bob_handle, mut bob_rx) = SessionHandle::channel(4);
        registry.register("doc", alice, alice_handle).await;
        registry.register("doc", bob, bob_handle).await;

        let delivered = registry.broadcast("doc", frame(&[1, 2, 3]), Some(alice)).await;
        assert_eq!(delivered, 1);

        assert_eq!(bob_rx.recv().await, Outbound::Frame(frame(&[1, 2, 3])));
        assert!(alice_rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_isolated_per_document() {
        let registry = ConnectionRegistry::new();
        let (a, mut a_rx) = SessionHandle::channel(4);
        let (b, mut b_rx) = SessionHandle::channel(4);
        registry.register("one", Uuid::new_v4(), a).await;
        registry.register("two", Uuid::new_v4(), b).await;

        registry.broadcast("one", frame(&[7]), None).await;
        assert_eq!(a_rx.recv().await, Outbound::Frame(frame(&[7])));
        assert!(b_rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_frames_keep_order() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = SessionHandle::channel(8);
        registry.register("doc", Uuid::new_v4(), handle).await;

        for i in 0..5u8 {
            registry.broadcast("doc", frame(&[i]), None).await;
        }
        for i in 0..5u8 {
            assert_eq!(rx.recv().await, Outbound::Frame(frame(&[i])));
        }
    }

    #[tokio::test]
    async fn test_full_queue_evicts_only_lagging_session() {
        let registry = ConnectionRegistry::new();
        let slow = Uuid::new_v4();
        let fast = Uuid::new_v4();
        let (slow_handle, mut slow_rx) = SessionHandle::channel(1);
        let (fast_handle, mut fast_rx) = SessionHandle::channel(8);
        registry.register("doc", slow, slow_handle).await;
        registry.register("doc", fast, fast_handle).await;

        registry.broadcast("doc", frame(&[1]), None).await;
        registry.broadcast("doc", frame(&[2]), None).await;

        assert!(!registry.is_registered("doc", &slow).await);
        assert!(registry.is_registered("doc", &fast).await);

        // Backlog drains, then the eviction close
        assert_eq!(slow_rx.recv().await, Outbound::Frame(frame(&[1])));
        match slow_rx.recv().await {
            Outbound::Close(reason) => assert_eq!(reason.code, close_code::TRY_AGAIN_LATER),
            other => panic!("expected close, got {other:?}"),
        }

        assert_eq!(fast_rx.recv().await, Outbound::Frame(frame(&[1])));
        assert_eq!(fast_rx.recv().await, Outbound::Frame(frame(&[2])));

        let stats = registry.stats().await;
        assert_eq!(stats.sessions_evicted, 1);
        assert_eq!(stats.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_send_to_closed_queue_is_ignored() {
        let registry = ConnectionRegistry::new();
        let (gone, gone_rx) = SessionHandle::channel(4);
        let (live, mut live_rx) = SessionHandle::channel(4);
        let gone_id = Uuid::new_v4();
        registry.register("doc", gone_id, gone).await;
        registry.register("doc", Uuid::new_v4(), live).await;
        drop(gone_rx);

        assert_eq!(registry.broadcast("doc", frame(&[9]), None).await, 1);
        assert!(registry.is_registered("doc", &gone_id).await);
        assert_eq!(live_rx.recv().await, Outbound::Frame(frame(&[9])));
    }

    #[tokio::test]
    async fn test_close_document() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = SessionHandle::channel(4);
        registry.register("doc", Uuid::new_v4(), handle).await;

        let closed = registry
            .close_document("doc", close_code::NOT_FOUND, "document deleted")
            .await;
        assert_eq!(closed, 1);
        assert_eq!(
            rx.recv().await,
            Outbound::Close(CloseReason::new(close_code::NOT_FOUND, "document deleted"))
        );
        assert_eq!(registry.close_document("doc", 4004, "again").await, 0);
    }

    #[tokio::test]
    async fn test_deregistered_receiver_closes_normally() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = SessionHandle::channel(4);
        let id = Uuid::new_v4();
        registry.register("doc", id, handle).await;
        registry.deregister("doc", &id).await;

        assert_eq!(rx.recv().await, Outbound::Close(CloseReason::normal()));
    }
}
