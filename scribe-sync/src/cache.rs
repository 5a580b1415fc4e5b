//! Registry of live documents with single-flight loading.
//!
//! ```text
//!   get(id) ──► cached? ──yes──► Arc<LiveDocument>
//!                 │ no
//!                 ▼
//!            load pending? ──yes──► await the shared load
//!                 │ no
//!                 ▼
//!            spawn load task ── store.get (blocking pool)
//!                 │               deserialize
//!                 ▼               register (unless discarded)
//!            await the shared load
//! ```
//!
//! The load runs as its own task, so a caller that gives up does not strand
//! the others waiting on the same load. Exactly one `LiveDocument` exists per
//! id; every mutation path goes through it.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::broadcast::ConnectionRegistry;
use crate::document::CrdtDocument;
use crate::error::SyncError;
use crate::persistence::PersistenceScheduler;
use crate::protocol::close_code;
use crate::store::{now_millis, DocumentRecord, DocumentStore};

/// One resident document.
pub struct LiveDocument {
    id: String,
    scope_id: String,
    name: String,
    created_at: u64,
    state: Mutex<CrdtDocument>,
    persist_lock: Mutex<()>,
    /// Set once the instance leaves the cache; it accepts no further edits
    retired: AtomicBool,
}

impl LiveDocument {
    pub fn new(
        id: impl Into<String>,
        scope_id: impl Into<String>,
        name: impl Into<String>,
        created_at: u64,
        document: CrdtDocument,
    ) -> Self {
        Self {
            id: id.into(),
            scope_id: scope_id.into(),
            name: name.into(),
            created_at,
            state: Mutex::new(document),
            persist_lock: Mutex::new(()),
            retired: AtomicBool::new(false),
        }
    }

    /// An empty, unpersisted document.
    pub fn empty(id: &str, scope_id: &str, name: &str) -> Self {
        Self::new(id, scope_id, name, now_millis(), CrdtDocument::new())
    }

    fn from_record(record: &DocumentRecord) -> Result<Self, SyncError> {
        let document = CrdtDocument::deserialize(&record.snapshot)?;
        Ok(Self::new(
            record.id.clone(),
            record.scope_id.clone(),
            record.name.clone(),
            record.created_at,
            document,
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// The document lock. Holding it is the critical section of one edit.
    pub fn state(&self) -> &Mutex<CrdtDocument> {
        &self.state
    }

    pub(crate) fn persist_lock(&self) -> &Mutex<()> {
        &self.persist_lock
    }

    /// Whether this instance was evicted, deleted or cleared. Check it while
    /// holding the document lock; edits must not land on a retired instance.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Call with the document lock held.
    pub(crate) fn set_retired(&self, retired: bool) {
        self.retired.store(retired, Ordering::Release);
    }

    pub async fn text(&self) -> String {
        self.state.lock().await.materialize()
    }

    pub async fn snapshot(&self) -> Vec<u8> {
        self.state.lock().await.serialize_full()
    }
}

/// Parameters for a new document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewDocument {
    /// Generated (UUID v4) when absent
    pub id: Option<String>,
    pub name: String,
    pub content: Option<String>,
    pub scope_id: String,
}

type LoadResult = Result<Arc<LiveDocument>, SyncError>;
type PendingLoad = Shared<BoxFuture<'static, LoadResult>>;

#[derive(Default)]
struct CacheState {
    docs: HashMap<String, Arc<LiveDocument>>,
    /// Load ticket and shared future per id
    pending: HashMap<String, (u64, PendingLoad)>,
}

/// Per-id registry of loaded documents.
pub struct DocumentCache {
    store: Arc<dyn DocumentStore>,
    scheduler: Arc<PersistenceScheduler>,
    registry: Arc<ConnectionRegistry>,
    state: Arc<Mutex<CacheState>>,
    next_ticket: AtomicU64,
}

impl DocumentCache {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        scheduler: Arc<PersistenceScheduler>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            store,
            scheduler,
            registry,
            state: Arc::new(Mutex::new(CacheState::default())),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Resolve a document, loading it from the store at most once.
    pub async fn get(&self, id: &str) -> LoadResult {
        let pending = {
            let mut state = self.state.lock().await;
            if let Some(document) = state.docs.get(id) {
                return Ok(document.clone());
            }
            match state.pending.get(id) {
                Some((_, pending)) => pending.clone(),
                None => {
                    let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                    let task = tokio::spawn(load(
                        self.store.clone(),
                        self.state.clone(),
                        id.to_string(),
                        ticket,
                    ));
                    let pending = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(SyncError::from(e)),
                        }
                    }
                    .boxed()
                    .shared();
                    state
                        .pending
                        .insert(id.to_string(), (ticket, pending.clone()));
                    pending
                }
            }
        };
        pending.await
    }

    /// Create, persist and cache a new document.
    pub async fn create(&self, new: NewDocument) -> Result<DocumentRecord, SyncError> {
        let id = new.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.state.lock().await.docs.contains_key(&id) {
            return Err(SyncError::Conflict(id));
        }

        let document = CrdtDocument::with_content(new.content.as_deref().unwrap_or(""));
        let now = now_millis();
        let record = DocumentRecord {
            id: id.clone(),
            scope_id: new.scope_id,
            name: new.name,
            snapshot: document.serialize_full(),
            created_at: now,
            updated_at: now,
        };

        let store = self.store.clone();
        let row = record.clone();
        tokio::task::spawn_blocking(move || store.insert_if_absent(&row)).await??;

        let live = Arc::new(LiveDocument::new(
            id.clone(),
            record.scope_id.clone(),
            record.name.clone(),
            record.created_at,
            document,
        ));
        // A reader may have loaded the fresh row already; keep its instance
        self.state.lock().await.docs.entry(id.clone()).or_insert(live);
        log::info!("Created document {id} in scope {}", record.scope_id);
        Ok(record)
    }

    /// Evict, stop persistence, close sessions, then delete the record.
    ///
    /// Returns whether a durable record existed.
    pub async fn delete(&self, id: &str) -> Result<bool, SyncError> {
        {
            let mut state = self.state.lock().await;
            // A load still in flight will find its ticket gone and discard
            state.pending.remove(id);
            if let Some(document) = state.docs.remove(id) {
                let _guard = document.state().lock().await;
                document.set_retired(true);
            }
        }
        self.scheduler.cancel(id).await;
        self.registry
            .close_document(id, close_code::NOT_FOUND, "document deleted")
            .await;

        let store = self.store.clone();
        let key = id.to_string();
        let existed = tokio::task::spawn_blocking(move || store.delete(&key)).await??;
        if existed {
            log::info!("Deleted document {id}");
        }
        Ok(existed)
    }

    /// Write a document's final snapshot and drop it from memory.
    ///
    /// Its sessions are closed with 1001 so clients reconnect to the next
    /// instance. The cache stays locked until the write completes, so a
    /// concurrent `get` loads the evicted state rather than an older row.
    /// On a failed write the instance stays cached and live.
    pub async fn evict(&self, id: &str) -> Result<bool, SyncError> {
        let mut state = self.state.lock().await;
        let Some(document) = state.docs.get(id).cloned() else {
            return Ok(false);
        };
        // 1001: going away
        self.registry
            .close_document(id, 1001, "document evicted")
            .await;
        self.scheduler.retire(&document).await?;
        state.docs.remove(id);
        log::debug!("Evicted document {id}");
        Ok(true)
    }

    /// Drop every cached instance and pending load; cancel all timers.
    ///
    /// Unwritten edits are discarded and open sessions are closed.
    pub async fn clear(&self) {
        {
            let mut state = self.state.lock().await;
            state.pending.clear();
            for (_, document) in state.docs.drain() {
                let _guard = document.state().lock().await;
                document.set_retired(true);
            }
        }
        let cancelled = self.scheduler.cancel_all().await;
        self.registry
            .close_all(1001, "document cache cleared")
            .await;
        log::debug!("Cleared document cache ({cancelled} pending persists cancelled)");
    }

    pub async fn is_cached(&self, id: &str) -> bool {
        self.state.lock().await.docs.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn load(
    store: Arc<dyn DocumentStore>,
    state: Arc<Mutex<CacheState>>,
    id: String,
    ticket: u64,
) -> LoadResult {
    let key = id.clone();
    let loaded = match tokio::task::spawn_blocking(move || store.get(&key)).await {
        Ok(Ok(Some(record))) => LiveDocument::from_record(&record).map(Arc::new),
        Ok(Ok(None)) => Err(SyncError::NotFound(id.clone())),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(e.into()),
    };

    let mut state = state.lock().await;
    let current = matches!(state.pending.get(&id), Some((t, _)) if *t == ticket);
    if !current {
        log::debug!("Discarding superseded load of document {id}");
        return Err(SyncError::NotFound(id));
    }
    state.pending.remove(&id);

    let document = loaded?;
    state.docs.insert(id.clone(), document.clone());
    log::info!("Loaded document {id}");
    Ok(document)
}
