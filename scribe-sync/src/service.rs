//! The single mutation entry point.
//!
//! Wire updates from sync sessions and direct calls from in-process
//! collaborators (agent tools, REST handlers) both land here and go through
//! the same cached [`LiveDocument`], so connected clients see direct edits
//! as ordinary Update broadcasts.
//!
//! One logical edit is one critical section under the document lock:
//! apply, then queue the broadcast, then schedule persistence. Direct calls
//! additionally write the snapshot before returning (after the lock is
//! released); wire updates are persisted on the debounce timer.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::auth::Identity;
use crate::broadcast::ConnectionRegistry;
use crate::cache::{DocumentCache, LiveDocument, NewDocument};
use crate::config::ServerConfig;
use crate::document::{CrdtDocument, DocumentError, LocalEdit};
use crate::error::{Result, SyncError};
use crate::persistence::PersistenceScheduler;
use crate::presence::PresenceRegistry;
use crate::protocol::Message;
use crate::store::{DocumentStore, DocumentSummary, MemoryStore};

/// Result of a find/replace edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOutcome {
    /// `false` when the search text was not found
    pub applied: bool,
}

/// Result of a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Document lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentEvent {
    Created {
        id: String,
        name: String,
        scope_id: String,
    },
    Deleted {
        id: String,
        scope_id: String,
    },
}

impl DocumentEvent {
    pub fn scope_id(&self) -> &str {
        match self {
            DocumentEvent::Created { scope_id, .. } | DocumentEvent::Deleted { scope_id, .. } => {
                scope_id
            }
        }
    }
}

const EVENT_CAPACITY: usize = 256;

pub struct DocumentService {
    config: ServerConfig,
    store: Arc<dyn DocumentStore>,
    cache: DocumentCache,
    scheduler: Arc<PersistenceScheduler>,
    registry: Arc<ConnectionRegistry>,
    presence: PresenceRegistry,
    events: broadcast::Sender<DocumentEvent>,
}

impl DocumentService {
    pub fn new(store: Arc<dyn DocumentStore>, config: ServerConfig) -> Self {
        let scheduler = Arc::new(PersistenceScheduler::new(
            store.clone(),
            config.persist_debounce,
        ));
        let registry = Arc::new(ConnectionRegistry::new());
        let cache = DocumentCache::new(store.clone(), scheduler.clone(), registry.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            store,
            cache,
            scheduler,
            registry,
            presence: PresenceRegistry::new(),
            events,
        }
    }

    /// Service over a fresh [`MemoryStore`].
    pub fn in_memory(config: ServerConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    // ── Direct API ────────────────────────────────────────────────

    /// Current markdown text.
    pub async fn read(&self, id: &str) -> Result<String> {
        Ok(self.cache.get(id).await?.text().await)
    }

    /// Replace the first occurrence of `old` with `new`.
    pub async fn edit(&self, id: &str, old: &str, new: &str) -> Result<EditOutcome> {
        let applied = self
            .mutate(id, |doc| {
                if old.is_empty() {
                    return Ok(None);
                }
                let text = doc.materialize();
                match text.find(old) {
                    Some(index) => doc.apply_local_edit(LocalEdit::Replace {
                        index: index as u32,
                        len: old.len() as u32,
                        text: new.to_string(),
                    }),
                    None => Ok(None),
                }
            })
            .await?;
        if !applied {
            log::debug!("Edit on document {id} not applied: search text absent");
        }
        Ok(EditOutcome { applied })
    }

    pub async fn append(&self, id: &str, content: &str) -> Result<()> {
        self.mutate(id, |doc| {
            doc.apply_local_edit(LocalEdit::Append {
                text: content.to_string(),
            })
        })
        .await?;
        Ok(())
    }

    pub async fn replace_all(&self, id: &str, content: &str) -> Result<()> {
        self.mutate(id, |doc| {
            doc.apply_local_edit(LocalEdit::ReplaceAll {
                text: content.to_string(),
            })
        })
        .await?;
        Ok(())
    }

    /// Apply an arbitrary local edit (index based).
    pub async fn apply_edit(&self, id: &str, edit: LocalEdit) -> Result<bool> {
        self.mutate(id, |doc| doc.apply_local_edit(edit.clone())).await
    }

    pub async fn create(&self, new: NewDocument) -> Result<DocumentSummary> {
        let record = self.cache.create(new).await?;
        let _ = self.events.send(DocumentEvent::Created {
            id: record.id.clone(),
            name: record.name.clone(),
            scope_id: record.scope_id.clone(),
        });
        Ok(record.summary())
    }

    pub async fn delete(&self, id: &str) -> Result<DeleteOutcome> {
        let store = self.store.clone();
        let key = id.to_string();
        let record = tokio::task::spawn_blocking(move || store.get(&key)).await??;

        let existed = self.cache.delete(id).await?;
        self.presence.drop_document(id).await;

        match record {
            Some(record) if existed => {
                let _ = self.events.send(DocumentEvent::Deleted {
                    id: record.id,
                    scope_id: record.scope_id,
                });
                Ok(DeleteOutcome {
                    success: true,
                    error: None,
                })
            }
            _ => Ok(DeleteOutcome {
                success: false,
                error: Some(SyncError::NotFound(id.to_string()).to_string()),
            }),
        }
    }

    /// Ids and names of every document in a scope.
    pub async fn list(&self, scope_id: &str) -> Result<Vec<DocumentSummary>> {
        let store = self.store.clone();
        let scope = scope_id.to_string();
        let mut summaries =
            tokio::task::spawn_blocking(move || store.list_by_scope(&scope)).await??;
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(summaries)
    }

    /// One direct edit: apply and broadcast under the document lock, then
    /// persist synchronously. Returns whether the document changed.
    ///
    /// An instance retired between lookup and lock is looked up again, so an
    /// evicted document is reloaded and a deleted one reports `NotFound`.
    async fn mutate<F>(&self, id: &str, edit: F) -> Result<bool>
    where
        F: Fn(&CrdtDocument) -> std::result::Result<Option<Vec<u8>>, DocumentError>,
    {
        loop {
            let document = self.cache.get(id).await?;
            let changed = {
                let state = document.state().lock().await;
                if document.is_retired() {
                    continue;
                }
                match edit(&*state)? {
                    Some(delta) => {
                        self.broadcast_update(id, delta, None).await;
                        true
                    }
                    None => false,
                }
            };
            if changed && !self.scheduler.persist_now(&document).await? {
                // Record removed underneath the cached instance
                return Err(SyncError::NotFound(id.to_string()));
            }
            return Ok(changed);
        }
    }

    // ── Wire path ─────────────────────────────────────────────────

    /// Resolve the document a sync session wants to join.
    pub async fn open_session(&self, id: &str, identity: &Identity) -> Result<Arc<LiveDocument>> {
        let document = self.cache.get(id).await?;
        if document.scope_id() != identity.scope_id {
            return Err(SyncError::Forbidden(format!(
                "document {id} is not in scope {}",
                identity.scope_id
            )));
        }
        Ok(document)
    }

    /// Merge a delta received from a session and fan it out to the others.
    pub async fn apply_wire_update(
        &self,
        document: &Arc<LiveDocument>,
        origin: Uuid,
        delta: &[u8],
    ) -> Result<()> {
        let state = document.state().lock().await;
        if document.is_retired() {
            return Err(SyncError::NotFound(document.id().to_string()));
        }
        state.apply_remote_update(delta)?;
        self.broadcast_update(document.id(), delta.to_vec(), Some(origin))
            .await;
        self.scheduler.schedule(document).await;
        drop(state);
        Ok(())
    }

    async fn broadcast_update(&self, id: &str, delta: Vec<u8>, exclude: Option<Uuid>) -> usize {
        let frame = Arc::new(Message::update(delta).encode());
        self.registry.broadcast(id, frame, exclude).await
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    pub fn subscribe_events(&self) -> broadcast::Receiver<DocumentEvent> {
        self.events.subscribe()
    }

    /// Write every pending debounced snapshot now.
    pub async fn flush(&self, id: Option<&str>) -> Result<usize> {
        self.scheduler.flush(id).await
    }

    /// Drop every cached document, cancel pending timers and close sessions.
    pub async fn clear(&self) {
        self.cache.clear().await;
    }

    /// Flush pending writes and close every session.
    pub async fn shutdown(&self) -> Result<usize> {
        let flushed = self.scheduler.flush(None).await?;
        // 1001: going away
        self.registry.close_all(1001, "server shutting down").await;
        Ok(flushed)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn scheduler(&self) -> &Arc<PersistenceScheduler> {
        &self.scheduler
    }
}
