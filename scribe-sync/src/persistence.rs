//! Write-back of live documents to the durable store.
//!
//! ```text
//!  wire Update ──► schedule(doc) ──► timer (debounce) ──┐
//!                     ▲ re-arm aborts the older timer   │
//!                                                       ▼
//!  direct edit ──► persist_now(doc) ──────────► write_snapshot
//!                                                 │ persist_lock
//!                                                 │ serialize_full
//!                                                 ▼
//!                                        store.update_snapshot (blocking pool)
//! ```
//!
//! Each pending timer is an explicit handle tagged with a generation. A
//! timer only writes if its generation is still the one registered for the
//! document, so a burst of K edits inside the quiet window costs one write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::cache::LiveDocument;
use crate::error::SyncError;
use crate::store::{now_millis, DocumentStore};

struct PendingPersist {
    generation: u64,
    document: Arc<LiveDocument>,
    handle: JoinHandle<()>,
}

/// Persistence counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub snapshots_written: u64,
    pub failures: u64,
    pub timers_superseded: u64,
}

#[derive(Default)]
struct AtomicPersistStats {
    snapshots_written: AtomicU64,
    failures: AtomicU64,
    timers_superseded: AtomicU64,
}

/// Debounced and on-demand snapshot writer.
pub struct PersistenceScheduler {
    store: Arc<dyn DocumentStore>,
    debounce: Duration,
    timers: Arc<Mutex<HashMap<String, PendingPersist>>>,
    next_generation: AtomicU64,
    stats: Arc<AtomicPersistStats>,
}

impl PersistenceScheduler {
    pub fn new(store: Arc<dyn DocumentStore>, debounce: Duration) -> Self {
        Self {
            store,
            debounce,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            stats: Arc::new(AtomicPersistStats::default()),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// (Re)start the quiet-window timer for a document.
    pub async fn schedule(&self, document: &Arc<LiveDocument>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let id = document.id().to_string();

        let handle = {
            let timers = self.timers.clone();
            let store = self.store.clone();
            let stats = self.stats.clone();
            let document = document.clone();
            let debounce = self.debounce;
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                {
                    let mut timers = timers.lock().await;
                    match timers.get(&id) {
                        Some(pending) if pending.generation == generation => {
                            timers.remove(&id);
                        }
                        _ => return,
                    }
                }
                if let Err(e) = write_snapshot(&store, &document, &stats, false).await {
                    log::error!("Debounced persist of document {id} failed: {e}");
                }
            })
        };

        let mut timers = self.timers.lock().await;
        let previous = timers.insert(
            id,
            PendingPersist {
                generation,
                document: document.clone(),
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
            self.stats.timers_superseded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Cancel any pending timer and write the snapshot before returning.
    ///
    /// Returns `false` when the durable record no longer exists. On failure
    /// the debounced timer is re-armed so the write is retried.
    /// Must not be called while holding the document's state lock.
    pub async fn persist_now(&self, document: &Arc<LiveDocument>) -> Result<bool, SyncError> {
        self.cancel(document.id()).await;
        match write_snapshot(&self.store, document, &self.stats, false).await {
            Ok(written) => Ok(written),
            Err(e) => {
                log::error!("Persist of document {} failed: {e}", document.id());
                self.schedule(document).await;
                Err(e)
            }
        }
    }

    /// Mark a document retired and write its final snapshot.
    ///
    /// Later writes of the instance (stale timers, direct edits finishing
    /// after this point) are skipped. A failed write leaves it live.
    /// Must not be called while holding the document's state lock.
    pub async fn retire(&self, document: &Arc<LiveDocument>) -> Result<bool, SyncError> {
        self.cancel(document.id()).await;
        match write_snapshot(&self.store, document, &self.stats, true).await {
            Ok(written) => Ok(written),
            Err(e) => {
                log::error!("Final persist of document {} failed: {e}", document.id());
                document.set_retired(false);
                Err(e)
            }
        }
    }

    /// Fire pending timers now: one document, or all of them.
    ///
    /// Returns how many snapshots were written. Every pending document is
    /// attempted; the first failure is returned after the rest are tried.
    pub async fn flush(&self, id: Option<&str>) -> Result<usize, SyncError> {
        let claimed: Vec<PendingPersist> = {
            let mut timers = self.timers.lock().await;
            match id {
                Some(id) => timers.remove(id).into_iter().collect(),
                None => timers.drain().map(|(_, pending)| pending).collect(),
            }
        };

        let mut written = 0;
        let mut first_error = None;
        for pending in claimed {
            pending.handle.abort();
            match write_snapshot(&self.store, &pending.document, &self.stats, false).await {
                Ok(_) => written += 1,
                Err(e) => {
                    log::error!("Flush of document {} failed: {e}", pending.document.id());
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Drop a document's pending timer without writing.
    pub async fn cancel(&self, id: &str) -> bool {
        match self.timers.lock().await.remove(id) {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Drop every pending timer without writing.
    pub async fn cancel_all(&self) -> usize {
        let mut timers = self.timers.lock().await;
        let count = timers.len();
        for (_, pending) in timers.drain() {
            pending.handle.abort();
        }
        count
    }

    pub async fn is_pending(&self, id: &str) -> bool {
        self.timers.lock().await.contains_key(id)
    }

    pub async fn pending_count(&self) -> usize {
        self.timers.lock().await.len()
    }

    pub fn stats(&self) -> PersistStats {
        PersistStats {
            snapshots_written: self.stats.snapshots_written.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            timers_superseded: self.stats.timers_superseded.load(Ordering::Relaxed),
        }
    }
}

/// Serialize and store one document's full state.
///
/// Returns `false` when the durable record no longer exists (deleted
/// document); nothing is written then. A retired instance is skipped, its
/// final state having been written (or discarded) when it was retired.
/// With `retire` set the instance is retired under its state lock first.
async fn write_snapshot(
    store: &Arc<dyn DocumentStore>,
    document: &LiveDocument,
    stats: &AtomicPersistStats,
    retire: bool,
) -> Result<bool, SyncError> {
    let _persist = document.persist_lock().lock().await;
    let snapshot = {
        let state = document.state().lock().await;
        if retire {
            document.set_retired(true);
        } else if document.is_retired() {
            log::debug!("Skipped persist of retired document {}", document.id());
            return Ok(true);
        }
        state.serialize_full()
    };
    let updated_at = now_millis();

    let store = store.clone();
    let id = document.id().to_string();
    let result = tokio::task::spawn_blocking(move || {
        store.update_snapshot(&id, &snapshot, updated_at)
    })
    .await;

    match result {
        Ok(Ok(written)) => {
            if written {
                stats.snapshots_written.fetch_add(1, Ordering::Relaxed);
                log::debug!("Persisted snapshot of document {}", document.id());
            } else {
                log::debug!("Skipped persist of deleted document {}", document.id());
            }
            Ok(written)
        }
        Ok(Err(e)) => {
            stats.failures.fetch_add(1, Ordering::Relaxed);
            Err(e.into())
        }
        Err(e) => {
            stats.failures.fetch_add(1, Ordering::Relaxed);
            Err(e.into())
        }
    }
}
