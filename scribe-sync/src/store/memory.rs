//! In-process document store.
//!
//! Used by ephemeral servers and tests. Counts reads and writes so callers
//! can assert how often the durable layer was touched, and can be told to
//! slow down reads or fail writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use super::{DocumentRecord, DocumentStore, DocumentSummary, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, DocumentRecord>>,
    reads: AtomicU64,
    writes: AtomicU64,
    read_delay_ms: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls served.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of successful snapshot writes (inserts and updates).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Sleep this long inside every `get`.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every write fail with `Unavailable` until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Database("memory store lock poisoned".into())
}

impl DocumentStore for MemoryStore {
    fn insert_if_absent(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut records = self.records.write().map_err(poisoned)?;
        if records.contains_key(&record.id) {
            return Err(StoreError::Conflict(record.id.clone()));
        }
        records.insert(record.id.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(id).cloned())
    }

    fn update_snapshot(
        &self,
        id: &str,
        snapshot: &[u8],
        updated_at: u64,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut records = self.records.write().map_err(poisoned)?;
        match records.get_mut(id) {
            Some(record) => {
                record.snapshot = snapshot.to_vec();
                record.updated_at = updated_at;
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        Ok(records.remove(id).is_some())
    }

    fn list_by_scope(&self, scope_id: &str) -> Result<Vec<DocumentSummary>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .values()
            .filter(|r| r.scope_id == scope_id)
            .map(DocumentRecord::summary)
            .collect())
    }
}
