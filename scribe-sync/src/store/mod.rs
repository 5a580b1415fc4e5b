//! Durable document store.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐   insert / update   ┌──────────────────────────┐
//! │ DocumentCache    │ ──────────────────► │ dyn DocumentStore        │
//! │ Persistence      │ ◄────────────────── │  ├── RocksStore (disk)   │
//! │ Scheduler        │   get / delete      │  └── MemoryStore (tests) │
//! └──────────────────┘                     └──────────────────────────┘
//! ```
//!
//! The store owns id uniqueness: `insert_if_absent` reports a duplicate id
//! as [`StoreError::Conflict`] even when the in-memory cache has never seen
//! the document. Implementations are blocking; async callers run them on
//! `tokio::task::spawn_blocking`.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// A persisted document row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    /// Tenant / workspace the document belongs to
    pub scope_id: String,
    pub name: String,
    /// Full yrs state encoded as a v1 update
    pub snapshot: Vec<u8>,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    /// Milliseconds since the Unix epoch
    pub updated_at: u64,
}

impl DocumentRecord {
    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

/// The `{id, name}` view handed to direct callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: String,
    pub name: String,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A record with this id already exists
    #[error("document already exists: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    /// Store could not be reached (or was told to fail)
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Contract of the durable store consumed by the sync engine.
pub trait DocumentStore: Send + Sync + 'static {
    /// Insert a new record; `Conflict` if the id is taken.
    fn insert_if_absent(&self, record: &DocumentRecord) -> Result<(), StoreError>;

    /// Select a record by id.
    fn get(&self, id: &str) -> Result<Option<DocumentRecord>, StoreError>;

    /// Overwrite the snapshot and `updated_at` of an existing record.
    ///
    /// Returns `false` when no record has this id; nothing is written then.
    fn update_snapshot(&self, id: &str, snapshot: &[u8], updated_at: u64)
        -> Result<bool, StoreError>;

    /// Delete a record; returns whether one existed.
    fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// All records of a scope, without their snapshots.
    fn list_by_scope(&self, scope_id: &str) -> Result<Vec<DocumentSummary>, StoreError>;
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Conflict("doc-1".into());
        assert_eq!(err.to_string(), "document already exists: doc-1");

        let err = StoreError::Database("disk full".into());
        assert!(err.to_string().contains("database error"));
    }

    #[test]
    fn test_record_summary() {
        let record = DocumentRecord {
            id: "d1".into(),
            scope_id: "team".into(),
            name: "Notes".into(),
            snapshot: vec![0, 0],
            created_at: 1,
            updated_at: 2,
        };
        assert_eq!(
            record.summary(),
            DocumentSummary {
                id: "d1".into(),
                name: "Notes".into()
            }
        );
    }

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01 in milliseconds
        assert!(now_millis() > 1_577_836_800_000);
    }
}
