//! # scribe-sync, real-time markdown document synchronization
//!
//! Humans (over WebSocket) and in-process collaborators such as an AI agent
//! edit the same markdown documents concurrently. Documents are yrs CRDTs,
//! so replicas converge no matter how edits interleave, and snapshots are
//! written back to a durable store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐    direct calls
//! │ SyncClient  │ ◄─────────────────► │ SyncSession │    (agent, REST)
//! │ (replica)   │   Yjs sync proto   └──────┬──────┘          │
//! └─────────────┘                           ▼                 ▼
//!                                   ┌──────────────────────────────┐
//!                                   │ DocumentService              │
//!                                   └──┬──────────┬─────────────┬──┘
//!                                      ▼          ▼             ▼
//!                              DocumentCache  Connection   Persistence
//!                              (single-flight) Registry    Scheduler
//!                                      │      (fan-out)    (debounce)
//!                                      ▼                        │
//!                                 CrdtDocument                  ▼
//!                                                        DocumentStore
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: varint wire framing (Sync / Awareness)
//! - [`document`]: CRDT document wrapper
//! - [`store`]: durable store contract, RocksDB and in-memory backends
//! - [`cache`]: live documents with single-flight loading
//! - [`persistence`]: debounced and synchronous write-back
//! - [`broadcast`]: per-document session registry and fan-out
//! - [`presence`]: awareness state per document
//! - [`session`]: per-connection protocol state machine
//! - [`service`]: mutation API shared by sessions and direct callers
//! - [`server`]: WebSocket accept loop
//! - [`client`]: WebSocket client with a local replica

pub mod auth;
pub mod broadcast;
pub mod cache;
pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod service;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use auth::{AuthError, Authenticator, Credentials, Identity, StaticTokenAuthenticator, TokenGrant};
pub use broadcast::{BroadcastStats, ConnectionRegistry, Outbound, SessionHandle, SessionReceiver};
pub use cache::{DocumentCache, LiveDocument, NewDocument};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};
pub use config::{ConfigError, ServerConfig};
pub use document::{CrdtDocument, DocumentError, LocalEdit};
pub use error::SyncError;
pub use persistence::{PersistStats, PersistenceScheduler};
pub use presence::{AwarenessEntry, AwarenessUpdate, PresenceRegistry, PresenceRoom};
pub use protocol::{close_code, Message, ProtocolError, SyncMessage};
pub use server::{ConnectionKind, ServerStats, SyncServer};
pub use service::{DeleteOutcome, DocumentEvent, DocumentService, EditOutcome};
pub use session::{SessionState, SyncSession};
pub use store::{
    DocumentRecord, DocumentStore, DocumentSummary, MemoryStore, RocksStore, StoreConfig,
    StoreError,
};
