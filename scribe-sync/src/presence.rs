//! Presence (awareness) tracking for live documents.
//!
//! Awareness payloads use the y-protocols layout:
//!
//! ```text
//! varint count
//! repeat count:
//!     varint client_id
//!     varint clock
//!     varstring state JSON   ("null" = client left)
//! ```
//!
//! The server keeps the latest state per client (last writer wins by
//! clock) so it can hand a snapshot to sessions that join later, and it
//! remembers which session announced which clients so their entries can be
//! retracted when the session closes. Payloads are relayed to other
//! sessions as received; presence is never persisted.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::protocol::{write_string, write_var, ProtocolError, Reader};

/// One client's entry in an awareness payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    /// `None` announces that the client left
    pub state: Option<Value>,
}

/// A decoded awareness payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_var(&mut buf, self.entries.len() as u64);
        for entry in &self.entries {
            write_var(&mut buf, entry.client_id);
            write_var(&mut buf, entry.clock);
            let json = match &entry.state {
                Some(state) => state.to_string(),
                None => "null".to_string(),
            };
            write_string(&mut buf, &json);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(bytes);
        let count = reader.read_var()?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let client_id = reader.read_var()?;
            let clock = reader.read_var()?;
            let json = reader.read_string()?;
            let state: Value = serde_json::from_str(json)
                .map_err(|e| ProtocolError::InvalidAwarenessState(e.to_string()))?;
            entries.push(AwarenessEntry {
                client_id,
                clock,
                state: if state.is_null() { None } else { Some(state) },
            });
        }
        if reader.remaining() > 0 {
            return Err(ProtocolError::TrailingBytes(reader.remaining()));
        }
        Ok(Self { entries })
    }
}

/// Latest known state of one client.
#[derive(Debug, Clone, PartialEq)]
struct PresenceEntry {
    clock: u64,
    state: Option<Value>,
}

/// Presence state of one document.
#[derive(Debug, Default)]
pub struct PresenceRoom {
    clients: HashMap<u64, PresenceEntry>,
    /// Client ids announced through each session
    owners: HashMap<Uuid, HashSet<u64>>,
}

impl PresenceRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an update received from `session_id`.
    ///
    /// Returns the number of entries that changed the room.
    pub fn apply(&mut self, session_id: Uuid, update: &AwarenessUpdate) -> usize {
        let mut changed = 0;
        for entry in &update.entries {
            let accept = match self.clients.get(&entry.client_id) {
                None => true,
                Some(current) => {
                    current.clock < entry.clock
                        || (current.clock == entry.clock
                            && entry.state.is_none()
                            && current.state.is_some())
                }
            };
            if !accept {
                log::trace!(
                    "Ignoring stale awareness for client {} (clock {})",
                    entry.client_id,
                    entry.clock
                );
                continue;
            }
            self.clients.insert(
                entry.client_id,
                PresenceEntry {
                    clock: entry.clock,
                    state: entry.state.clone(),
                },
            );
            let owned = self.owners.entry(session_id).or_default();
            if entry.state.is_some() {
                owned.insert(entry.client_id);
            } else {
                owned.remove(&entry.client_id);
            }
            changed += 1;
        }
        changed
    }

    /// Retract every client announced through `session_id`.
    ///
    /// Returns the removal payload to broadcast, if anything was retracted.
    pub fn remove_session(&mut self, session_id: &Uuid) -> Option<AwarenessUpdate> {
        let owned = self.owners.remove(session_id)?;
        let mut entries = Vec::new();
        for client_id in owned {
            if let Some(current) = self.clients.get_mut(&client_id) {
                if current.state.is_none() {
                    continue;
                }
                // At u64::MAX the equal-clock removal still wins
                current.clock = current.clock.saturating_add(1);
                current.state = None;
                entries.push(AwarenessEntry {
                    client_id,
                    clock: current.clock,
                    state: None,
                });
            }
        }
        if entries.is_empty() {
            None
        } else {
            entries.sort_by_key(|e| e.client_id);
            Some(AwarenessUpdate { entries })
        }
    }

    /// Every client currently present, or `None` when nobody is.
    pub fn snapshot(&self) -> Option<AwarenessUpdate> {
        let mut entries: Vec<AwarenessEntry> = self
            .clients
            .iter()
            .filter_map(|(client_id, entry)| {
                entry.state.as_ref().map(|state| AwarenessEntry {
                    client_id: *client_id,
                    clock: entry.clock,
                    state: Some(state.clone()),
                })
            })
            .collect();
        if entries.is_empty() {
            return None;
        }
        entries.sort_by_key(|e| e.client_id);
        Some(AwarenessUpdate { entries })
    }

    /// Current state of one client.
    pub fn state(&self, client_id: u64) -> Option<&Value> {
        self.clients.get(&client_id)?.state.as_ref()
    }

    /// Number of clients currently present.
    pub fn client_count(&self) -> usize {
        self.clients.values().filter(|e| e.state.is_some()).count()
    }
}

/// Presence rooms keyed by document id.
#[derive(Default)]
pub struct PresenceRegistry {
    rooms: Mutex<HashMap<String, PresenceRoom>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and merge a payload from a session.
    pub async fn apply(
        &self,
        doc_id: &str,
        session_id: Uuid,
        payload: &[u8],
    ) -> Result<usize, ProtocolError> {
        let update = AwarenessUpdate::decode(payload)?;
        let mut rooms = self.rooms.lock().await;
        Ok(rooms
            .entry(doc_id.to_string())
            .or_default()
            .apply(session_id, &update))
    }

    /// Encoded snapshot of a document's presence.
    pub async fn snapshot(&self, doc_id: &str) -> Option<Vec<u8>> {
        let rooms = self.rooms.lock().await;
        rooms
            .get(doc_id)
            .and_then(PresenceRoom::snapshot)
            .map(|update| update.encode())
    }

    /// Retract a closed session's clients; returns the encoded removal.
    pub async fn remove_session(&self, doc_id: &str, session_id: &Uuid) -> Option<Vec<u8>> {
        let mut rooms = self.rooms.lock().await;
        rooms
            .get_mut(doc_id)
            .and_then(|room| room.remove_session(session_id))
            .map(|update| update.encode())
    }

    /// Forget a document's presence entirely.
    pub async fn drop_document(&self, doc_id: &str) {
        if self.rooms.lock().await.remove(doc_id).is_some() {
            log::trace!("Dropped presence for document {doc_id}");
        }
    }

    pub async fn client_count(&self, doc_id: &str) -> usize {
        self.rooms
            .lock()
            .await
            .get(doc_id)
            .map_or(0, PresenceRoom::client_count)
    }

    pub async fn has_document(&self, doc_id: &str) -> bool {
        self.rooms.lock().await.contains_key(doc_id)
    }
}
