//! CRDT-backed markdown document.
//!
//! A [`CrdtDocument`] wraps one `yrs::Doc` whose root text `content` holds the
//! markdown body. Every local edit runs in a single yrs transaction and yields
//! the v1 update it produced, so peers receive one delta per logical edit.
//!
//! Text indexes are UTF-8 byte offsets and must land on char boundaries.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, Transact, Update, WriteTxn,
};

/// Name of the root text holding the markdown body.
pub const CONTENT_TEXT: &str = "content";

/// A local edit against the materialized text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEdit {
    Insert { index: u32, text: String },
    Delete { index: u32, len: u32 },
    /// Delete `len` bytes at `index` and insert `text` in their place.
    Replace { index: u32, len: u32, text: String },
    Append { text: String },
    ReplaceAll { text: String },
}

/// Document errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    /// Snapshot, delta or state vector failed to decode or apply
    #[error("malformed {kind}: {reason}")]
    Malformed { kind: &'static str, reason: String },
    /// Edit range outside the text or not on a char boundary
    #[error("invalid edit range {index}..{end} for text of {len} bytes")]
    InvalidEdit { index: u32, end: u32, len: u32 },
}

impl DocumentError {
    fn malformed(kind: &'static str, reason: impl ToString) -> Self {
        DocumentError::Malformed {
            kind,
            reason: reason.to_string(),
        }
    }
}

/// One document's replicated state.
pub struct CrdtDocument {
    doc: Doc,
}

impl Default for CrdtDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl CrdtDocument {
    /// Create an empty document.
    pub fn new() -> Self {
        let options = Options {
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        };
        Self {
            doc: Doc::with_options(options),
        }
    }

    /// Create a document seeded with `content`.
    pub fn with_content(content: &str) -> Self {
        let document = Self::new();
        if !content.is_empty() {
            let mut txn = document.doc.transact_mut();
            let text = txn.get_or_insert_text(CONTENT_TEXT);
            text.insert(&mut txn, 0, content);
        }
        document
    }

    /// Rebuild a document from a full snapshot.
    pub fn deserialize(snapshot: &[u8]) -> Result<Self, DocumentError> {
        let document = Self::new();
        document.apply_remote_update(snapshot)?;
        Ok(document)
    }

    /// Encode the full state as a single update (diff against the empty vector).
    pub fn serialize_full(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encoded state vector summarizing what this replica has seen.
    pub fn current_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Minimal delta a peer with `state_vector` is missing.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::malformed("state vector", e))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Merge a delta from another replica.
    ///
    /// The delta is fully decoded before a transaction is opened, so a
    /// malformed payload leaves the document untouched. Re-applying a delta
    /// already integrated is a no-op.
    pub fn apply_remote_update(&self, delta: &[u8]) -> Result<(), DocumentError> {
        let update = Update::decode_v1(delta).map_err(|e| DocumentError::malformed("update", e))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::malformed("update", e))
    }

    /// Apply a local edit in one transaction and return the delta it produced.
    ///
    /// An edit that changes nothing returns `Ok(None)`.
    pub fn apply_local_edit(&self, edit: LocalEdit) -> Result<Option<Vec<u8>>, DocumentError> {
        let current = self.materialize();
        let (index, delete_len, insert) = match edit {
            LocalEdit::Insert { index, text } => (index, 0, text),
            LocalEdit::Delete { index, len } => (index, len, String::new()),
            LocalEdit::Replace { index, len, text } => (index, len, text),
            LocalEdit::Append { text } => (current.len() as u32, 0, text),
            LocalEdit::ReplaceAll { text } => {
                if text == current {
                    return Ok(None);
                }
                (0, current.len() as u32, text)
            }
        };
        check_range(&current, index, delete_len)?;
        if delete_len == 0 && insert.is_empty() {
            return Ok(None);
        }

        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(CONTENT_TEXT);
        if delete_len > 0 {
            text.remove_range(&mut txn, index, delete_len);
        }
        if !insert.is_empty() {
            text.insert(&mut txn, index, &insert);
        }
        Ok(Some(txn.encode_update_v1()))
    }

    /// Current markdown text.
    pub fn materialize(&self) -> String {
        let txn = self.doc.transact();
        match txn.get_text(CONTENT_TEXT) {
            Some(text) => text.get_string(&txn),
            None => String::new(),
        }
    }

    /// Byte length of the current text.
    pub fn len(&self) -> usize {
        self.materialize().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_range(current: &str, index: u32, len: u32) -> Result<(), DocumentError> {
    let invalid = || DocumentError::InvalidEdit {
        index,
        end: index.saturating_add(len),
        len: current.len() as u32,
    };
    let start = index as usize;
    let end = start.checked_add(len as usize).ok_or_else(invalid)?;
    if end > current.len() || !current.is_char_boundary(start) || !current.is_char_boundary(end) {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(doc: &CrdtDocument, index: u32, text: &str) -> Vec<u8> {
        doc.apply_local_edit(LocalEdit::Insert {
            index,
            text: text.to_string(),
        })
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_empty_document() {
        let doc = CrdtDocument::new();
        assert_eq!(doc.materialize(), "");
        assert!(doc.is_empty());
    }

    #[test]
    fn test_with_content_and_snapshot_roundtrip() {
        let doc = CrdtDocument::with_content("# Title\n\nBody");
        let snapshot = doc.serialize_full();
        let restored = CrdtDocument::deserialize(&snapshot).unwrap();
        assert_eq!(restored.materialize(), "# Title\n\nBody");
    }

    #[test]
    fn test_local_edits() {
        let doc = CrdtDocument::with_content("Hello");
        insert(&doc, 5, " world");
        assert_eq!(doc.materialize(), "Hello world");

        doc.apply_local_edit(LocalEdit::Delete { index: 0, len: 6 })
            .unwrap();
        assert_eq!(doc.materialize(), "world");

        doc.apply_local_edit(LocalEdit::Replace {
            index: 0,
            len: 5,
            text: "there".into(),
        })
        .unwrap();
        assert_eq!(doc.materialize(), "there");

        doc.apply_local_edit(LocalEdit::Append { text: "!".into() })
            .unwrap();
        assert_eq!(doc.materialize(), "there!");

        doc.apply_local_edit(LocalEdit::ReplaceAll {
            text: "fresh".into(),
        })
        .unwrap();
        assert_eq!(doc.materialize(), "fresh");
    }

    #[test]
    fn test_noop_edits_produce_no_delta() {
        let doc = CrdtDocument::with_content("same");
        let delta = doc
            .apply_local_edit(LocalEdit::ReplaceAll {
                text: "same".into(),
            })
            .unwrap();
        assert!(delta.is_none());
        let delta = doc
            .apply_local_edit(LocalEdit::Append {
                text: String::new(),
            })
            .unwrap();
        assert!(delta.is_none());
    }

    #[test]
    fn test_invalid_range_rejected() {
        let doc = CrdtDocument::with_content("héllo");
        let err = doc
            .apply_local_edit(LocalEdit::Delete { index: 2, len: 1 })
            .unwrap_err();
        assert!(matches!(err, DocumentError::InvalidEdit { .. }));
        let err = doc
            .apply_local_edit(LocalEdit::Insert {
                index: 99,
                text: "x".into(),
            })
            .unwrap_err();
        assert!(matches!(err, DocumentError::InvalidEdit { .. }));
        assert_eq!(doc.materialize(), "héllo");
    }

    #[test]
    fn test_local_delta_replicates() {
        let a = CrdtDocument::new();
        let b = CrdtDocument::new();
        let delta = insert(&a, 0, "shared");
        b.apply_remote_update(&delta).unwrap();
        assert_eq!(b.materialize(), "shared");
    }

    #[test]
    fn test_apply_twice_is_noop() {
        let a = CrdtDocument::new();
        let b = CrdtDocument::new();
        let delta = insert(&a, 0, "once");
        b.apply_remote_update(&delta).unwrap();
        b.apply_remote_update(&delta).unwrap();
        assert_eq!(b.materialize(), "once");
    }

    #[test]
    fn test_concurrent_inserts_converge() {
        let a = CrdtDocument::new();
        let b = CrdtDocument::new();
        let from_a = insert(&a, 0, "foo");
        let from_b = insert(&b, 0, "bar");

        a.apply_remote_update(&from_b).unwrap();
        b.apply_remote_update(&from_a).unwrap();

        let text = a.materialize();
        assert_eq!(text, b.materialize());
        assert!(text.contains("foo"));
        assert!(text.contains("bar"));
    }

    #[test]
    fn test_diff_since_brings_peer_up_to_date() {
        let a = CrdtDocument::with_content("base");
        let b = CrdtDocument::deserialize(&a.serialize_full()).unwrap();
        insert(&a, 4, " + more");

        let diff = a.diff_since(&b.current_state_vector()).unwrap();
        b.apply_remote_update(&diff).unwrap();
        assert_eq!(b.materialize(), "base + more");

        // Nothing left to send once in sync
        let empty = b.diff_since(&a.current_state_vector()).unwrap();
        a.apply_remote_update(&empty).unwrap();
        assert_eq!(a.materialize(), "base + more");
    }

    #[test]
    fn test_malformed_inputs_leave_document_untouched() {
        let doc = CrdtDocument::with_content("intact");
        let garbage = [0x05u8, 0xFF];

        assert!(matches!(
            doc.apply_remote_update(&garbage),
            Err(DocumentError::Malformed { .. })
        ));
        assert!(matches!(
            doc.diff_since(&garbage),
            Err(DocumentError::Malformed { .. })
        ));
        assert!(CrdtDocument::deserialize(&garbage).is_err());
        assert_eq!(doc.materialize(), "intact");
    }
}
