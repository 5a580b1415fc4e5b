//! Binary wire protocol for document synchronization.
//!
//! Wire format (Yjs sync/awareness compatible):
//! ```text
//! ┌──────────────┬──────────────┬────────────────┬──────────────┐
//! │ msg_type     │ sync_type    │ payload length │ payload      │
//! │ varint       │ varint       │ varint         │ raw bytes    │
//! │ 0 = Sync     │ 0 = Step1    │                │ state vector │
//! │              │ 1 = Step2    │                │ delta        │
//! │              │ 2 = Update   │                │ delta        │
//! ├──────────────┼──────────────┴────────────────┴──────────────┤
//! │ 1 = Awareness│ payload length (varint) + presence delta     │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! All integers are unsigned LEB128 varints. A frame carries exactly one
//! message; bytes left over after the payload are rejected.

use thiserror::Error;

/// Top-level message discriminator for sync frames.
pub const MSG_SYNC: u64 = 0;
/// Top-level message discriminator for awareness frames.
pub const MSG_AWARENESS: u64 = 1;

/// Sync sub-type: state vector request.
pub const SYNC_STEP1: u64 = 0;
/// Sync sub-type: delta answering a state vector.
pub const SYNC_STEP2: u64 = 1;
/// Sync sub-type: incremental update.
pub const SYNC_UPDATE: u64 = 2;

/// Varints longer than this cannot describe a `u64`.
const MAX_VARINT_BYTES: usize = 10;

/// WebSocket close codes used by the sync endpoint.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Malformed frame received from the peer.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Peer could not keep up with the broadcast stream; reconnect to resync.
    pub const TRY_AGAIN_LATER: u16 = 1013;
    /// No token or no scope supplied with the upgrade request.
    pub const MISSING_CREDENTIALS: u16 = 4001;
    /// Token rejected or identity not a member of the scope.
    pub const UNAUTHORIZED: u16 = 4003;
    /// Unknown document id (or document deleted while connected).
    pub const NOT_FOUND: u16 = 4004;
}

/// Sync sub-messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Encoded state vector of the sender
    SyncStep1(Vec<u8>),
    /// Delta the receiver is missing
    SyncStep2(Vec<u8>),
    /// Incremental update produced by an edit
    Update(Vec<u8>),
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// Serialized presence delta, opaque at this layer
    Awareness(Vec<u8>),
}

impl Message {
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::SyncStep1(state_vector))
    }

    pub fn sync_step2(delta: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::SyncStep2(delta))
    }

    pub fn update(delta: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::Update(delta))
    }

    pub fn awareness(payload: Vec<u8>) -> Self {
        Message::Awareness(payload)
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload_len() + 8);
        match self {
            Message::Sync(sync) => {
                write_var(&mut buf, MSG_SYNC);
                let (sub_type, payload) = match sync {
                    SyncMessage::SyncStep1(sv) => (SYNC_STEP1, sv),
                    SyncMessage::SyncStep2(delta) => (SYNC_STEP2, delta),
                    SyncMessage::Update(delta) => (SYNC_UPDATE, delta),
                };
                write_var(&mut buf, sub_type);
                write_buf(&mut buf, payload);
            }
            Message::Awareness(payload) => {
                write_var(&mut buf, MSG_AWARENESS);
                write_buf(&mut buf, payload);
            }
        }
        buf
    }

    /// Deserialize one message from a complete frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(bytes);
        let msg = match reader.read_var()? {
            MSG_SYNC => {
                let sync = match reader.read_var()? {
                    SYNC_STEP1 => SyncMessage::SyncStep1(reader.read_buf()?.to_vec()),
                    SYNC_STEP2 => SyncMessage::SyncStep2(reader.read_buf()?.to_vec()),
                    SYNC_UPDATE => SyncMessage::Update(reader.read_buf()?.to_vec()),
                    other => return Err(ProtocolError::UnknownSyncType(other)),
                };
                Message::Sync(sync)
            }
            MSG_AWARENESS => Message::Awareness(reader.read_buf()?.to_vec()),
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        if reader.remaining() > 0 {
            return Err(ProtocolError::TrailingBytes(reader.remaining()));
        }
        Ok(msg)
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::Sync(SyncMessage::SyncStep1(p))
            | Message::Sync(SyncMessage::SyncStep2(p))
            | Message::Sync(SyncMessage::Update(p))
            | Message::Awareness(p) => p.len(),
        }
    }
}

/// Append an unsigned LEB128 varint.
pub fn write_var(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Append a length-prefixed byte buffer.
pub fn write_buf(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Append a length-prefixed UTF-8 string.
pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_buf(buf, s.as_bytes());
}

/// Cursor over a borrowed frame.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Read an unsigned LEB128 varint.
    pub fn read_var(&mut self) -> Result<u64, ProtocolError> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_BYTES {
            let byte = *self
                .bytes
                .get(self.pos)
                .ok_or(ProtocolError::UnexpectedEof)?;
            self.pos += 1;
            let chunk = u64::from(byte & 0x7F);
            let shift = 7 * i as u32;
            if shift == 63 && chunk > 1 {
                return Err(ProtocolError::VarintOverflow);
            }
            value |= chunk << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::VarintOverflow)
    }

    /// Read a length-prefixed byte buffer.
    pub fn read_buf(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_var()?;
        let len = usize::try_from(len).map_err(|_| ProtocolError::LengthOutOfBounds(len))?;
        if len > self.remaining() {
            return Err(ProtocolError::LengthOutOfBounds(len as u64));
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..self.pos])
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<&'a str, ProtocolError> {
        let bytes = self.read_buf()?;
        std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unexpected end of frame")]
    UnexpectedEof,
    #[error("varint does not fit in 64 bits")]
    VarintOverflow,
    #[error("length prefix {0} exceeds frame")]
    LengthOutOfBounds(u64),
    #[error("unknown message type {0}")]
    UnknownMessageType(u64),
    #[error("unknown sync message type {0}")]
    UnknownSyncType(u64),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
    #[error("awareness state is not valid JSON: {0}")]
    InvalidAwarenessState(String),
    #[error("text frames are not part of the sync protocol")]
    UnexpectedTextFrame,
}
