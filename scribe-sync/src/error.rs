//! Crate-wide error type.

use thiserror::Error;

use crate::document::DocumentError;
use crate::protocol::{close_code, ProtocolError};
use crate::store::StoreError;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("document already exists: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("persistence failed: {0}")]
    Persistence(StoreError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(id) => SyncError::Conflict(id),
            other => SyncError::Persistence(other),
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Internal(format!("background task failed: {e}"))
    }
}

impl SyncError {
    /// WebSocket close code a sync connection ends with for this error.
    pub fn close_code(&self) -> u16 {
        match self {
            SyncError::NotFound(_) => close_code::NOT_FOUND,
            SyncError::Forbidden(_) => close_code::UNAUTHORIZED,
            SyncError::Protocol(_) | SyncError::Document(_) => close_code::PROTOCOL_ERROR,
            // 1011: server error
            SyncError::Conflict(_) | SyncError::Persistence(_) | SyncError::Internal(_) => 1011,
        }
    }
}
