//! Error types for s3stream
//!
//! This module defines the error taxonomy shared by the WAL, object layer,
//! cache and stream abstraction.

use crate::types::{Epoch, ObjectId, StreamId};
use thiserror::Error;

/// Common result type for s3stream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for s3stream
#[derive(Debug, Error)]
pub enum Error {
    // Write path errors
    #[error("stream {stream_id} fenced: epoch {epoch} is older than current owner epoch {current}")]
    FencedEpoch {
        stream_id: StreamId,
        epoch: Epoch,
        current: Epoch,
    },

    #[error("WAL write failed: {0}")]
    WalWrite(String),

    // Read path errors
    #[error("offset {offset} out of range for stream {stream_id}: valid range is [{start}, {end}]")]
    OffsetOutOfRange {
        stream_id: StreamId,
        offset: u64,
        start: u64,
        end: u64,
    },

    #[error("failed to fetch object {object_id}: {reason}")]
    ObjectFetch { object_id: ObjectId, reason: String },

    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    // Stream lifecycle errors
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("stream {0} is closed")]
    StreamClosed(StreamId),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    // Collaborator errors
    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("metadata store error: {0}")]
    Metadata(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a data integrity error
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::DataIntegrity(msg.into())
    }

    /// Create an invalid range error
    pub fn invalid_range(msg: impl Into<String>) -> Self {
        Self::InvalidRange(msg.into())
    }

    /// Create a WAL write error
    pub fn wal_write(msg: impl Into<String>) -> Self {
        Self::WalWrite(msg.into())
    }

    /// Create an object fetch error
    pub fn object_fetch(object_id: ObjectId, reason: impl Into<String>) -> Self {
        Self::ObjectFetch {
            object_id,
            reason: reason.into(),
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ObjectFetch { .. } | Self::ObjectStore(_))
    }

    /// Check if this error indicates corrupted state that must not be retried
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::DataIntegrity(_) | Self::WalWrite(_))
    }

    /// Check if the caller has to re-resolve stream ownership
    #[must_use]
    pub const fn is_fenced(&self) -> bool {
        matches!(self, Self::FencedEpoch { .. })
    }
}
