//! Core type definitions for s3stream
//!
//! This module defines the identifiers, offset ranges and record batch types
//! shared by the WAL, the object layer and the stream abstraction.

use bytes::Bytes;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Owner generation of a stream, used to fence stale writers
pub type Epoch = u64;

/// Unique identifier for a stream
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct StreamId(u64);

impl StreamId {
    /// Sentinel id carried by a lazy stream that has not been bound yet
    pub const NOOP: Self = Self(u64::MAX);

    /// Create from a raw id
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw id
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the unassigned sentinel
    #[must_use]
    pub const fn is_noop(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_noop() {
            write!(f, "StreamId(NOOP)")
        } else {
            write!(f, "StreamId({})", self.0)
        }
    }
}

/// Unique identifier for a WAL object, assigned monotonically per broker
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct ObjectId(u64);

impl ObjectId {
    /// Create from a raw id
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw id
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The id following this one
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

/// Identifier of the broker that owns a WAL
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("{_0}")]
pub struct BrokerId(u32);

impl BrokerId {
    /// Create from a raw id
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw id
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Half-open offset interval `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OffsetRange {
    pub start: u64,
    pub end: u64,
}

impl OffsetRange {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of offsets covered
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[must_use]
    pub const fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end
    }

    /// Intersection with `[start, end)`, `None` when they do not overlap
    #[must_use]
    pub fn intersect(&self, start: u64, end: u64) -> Option<Self> {
        let lo = self.start.max(start);
        let hi = self.end.min(end);
        (lo < hi).then_some(Self::new(lo, hi))
    }
}

impl fmt::Display for OffsetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A batch of records as handed to the engine by the broker
///
/// The payload is opaque to the engine; only the record count matters for
/// offset assignment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordBatch {
    count: u32,
    payload: Bytes,
}

impl RecordBatch {
    #[must_use]
    pub fn new(count: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            count,
            payload: payload.into(),
        }
    }

    /// Number of records (offsets) in this batch
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload size in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// A record batch placed at its offset in a stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordBatchWithContext {
    base_offset: u64,
    batch: RecordBatch,
}

impl RecordBatchWithContext {
    #[must_use]
    pub const fn new(batch: RecordBatch, base_offset: u64) -> Self {
        Self { base_offset, batch }
    }

    #[must_use]
    pub const fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Exclusive end offset: `base_offset + count`
    #[must_use]
    pub const fn last_offset(&self) -> u64 {
        self.base_offset + self.batch.count as u64
    }

    #[must_use]
    pub const fn count(&self) -> u32 {
        self.batch.count
    }

    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.batch.payload
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.batch.size()
    }

    #[must_use]
    pub const fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    #[must_use]
    pub const fn range(&self) -> OffsetRange {
        OffsetRange::new(self.base_offset, self.last_offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_noop() {
        assert!(StreamId::NOOP.is_noop());
        assert!(!StreamId::new(233).is_noop());
        assert_eq!(format!("{:?}", StreamId::NOOP), "StreamId(NOOP)");
        assert_eq!(StreamId::new(233).to_string(), "233");
    }

    #[test]
    fn test_object_id_ordering() {
        let a = ObjectId::new(123);
        assert!(a < a.next());
        assert_eq!(a.next().as_u64(), 124);
    }

    #[test]
    fn test_offset_range_intersect() {
        let range = OffsetRange::new(110, 115);
        assert_eq!(range.intersect(100, 112), Some(OffsetRange::new(110, 112)));
        assert_eq!(range.intersect(115, 120), None);
        assert_eq!(range.intersect(0, 110), None);
        assert_eq!(range.len(), 5);
        assert!(range.contains(114));
        assert!(!range.contains(115));
    }

    #[test]
    fn test_batch_last_offset_is_exclusive() {
        let batch = RecordBatchWithContext::new(RecordBatch::new(5, vec![0u8; 10]), 115);
        assert_eq!(batch.base_offset(), 115);
        assert_eq!(batch.last_offset(), 120);
        assert_eq!(batch.size(), 10);
        assert_eq!(batch.range(), OffsetRange::new(115, 120));
    }
}
