//! In-memory index of batches that are durable in the WAL but not yet
//! sealed into an object.
//!
//! The cache serves the unsealed tail of every stream and feeds the
//! uploader. It also tracks the confirmed WAL sequence: every sequence at
//! or below it has been indexed, so trimming the WAL up to it never drops
//! a record the uploader has not seen.

use parking_lot::Mutex;
use s3stream_common::{RecordBatchWithContext, StreamId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone)]
struct CachedBatch {
    seq: u64,
    batch: RecordBatchWithContext,
}

#[derive(Default)]
struct WalCacheInner {
    /// stream → base offset → batch
    streams: HashMap<StreamId, BTreeMap<u64, CachedBatch>>,
    confirmed: u64,
    /// Indexed sequences above `confirmed` waiting for the gap below them
    out_of_order: BTreeSet<u64>,
    bytes: usize,
}

impl WalCacheInner {
    fn confirm(&mut self, seq: u64) {
        if seq <= self.confirmed {
            return;
        }
        if seq != self.confirmed + 1 {
            self.out_of_order.insert(seq);
            return;
        }
        self.confirmed = seq;
        while self.out_of_order.remove(&(self.confirmed + 1)) {
            self.confirmed += 1;
        }
    }
}

/// Everything indexed at one point in time, grouped by stream
#[derive(Debug, Default)]
pub struct PendingUpload {
    /// Per-stream batches in ascending offset order
    pub streams: Vec<(StreamId, Vec<RecordBatchWithContext>)>,
    /// WAL sequence up to which every record is part of this snapshot or
    /// was uploaded before
    pub confirmed: u64,
    pub bytes: usize,
}

impl PendingUpload {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Unsealed batches of every stream
pub struct WalCache {
    inner: Mutex<WalCacheInner>,
}

impl WalCache {
    /// Empty cache for a WAL whose next append gets `next_seq`
    #[must_use]
    pub fn new(next_seq: u64) -> Self {
        Self {
            inner: Mutex::new(WalCacheInner {
                confirmed: next_seq.saturating_sub(1),
                ..WalCacheInner::default()
            }),
        }
    }

    /// Index a durable batch under its WAL sequence
    pub fn insert(&self, stream_id: StreamId, seq: u64, batch: RecordBatchWithContext) {
        let mut inner = self.inner.lock();
        let size = batch.size();
        let previous = inner
            .streams
            .entry(stream_id)
            .or_default()
            .insert(batch.base_offset(), CachedBatch { seq, batch });
        inner.bytes += size;
        if let Some(previous) = previous {
            inner.bytes -= previous.batch.size();
        }
        inner.confirm(seq);
    }

    /// Batches of a stream intersecting `[start_offset, end_offset)`,
    /// ascending
    #[must_use]
    pub fn get(&self, stream_id: StreamId, start_offset: u64, end_offset: u64) -> Vec<RecordBatchWithContext> {
        let inner = self.inner.lock();
        let Some(batches) = inner.streams.get(&stream_id) else {
            return Vec::new();
        };
        // The batch holding start_offset begins at or before it
        let first = batches
            .range(..=start_offset)
            .next_back()
            .map_or(start_offset, |(base, _)| *base);
        batches
            .range(first..end_offset)
            .filter(|(_, cached)| cached.batch.last_offset() > start_offset)
            .map(|(_, cached)| cached.batch.clone())
            .collect()
    }

    /// Lowest cached offset of a stream
    #[must_use]
    pub fn first_offset(&self, stream_id: StreamId) -> Option<u64> {
        let inner = self.inner.lock();
        inner
            .streams
            .get(&stream_id)
            .and_then(|b| b.keys().next().copied())
    }

    /// End of the last cached batch of a stream
    #[must_use]
    pub fn end_offset(&self, stream_id: StreamId) -> Option<u64> {
        let inner = self.inner.lock();
        inner
            .streams
            .get(&stream_id)
            .and_then(|b| b.values().next_back())
            .map(|cached| cached.batch.last_offset())
    }

    /// Snapshot of every cached batch, optionally limited to one stream
    #[must_use]
    pub fn snapshot(&self, only: Option<StreamId>) -> PendingUpload {
        let inner = self.inner.lock();
        let mut streams: Vec<(StreamId, Vec<RecordBatchWithContext>)> = inner
            .streams
            .iter()
            .filter(|(stream_id, batches)| {
                !batches.is_empty() && only.is_none_or(|s| s == **stream_id)
            })
            .map(|(stream_id, batches)| {
                (
                    *stream_id,
                    batches.values().map(|cached| cached.batch.clone()).collect(),
                )
            })
            .collect();
        streams.sort_by_key(|(stream_id, _)| *stream_id);
        let bytes = streams
            .iter()
            .flat_map(|(_, batches)| batches.iter())
            .map(RecordBatchWithContext::size)
            .sum();

        // A single-stream snapshot only covers the sequences it holds
        let confirmed = match only {
            None => inner.confirmed,
            Some(stream_id) => {
                let lowest_other = inner
                    .streams
                    .iter()
                    .filter(|(s, _)| **s != stream_id)
                    .flat_map(|(_, batches)| batches.values().map(|c| c.seq))
                    .min();
                lowest_other.map_or(inner.confirmed, |seq| inner.confirmed.min(seq.saturating_sub(1)))
            }
        };

        PendingUpload {
            streams,
            confirmed,
            bytes,
        }
    }

    /// Drop a stream's batches that end at or below `end_offset`
    pub fn release(&self, stream_id: StreamId, end_offset: u64) {
        let mut inner = self.inner.lock();
        let mut freed = 0;
        if let Some(batches) = inner.streams.get_mut(&stream_id) {
            let keep = batches.split_off(&end_offset);
            for cached in batches.values() {
                freed += cached.batch.size();
            }
            *batches = keep;
            if batches.is_empty() {
                inner.streams.remove(&stream_id);
            }
        }
        inner.bytes -= freed;
    }

    /// Highest WAL sequence below which every record has been indexed
    #[must_use]
    pub fn confirmed(&self) -> u64 {
        self.inner.lock().confirmed
    }

    /// Bytes of payload waiting for upload
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s3stream_common::RecordBatch;

    const A: StreamId = StreamId::new(1);
    const B: StreamId = StreamId::new(2);

    fn batch(base: u64, count: u32) -> RecordBatchWithContext {
        RecordBatchWithContext::new(RecordBatch::new(count, vec![0u8; 10]), base)
    }

    #[test]
    fn test_get_returns_intersecting_batches() {
        let cache = WalCache::new(1);
        cache.insert(A, 1, batch(0, 5));
        cache.insert(A, 2, batch(5, 5));
        cache.insert(A, 3, batch(10, 5));

        let got = cache.get(A, 7, 11);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].base_offset(), 5);
        assert_eq!(got[1].base_offset(), 10);
        assert!(cache.get(A, 15, 20).is_empty());
        assert!(cache.get(B, 0, 20).is_empty());
        assert_eq!(cache.end_offset(A), Some(15));
        assert_eq!(cache.first_offset(A), Some(0));
    }

    #[test]
    fn test_confirmed_waits_for_gaps() {
        let cache = WalCache::new(5);
        assert_eq!(cache.confirmed(), 4);

        cache.insert(A, 6, batch(0, 1));
        assert_eq!(cache.confirmed(), 4);
        cache.insert(B, 7, batch(0, 1));
        assert_eq!(cache.confirmed(), 4);
        cache.insert(B, 5, batch(1, 1));
        assert_eq!(cache.confirmed(), 7);
    }

    #[test]
    fn test_release_frees_bytes() {
        let cache = WalCache::new(1);
        cache.insert(A, 1, batch(0, 5));
        cache.insert(A, 2, batch(5, 5));
        assert_eq!(cache.pending_bytes(), 20);

        cache.release(A, 5);
        assert_eq!(cache.pending_bytes(), 10);
        assert_eq!(cache.first_offset(A), Some(5));

        cache.release(A, 10);
        assert!(cache.is_empty());
        assert_eq!(cache.pending_bytes(), 0);
    }

    #[test]
    fn test_single_stream_snapshot_caps_confirmed() {
        let cache = WalCache::new(1);
        cache.insert(A, 1, batch(0, 1));
        cache.insert(B, 2, batch(0, 1));
        cache.insert(A, 3, batch(1, 1));

        let all = cache.snapshot(None);
        assert_eq!(all.streams.len(), 2);
        assert_eq!(all.confirmed, 3);

        let only_a = cache.snapshot(Some(A));
        assert_eq!(only_a.streams.len(), 1);
        assert_eq!(only_a.streams[0].1.len(), 2);
        assert_eq!(only_a.confirmed, 1);
    }
}
