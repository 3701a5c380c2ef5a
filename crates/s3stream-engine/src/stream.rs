//! The stream abstraction: append, fetch, trim and close
//!
//! Appends go to the WAL and are indexed in the WAL cache once durable.
//! Fetches resolve the sealed part of a request through the object manager
//! and the block cache, serve the unsealed tail from the WAL cache and
//! stitch both in ascending offset order.

use crate::catalog::StreamCatalog;
use crate::uploader::Uploader;
use crate::wal_cache::WalCache;
use futures::future::try_join_all;
use parking_lot::Mutex;
use s3stream_common::{
    Epoch, Error, RecordBatch, RecordBatchWithContext, Result, StreamId,
};
use s3stream_metadata::StreamMetadata;
use s3stream_storage::{BlockCache, ObjectManager, Wal};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Components shared by every stream of an engine
pub struct StreamContext {
    pub(crate) wal: Arc<dyn Wal>,
    pub(crate) objects: Arc<ObjectManager>,
    pub(crate) cache: BlockCache,
    pub(crate) wal_cache: Arc<WalCache>,
    pub(crate) catalog: Arc<StreamCatalog>,
    pub(crate) uploader: Arc<Uploader>,
    pub(crate) max_objects_per_fetch: usize,
}

impl StreamContext {
    #[must_use]
    pub fn new(
        wal: Arc<dyn Wal>,
        objects: Arc<ObjectManager>,
        cache: BlockCache,
        wal_cache: Arc<WalCache>,
        catalog: Arc<StreamCatalog>,
        uploader: Arc<Uploader>,
        max_objects_per_fetch: usize,
    ) -> Self {
        Self {
            wal,
            objects,
            cache,
            wal_cache,
            catalog,
            uploader,
            max_objects_per_fetch: max_objects_per_fetch.max(1),
        }
    }
}

/// Batches returned by a fetch, contiguous and in ascending offset order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResult {
    records: Vec<RecordBatchWithContext>,
}

impl FetchResult {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn records(&self) -> &[RecordBatchWithContext] {
        &self.records
    }

    #[must_use]
    pub fn into_records(self) -> Vec<RecordBatchWithContext> {
        self.records
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Payload bytes of all batches
    #[must_use]
    pub fn size(&self) -> usize {
        self.records.iter().map(RecordBatchWithContext::size).sum()
    }

    /// Base offset of the first batch
    #[must_use]
    pub fn start_offset(&self) -> Option<u64> {
        self.records.first().map(RecordBatchWithContext::base_offset)
    }

    /// Exclusive end offset of the last batch
    #[must_use]
    pub fn end_offset(&self) -> Option<u64> {
        self.records.last().map(RecordBatchWithContext::last_offset)
    }
}

#[derive(Debug)]
struct StreamOffsets {
    start_offset: u64,
    next_offset: u64,
    closed: bool,
}

/// An opened stream owned by this broker at a fixed epoch
pub struct S3Stream {
    stream_id: StreamId,
    epoch: Epoch,
    ctx: Arc<StreamContext>,
    offsets: Arc<Mutex<StreamOffsets>>,
    /// Serializes appends; held by the spawned WAL write until the batch
    /// is indexed
    append_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for S3Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Stream")
            .field("stream_id", &self.stream_id)
            .field("epoch", &self.epoch)
            .field("offsets", &*self.offsets.lock())
            .finish_non_exhaustive()
    }
}

impl S3Stream {
    /// Handle over an opened stream; appends continue at `next_offset`
    #[must_use]
    pub fn new(
        ctx: Arc<StreamContext>,
        stream_id: StreamId,
        epoch: Epoch,
        start_offset: u64,
        next_offset: u64,
    ) -> Self {
        Self {
            stream_id,
            epoch,
            ctx,
            offsets: Arc::new(Mutex::new(StreamOffsets {
                start_offset,
                next_offset,
                closed: false,
            })),
            append_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Handle over `meta` as returned by the catalog's open
    #[must_use]
    pub fn from_metadata(ctx: Arc<StreamContext>, meta: &StreamMetadata, next_offset: u64) -> Self {
        Self::new(ctx, meta.stream_id, meta.epoch, meta.start_offset, next_offset)
    }

    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.offsets.lock().start_offset
    }

    /// Offset the next append will receive
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.offsets.lock().next_offset
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.offsets.lock().closed
    }

    /// Durably append a batch and return its base offset
    pub async fn append(&self, batch: RecordBatch) -> Result<u64> {
        if batch.count() == 0 {
            return Err(Error::invalid_range("cannot append an empty batch"));
        }
        let max_batch = self.ctx.uploader.max_batch_bytes();
        if batch.size() > max_batch {
            return Err(Error::invalid_range(format!(
                "batch of {} bytes exceeds the {max_batch} byte limit",
                batch.size()
            )));
        }
        let guard = self.append_lock.clone().lock_owned().await;
        let base_offset = {
            let offsets = self.offsets.lock();
            if offsets.closed {
                return Err(Error::StreamClosed(self.stream_id));
            }
            offsets.next_offset
        };

        let ctx = self.ctx.clone();
        let offsets = self.offsets.clone();
        let (stream_id, epoch) = (self.stream_id, self.epoch);
        // Runs to completion even when the caller goes away, so a durable
        // batch is always indexed
        let task = tokio::spawn(async move {
            let _guard = guard;
            let count = u64::from(batch.count());
            let seq = ctx
                .wal
                .append(stream_id, epoch, base_offset, batch.clone())
                .await?;
            ctx.wal_cache
                .insert(stream_id, seq, RecordBatchWithContext::new(batch, base_offset));
            offsets.lock().next_offset = base_offset + count;
            ctx.uploader.maybe_trigger();
            Ok::<_, Error>(seq)
        });

        let seq = task
            .await
            .map_err(|e| Error::internal(format!("append task failed: {e}")))??;
        debug!(
            "Appended to stream {} at offset {} (WAL seq {})",
            self.stream_id, base_offset, seq
        );
        Ok(base_offset)
    }

    /// Read `[start_offset, end_offset)`, returning at most `max_bytes`
    /// of payload (the batch crossing the limit included)
    pub async fn fetch(&self, start_offset: u64, end_offset: u64, max_bytes: usize) -> Result<FetchResult> {
        let (stream_start, next_offset) = {
            let offsets = self.offsets.lock();
            if offsets.closed {
                return Err(Error::StreamClosed(self.stream_id));
            }
            (offsets.start_offset, offsets.next_offset)
        };
        if start_offset < stream_start || start_offset > end_offset || start_offset > next_offset {
            return Err(Error::OffsetOutOfRange {
                stream_id: self.stream_id,
                offset: start_offset,
                start: stream_start,
                end: next_offset,
            });
        }
        let end_offset = end_offset.min(next_offset);
        if start_offset == end_offset {
            return Ok(FetchResult::empty());
        }

        // The tail is read before the object ranges: an upload completing
        // in between then shows up twice rather than not at all
        let pending = self
            .ctx
            .wal_cache
            .get(self.stream_id, start_offset, end_offset);
        let ranges = self.ctx.objects.get_object_ranges(
            self.stream_id,
            start_offset,
            end_offset,
            self.ctx.max_objects_per_fetch,
        );
        let truncated = ranges.len() == self.ctx.max_objects_per_fetch;

        let reads = ranges.iter().map(|(object_id, range)| {
            self.ctx
                .cache
                .read(*object_id, self.stream_id, range.start, range.end, usize::MAX)
        });
        let blocks = try_join_all(reads).await?;

        let mut candidates: Vec<RecordBatchWithContext> = Vec::new();
        for block in blocks {
            candidates.extend(block.into_records().into_iter().filter(|b| {
                b.last_offset() > start_offset && b.base_offset() < end_offset
            }));
        }
        let covered = ranges.last().map_or(start_offset, |(_, r)| r.end);
        if !truncated {
            candidates.extend(pending.into_iter().filter(|b| b.base_offset() >= covered));
        }

        let records = stitch(self.stream_id, start_offset, end_offset, max_bytes, candidates)?;
        Ok(FetchResult { records })
    }

    /// Advance the start offset; data below it becomes unreadable and its
    /// objects are released
    pub async fn trim(&self, new_start: u64) -> Result<()> {
        let (start, next) = {
            let offsets = self.offsets.lock();
            if offsets.closed {
                return Err(Error::StreamClosed(self.stream_id));
            }
            (offsets.start_offset, offsets.next_offset)
        };
        if new_start < start || new_start > next {
            return Err(Error::OffsetOutOfRange {
                stream_id: self.stream_id,
                offset: new_start,
                start,
                end: next,
            });
        }
        if new_start == start {
            return Ok(());
        }

        self.ctx
            .catalog
            .trim_stream(self.stream_id, self.epoch, new_start)?;
        {
            let mut offsets = self.offsets.lock();
            offsets.start_offset = offsets.start_offset.max(new_start);
        }
        let released = self.ctx.objects.trim_stream(self.stream_id, new_start);
        info!(
            "Trimmed stream {} to {} ({} objects released)",
            self.stream_id,
            new_start,
            released.len()
        );
        Ok(())
    }

    /// Upload this stream's pending data, seal its open range and release
    /// the handle
    pub async fn close(&self) -> Result<()> {
        let _guard = self.append_lock.lock().await;
        if self.is_closed() {
            return Err(Error::StreamClosed(self.stream_id));
        }
        self.ctx.catalog.check_epoch(self.stream_id, self.epoch)?;

        if let Err(e) = self.ctx.uploader.upload_stream(self.stream_id).await {
            warn!(
                "Upload on close of stream {} failed: {}",
                self.stream_id, e
            );
            return Err(e);
        }
        let next_offset = self.next_offset();
        self.ctx
            .catalog
            .close_stream(self.stream_id, self.epoch, next_offset)?;
        self.offsets.lock().closed = true;
        Ok(())
    }
}

/// Assemble candidate batches into a contiguous run starting at
/// `start_offset`. Candidates may repeat a batch; gaps and partial
/// overlaps are integrity violations.
fn stitch(
    stream_id: StreamId,
    start_offset: u64,
    end_offset: u64,
    max_bytes: usize,
    mut candidates: Vec<RecordBatchWithContext>,
) -> Result<Vec<RecordBatchWithContext>> {
    candidates.sort_by_key(RecordBatchWithContext::base_offset);
    candidates.dedup_by(|b, a| a.base_offset() == b.base_offset() && a.count() == b.count());

    let mut records: Vec<RecordBatchWithContext> = Vec::new();
    let mut bytes = 0usize;
    for batch in candidates {
        match records.last() {
            None => {
                if batch.base_offset() > start_offset {
                    return Err(Error::integrity(format!(
                        "stream {stream_id} has no data at offset {start_offset}, next batch starts at {}",
                        batch.base_offset()
                    )));
                }
            }
            Some(prev) if prev.last_offset() != batch.base_offset() => {
                return Err(Error::integrity(format!(
                    "stream {stream_id} batches {} and {} are not contiguous",
                    prev.range(),
                    batch.range()
                )));
            }
            Some(_) => {}
        }
        bytes += batch.size();
        let last = batch.last_offset();
        records.push(batch);
        if bytes >= max_bytes || last >= end_offset {
            break;
        }
    }

    if records.is_empty() {
        return Err(Error::integrity(format!(
            "stream {stream_id} has no data for [{start_offset}, {end_offset})"
        )));
    }
    Ok(records)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;
    use s3stream_common::{BrokerId, ObjectId};
    use s3stream_common::config::CacheConfig;
    use s3stream_metadata::{
        BrokerS3WalMetadataImage, MetaStore, MetadataPublisher, MetadataRecord, RangeMetadata,
        StreamState,
    };
    use s3stream_storage::{MemoryObjectStore, MemoryWal, ObjectStore, ObjectWriter};
    use std::path::Path;

    pub(crate) struct Harness {
        pub ctx: Arc<StreamContext>,
        pub wal: Arc<MemoryWal>,
        pub store: Arc<MemoryObjectStore>,
        pub publisher: Arc<MetadataPublisher>,
    }

    pub(crate) fn harness(dir: &Path) -> Harness {
        harness_with(dir, usize::MAX)
    }

    pub(crate) fn harness_with(dir: &Path, max_pending_bytes: usize) -> Harness {
        let wal = Arc::new(MemoryWal::new());
        let store = Arc::new(MemoryObjectStore::new());
        let meta = Arc::new(MetaStore::open(dir.join("meta.redb")).unwrap());
        let catalog = Arc::new(StreamCatalog::open(meta.clone(), BrokerId::new(10)).unwrap());
        let objects = Arc::new(ObjectManager::new(BrokerId::new(10)));
        let cache = BlockCache::new(store.clone(), &CacheConfig::default());
        let wal_cache = Arc::new(WalCache::new(wal.next_seq()));
        let publisher = Arc::new(MetadataPublisher::new(
            BrokerS3WalMetadataImage::empty(BrokerId::new(10), 1),
            Some(meta),
        ));
        let uploader = Arc::new(Uploader::new(
            wal.clone(),
            store.clone(),
            objects.clone(),
            cache.clone(),
            wal_cache.clone(),
            publisher.clone(),
            catalog.clone(),
            max_pending_bytes,
        ));
        let ctx = Arc::new(StreamContext::new(
            wal.clone(),
            objects,
            cache,
            wal_cache,
            catalog,
            uploader,
            64,
        ));
        Harness {
            ctx,
            wal,
            store,
            publisher,
        }
    }

    pub(crate) fn batch(count: u32, len: usize) -> RecordBatch {
        RecordBatch::new(count, vec![7u8; len])
    }

    /// Open a fresh stream through the catalog
    async fn open_stream(h: &Harness, name: &str) -> S3Stream {
        let meta = h.ctx.catalog.create_stream(name).unwrap();
        let meta = h.ctx.catalog.open_stream(meta.stream_id, 0).unwrap();
        h.ctx.wal.fence(meta.stream_id, meta.epoch).await.unwrap();
        h.ctx.objects.register_stream(meta.stream_id, 0);
        S3Stream::from_metadata(h.ctx.clone(), &meta, 0)
    }

    async fn put_object(h: &Harness, id: u64, stream_id: StreamId, batches: &[(u64, u32)]) {
        let batches: Vec<_> = batches
            .iter()
            .map(|(base, count)| RecordBatchWithContext::new(batch(*count, 10), *base))
            .collect();
        let mut writer = ObjectWriter::new();
        writer.write_block(stream_id, &batches).unwrap();
        let ranges = writer.ranges();
        let data: Bytes = writer.finish().unwrap();
        let size = data.len() as u64;

        let object_id = ObjectId::new(id);
        h.store.put(object_id, data).await.unwrap();
        h.ctx.objects.ensure_next_object_id(id);
        let assigned = h.ctx.objects.assign_object_id();
        assert_eq!(assigned, object_id);
        let object = h.ctx.objects.commit_object(object_id, size, &ranges).unwrap();
        h.publisher.replay(&MetadataRecord::wal_object_added(&object));
        h.publisher.publish().unwrap();
    }

    #[tokio::test]
    async fn test_append_offsets_are_contiguous() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path());
        let stream = open_stream(&h, "orders").await;

        let mut expected = 0;
        for count in [1u32, 5, 3, 10] {
            let base = stream.append(batch(count, 16)).await.unwrap();
            assert_eq!(base, expected);
            expected += u64::from(count);
        }
        assert_eq!(stream.next_offset(), 19);

        // Read your write
        let result = stream.fetch(0, 19, usize::MAX).await.unwrap();
        assert_eq!(result.records().len(), 4);
        assert_eq!(result.start_offset(), Some(0));
        assert_eq!(result.end_offset(), Some(19));
    }

    #[tokio::test]
    async fn test_fetch_from_objects() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path());
        let stream_id = StreamId::new(233);
        let mut meta = StreamMetadata::new(stream_id);
        meta.epoch = 1;
        meta.start_offset = 100;
        meta.ranges.push(RangeMetadata::open(1, 50, BrokerId::new(10)));
        meta.state = StreamState::Opened;
        h.ctx.catalog.store().put_stream(&meta).unwrap();

        h.ctx.objects.register_stream(stream_id, 110);
        put_object(&h, 123, stream_id, &[(110, 5)]).await;
        put_object(&h, 124, stream_id, &[(115, 5)]).await;

        let stream = S3Stream::new(h.ctx.clone(), stream_id, 1, 100, 120);
        let result = stream.fetch(110, 120, 100).await.unwrap();
        assert_eq!(result.records().len(), 2);
        assert_eq!(result.start_offset(), Some(110));
        assert_eq!(result.end_offset(), Some(120));
    }

    #[tokio::test]
    async fn test_fetch_edge_cases() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path());
        let stream = open_stream(&h, "orders").await;
        stream.append(batch(10, 16)).await.unwrap();
        stream.trim(5).await.unwrap();

        assert!(stream.fetch(7, 7, 100).await.unwrap().is_empty());
        assert!(matches!(
            stream.fetch(2, 8, 100).await,
            Err(Error::OffsetOutOfRange { offset: 2, start: 5, .. })
        ));
        assert!(matches!(
            stream.fetch(8, 6, 100).await,
            Err(Error::OffsetOutOfRange { .. })
        ));
        assert!(matches!(
            stream.fetch(11, 20, 100).await,
            Err(Error::OffsetOutOfRange { .. })
        ));

        // End is clipped to the next offset
        let result = stream.fetch(5, 1000, 100).await.unwrap();
        assert_eq!(result.end_offset(), Some(10));
    }

    #[tokio::test]
    async fn test_fetch_max_bytes_keeps_crossing_batch() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path());
        let stream = open_stream(&h, "orders").await;
        for _ in 0..4 {
            stream.append(batch(1, 100)).await.unwrap();
        }

        let result = stream.fetch(0, 4, 150).await.unwrap();
        assert_eq!(result.records().len(), 2);
        let result = stream.fetch(0, 4, 1).await.unwrap();
        assert_eq!(result.records().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_spans_objects_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path());
        let stream = open_stream(&h, "orders").await;

        stream.append(batch(5, 16)).await.unwrap();
        stream.append(batch(5, 16)).await.unwrap();
        h.ctx.uploader.upload().await.unwrap().unwrap();
        stream.append(batch(5, 16)).await.unwrap();

        assert_eq!(h.ctx.objects.sealed_end(stream.stream_id()), Some(10));
        assert!(h.wal.len() >= 1);
        let result = stream.fetch(3, 15, usize::MAX).await.unwrap();
        let bases: Vec<u64> = result.records().iter().map(RecordBatchWithContext::base_offset).collect();
        assert_eq!(bases, vec![0, 5, 10]);
        assert_eq!(h.publisher.image().len(), 1);
    }

    #[tokio::test]
    async fn test_trim_releases_objects() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path());
        let stream = open_stream(&h, "orders").await;

        stream.append(batch(5, 16)).await.unwrap();
        let object = h.ctx.uploader.upload().await.unwrap().unwrap();
        stream.append(batch(5, 16)).await.unwrap();
        h.ctx.uploader.upload().await.unwrap().unwrap();

        assert!(stream.trim(3).await.is_ok());
        assert!(h.store.contains(object.object_id));
        stream.trim(5).await.unwrap();
        assert!(stream.trim(4).await.is_err());
        assert!(stream.trim(11).await.is_err());

        let removed = h.ctx.uploader.collect_garbage().await.unwrap();
        assert_eq!(removed, vec![object.object_id]);
        assert!(!h.store.contains(object.object_id));
        assert!(h.publisher.image().get(object.object_id).is_none());
        assert_eq!(stream.fetch(5, 10, 100).await.unwrap().start_offset(), Some(5));
    }

    #[tokio::test]
    async fn test_oversized_batch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness_with(dir.path(), 64);
        let stream = open_stream(&h, "orders").await;

        assert!(matches!(
            stream.append(batch(1, 65)).await,
            Err(Error::InvalidRange(_))
        ));
        assert_eq!(stream.next_offset(), 0);
        assert_eq!(stream.append(batch(1, 64)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_append_failure_surfaces_wal_error() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path());
        let stream = open_stream(&h, "orders").await;

        h.wal.set_fail_appends(true);
        let err = stream.append(batch(1, 8)).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(stream.next_offset(), 0);

        h.wal.set_fail_appends(false);
        assert_eq!(stream.append(batch(1, 8)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_uploads_and_rejects_further_ops() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path());
        let stream = open_stream(&h, "orders").await;
        stream.append(batch(4, 16)).await.unwrap();

        stream.close().await.unwrap();
        assert!(h.ctx.wal_cache.is_empty());
        assert_eq!(h.store.len(), 1);
        let meta = h.ctx.catalog.stream_metadata(stream.stream_id()).unwrap();
        assert_eq!(meta.state, StreamState::Closed);
        assert_eq!(meta.sealed_offset, 4);

        assert!(matches!(
            stream.append(batch(1, 1)).await,
            Err(Error::StreamClosed(_))
        ));
        assert!(matches!(stream.fetch(0, 4, 10).await, Err(Error::StreamClosed(_))));
        assert!(matches!(stream.close().await, Err(Error::StreamClosed(_))));
    }

    #[tokio::test]
    async fn test_stale_handle_cannot_trim_or_close() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path());
        let first = open_stream(&h, "orders").await;
        first.append(batch(4, 16)).await.unwrap();

        let stream_id = first.stream_id();
        let meta = h.ctx.catalog.open_stream(stream_id, 4).unwrap();
        h.ctx.wal.fence(stream_id, meta.epoch).await.unwrap();
        let second = S3Stream::from_metadata(h.ctx.clone(), &meta, 4);
        assert_eq!(second.epoch(), 2);
        assert_eq!(second.append(batch(2, 16)).await.unwrap(), 4);

        assert!(matches!(
            first.trim(2).await,
            Err(Error::FencedEpoch { epoch: 1, current: 2, .. })
        ));
        assert!(matches!(
            first.close().await,
            Err(Error::FencedEpoch { epoch: 1, current: 2, .. })
        ));

        let meta = h.ctx.catalog.stream_metadata(stream_id).unwrap();
        assert_eq!(meta.state, StreamState::Opened);
        assert_eq!(meta.start_offset, 0);
        assert!(meta.open_range().is_some_and(|r| r.epoch == 2));

        second.trim(2).await.unwrap();
        second.close().await.unwrap();
        let meta = h.ctx.catalog.stream_metadata(stream_id).unwrap();
        assert_eq!(meta.ranges.last().unwrap().end_offset, Some(6));
    }

    #[test]
    fn test_stitch_rejects_gap() {
        let a = RecordBatchWithContext::new(batch(5, 1), 0);
        let c = RecordBatchWithContext::new(batch(5, 1), 10);
        let err = stitch(StreamId::new(1), 0, 15, usize::MAX, vec![c, a]).unwrap_err();
        assert!(err.is_fatal());
    }
}
