//! Block cache for the object read path
//!
//! Caches decoded record batches fetched from the object store, keyed by
//! (object, stream, offset range). Concurrent misses on the same key share
//! one spawned fetch, so a caller that gives up does not cancel the fetch
//! for the others and the result still lands in the cache.

use crate::object_format::{FOOTER_SIZE, Footer, ObjectIndex, decode_block};
use crate::object_store::ObjectStore;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use s3stream_common::config::CacheConfig;
use s3stream_common::{Error, ObjectId, RecordBatchWithContext, Result, StreamId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Cache key: one stream's offset window inside one object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub object_id: ObjectId,
    pub stream_id: StreamId,
    pub start_offset: u64,
    pub end_offset: u64,
}

impl CacheKey {
    #[must_use]
    pub const fn new(object_id: ObjectId, stream_id: StreamId, start_offset: u64, end_offset: u64) -> Self {
        Self {
            object_id,
            stream_id,
            start_offset,
            end_offset,
        }
    }
}

/// Ordered record batches covering a contiguous offset range, as produced
/// by one object fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadDataBlock {
    records: Vec<RecordBatchWithContext>,
}

impl ReadDataBlock {
    #[must_use]
    pub const fn new(records: Vec<RecordBatchWithContext>) -> Self {
        Self { records }
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

    /// Payload bytes held
    #[must_use]
    pub fn size(&self) -> usize {
        self.records.iter().map(RecordBatchWithContext::size).sum()
    }

    /// Copy limited to `max_bytes`: batches are taken until the limit is
    /// reached, the batch crossing it included and at least one batch kept
    #[must_use]
    pub fn limit(&self, max_bytes: usize) -> Self {
        let mut records = Vec::new();
        let mut bytes = 0usize;
        for batch in &self.records {
            if !records.is_empty() && bytes >= max_bytes {
                break;
            }
            bytes += batch.size();
            records.push(batch.clone());
        }
        Self { records }
    }
}

struct CacheEntry {
    block: Arc<ReadDataBlock>,
    size: usize,
    last_access: AtomicU64,
}

impl CacheEntry {
    fn touch(&self, clock: u64) {
        self.last_access.store(clock, Ordering::Relaxed);
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Reads served from a cached block
    pub hits: AtomicU64,
    /// Reads that started a store fetch
    pub misses: AtomicU64,
    /// Blocks evicted to stay under capacity
    pub evictions: AtomicU64,
    /// Fetch tasks issued against the object store
    pub fetches: AtomicU64,
    /// Reads that joined a fetch already in flight
    pub coalesced: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

type SharedFetch = Shared<BoxFuture<'static, std::result::Result<Arc<ReadDataBlock>, Arc<Error>>>>;

/// Rebuild an error delivered through a shared fetch
fn reissue(object_id: ObjectId, err: &Error) -> Error {
    match err {
        Error::ObjectFetch { object_id, reason } => Error::object_fetch(*object_id, reason.clone()),
        Error::DataIntegrity(msg) => Error::integrity(msg.clone()),
        other => Error::object_fetch(object_id, other.to_string()),
    }
}

struct CacheInner {
    store: Arc<dyn ObjectStore>,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    total_bytes: AtomicU64,
    capacity_bytes: usize,
    indexes: Mutex<HashMap<ObjectId, (Arc<ObjectIndex>, u64)>>,
    index_capacity: usize,
    inflight: Mutex<HashMap<CacheKey, SharedFetch>>,
    clock: AtomicU64,
    stats: CacheStats,
    max_attempts: u32,
    backoff: Duration,
}

impl CacheInner {
    /// Advance the logical clock and return the new value
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<ReadDataBlock>> {
        let entries = self.entries.read();
        entries.get(key).map(|entry| {
            entry.touch(self.tick());
            entry.block.clone()
        })
    }

    fn insert(&self, key: CacheKey, block: Arc<ReadDataBlock>) {
        let size = block.size();
        let clock = self.tick();
        let mut entries = self.entries.write();

        if let Some(old) = entries.remove(&key) {
            self.total_bytes.fetch_sub(old.size as u64, Ordering::Relaxed);
        }

        // Evict until the new block fits; blocks held by a reader stay
        while self.total_bytes.load(Ordering::Relaxed) as usize + size > self.capacity_bytes {
            let Some(evict_key) = Self::find_lru_entry(&entries) else {
                break;
            };
            if let Some(evicted) = entries.remove(&evict_key) {
                self.total_bytes.fetch_sub(evicted.size as u64, Ordering::Relaxed);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted block {:?} ({} bytes)", evict_key, evicted.size);
            }
        }

        self.total_bytes.fetch_add(size as u64, Ordering::Relaxed);
        entries.insert(
            key,
            CacheEntry {
                block,
                size,
                last_access: AtomicU64::new(clock),
            },
        );
    }

    /// Least recently used entry that no reader holds
    fn find_lru_entry(entries: &HashMap<CacheKey, CacheEntry>) -> Option<CacheKey> {
        entries
            .iter()
            .filter(|(_, entry)| Arc::strong_count(&entry.block) == 1)
            .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
            .map(|(key, _)| *key)
    }

    async fn index(&self, object_id: ObjectId) -> Result<Arc<ObjectIndex>> {
        if let Some((index, _)) = self.indexes.lock().get(&object_id) {
            return Ok(index.clone());
        }

        let size = self.store.size(object_id).await?;
        if size < FOOTER_SIZE {
            return Err(Error::integrity(format!("object {object_id} is too small")));
        }
        let footer_bytes = self
            .store
            .get(object_id, Some(size - FOOTER_SIZE..size))
            .await?;
        let footer = Footer::decode(object_id, &footer_bytes)?;
        if footer.index_range().end > size - FOOTER_SIZE {
            return Err(Error::integrity(format!("object {object_id} index out of bounds")));
        }
        let index_bytes = self.store.get(object_id, Some(footer.index_range())).await?;
        let index = Arc::new(ObjectIndex::decode(object_id, &footer, &index_bytes)?);

        let clock = self.tick();
        let mut indexes = self.indexes.lock();
        if indexes.len() >= self.index_capacity
            && let Some(oldest) = indexes
                .iter()
                .min_by_key(|(_, (_, access))| *access)
                .map(|(id, _)| *id)
        {
            indexes.remove(&oldest);
        }
        indexes.insert(object_id, (index.clone(), clock));
        Ok(index)
    }

    async fn fetch(&self, key: CacheKey) -> Result<ReadDataBlock> {
        let index = self.index(key.object_id).await?;
        let entry = *index.find(key.stream_id).ok_or_else(|| {
            Error::integrity(format!(
                "object {} holds no data of stream {}",
                key.object_id, key.stream_id
            ))
        })?;
        if entry.range().intersect(key.start_offset, key.end_offset).is_none() {
            return Err(Error::integrity(format!(
                "object {} holds {} of stream {}, not [{}, {})",
                key.object_id,
                entry.range(),
                key.stream_id,
                key.start_offset,
                key.end_offset
            )));
        }

        let data = self
            .store
            .get(key.object_id, Some(entry.byte_range()))
            .await?;
        let records = decode_block(key.object_id, &entry, data)?
            .into_iter()
            .filter(|b| b.last_offset() > key.start_offset && b.base_offset() < key.end_offset)
            .collect();
        Ok(ReadDataBlock::new(records))
    }

    async fn fetch_with_retry(&self, key: CacheKey) -> Result<ReadDataBlock> {
        let mut attempt = 1;
        loop {
            match self.fetch(key).await {
                Ok(block) => return Ok(block),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        "Fetch of {:?} failed (attempt {}/{}), retrying in {:?}: {}",
                        key, attempt, self.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(Error::ObjectStore(reason)) => {
                    return Err(Error::object_fetch(key.object_id, reason));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// LRU block cache over an object store
#[derive(Clone)]
pub struct BlockCache {
    inner: Arc<CacheInner>,
}

impl BlockCache {
    /// Create a new block cache in front of `store`
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                entries: RwLock::new(HashMap::new()),
                total_bytes: AtomicU64::new(0),
                capacity_bytes: config.capacity_bytes,
                indexes: Mutex::new(HashMap::new()),
                index_capacity: config.index_capacity.max(1),
                inflight: Mutex::new(HashMap::new()),
                clock: AtomicU64::new(0),
                stats: CacheStats::default(),
                max_attempts: config.fetch_max_attempts.max(1),
                backoff: config.fetch_backoff(),
            }),
        }
    }

    /// Get cache statistics
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    /// Number of cached blocks
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    /// Payload bytes currently cached
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.inner.total_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.entries.read().contains_key(key)
    }

    /// Read `[start_offset, end_offset)` of a stream from one object,
    /// returning at most `max_bytes` (the crossing batch included)
    pub async fn read(
        &self,
        object_id: ObjectId,
        stream_id: StreamId,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Result<ReadDataBlock> {
        let key = CacheKey::new(object_id, stream_id, start_offset, end_offset);
        if let Some(block) = self.inner.lookup(&key) {
            self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(block.limit(max_bytes));
        }

        let fetch = {
            let mut inflight = self.inner.inflight.lock();
            if let Some(block) = self.inner.lookup(&key) {
                // Completed between the first lookup and taking the lock
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(block.limit(max_bytes));
            }
            if let Some(fetch) = inflight.get(&key) {
                self.inner.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                fetch.clone()
            } else {
                self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                self.inner.stats.fetches.fetch_add(1, Ordering::Relaxed);
                let fetch = self.spawn_fetch(key);
                inflight.insert(key, fetch.clone());
                fetch
            }
        };

        match fetch.await {
            Ok(block) => Ok(block.limit(max_bytes)),
            Err(e) => Err(reissue(object_id, &e)),
        }
    }

    fn spawn_fetch(&self, key: CacheKey) -> SharedFetch {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let result = inner.fetch_with_retry(key).await;
            let result = match result {
                Ok(block) => {
                    let block = Arc::new(block);
                    inner.insert(key, block.clone());
                    Ok(block)
                }
                Err(e) => Err(Arc::new(e)),
            };
            inner.inflight.lock().remove(&key);
            result
        });
        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(Arc::new(Error::internal(format!("fetch task failed: {e}")))))
        }
        .boxed()
        .shared()
    }

    /// Drop every cached block and index of an object
    pub fn invalidate_object(&self, object_id: ObjectId) {
        let mut entries = self.inner.entries.write();
        entries.retain(|key, entry| {
            let keep = key.object_id != object_id;
            if !keep {
                self.inner
                    .total_bytes
                    .fetch_sub(entry.size as u64, Ordering::Relaxed);
            }
            keep
        });
        drop(entries);
        self.inner.indexes.lock().remove(&object_id);
    }
}
