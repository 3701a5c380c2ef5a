//! Background upload of WAL-cached data into WAL objects
//!
//! One upload cycle:
//! 1. snapshot the WAL cache
//! 2. encode one object holding a block per stream and put it
//! 3. commit its ranges in the object manager
//! 4. record it in the metadata image and persist the sealed offsets
//! 5. release the uploaded batches and trim the WAL
//!
//! Each cycle finishes with garbage collection of objects that no live
//! range references any more.

use crate::catalog::StreamCatalog;
use crate::wal_cache::{PendingUpload, WalCache};
use s3stream_common::{ObjectId, Result, StreamId};
use s3stream_metadata::{MetadataPublisher, MetadataRecord, S3WalObject};
use s3stream_storage::{BlockCache, ObjectManager, ObjectStore, ObjectWriter, Wal};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, error, info, warn};

/// Counters exposed for inspection
#[derive(Debug, Default)]
pub struct UploadStats {
    pub objects: AtomicU64,
    pub bytes: AtomicU64,
    pub failures: AtomicU64,
    pub removed: AtomicU64,
}

pub struct Uploader {
    wal: Arc<dyn Wal>,
    store: Arc<dyn ObjectStore>,
    objects: Arc<ObjectManager>,
    cache: BlockCache,
    wal_cache: Arc<WalCache>,
    publisher: Arc<MetadataPublisher>,
    catalog: Arc<StreamCatalog>,
    max_pending_bytes: usize,
    /// One upload cycle at a time
    cycle: Mutex<()>,
    wakeup: Notify,
    stats: UploadStats,
}

impl Uploader {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        wal: Arc<dyn Wal>,
        store: Arc<dyn ObjectStore>,
        objects: Arc<ObjectManager>,
        cache: BlockCache,
        wal_cache: Arc<WalCache>,
        publisher: Arc<MetadataPublisher>,
        catalog: Arc<StreamCatalog>,
        max_pending_bytes: usize,
    ) -> Self {
        Self {
            wal,
            store,
            objects,
            cache,
            wal_cache,
            publisher,
            catalog,
            max_pending_bytes,
            cycle: Mutex::new(()),
            wakeup: Notify::new(),
            stats: UploadStats::default(),
        }
    }

    #[must_use]
    pub const fn stats(&self) -> &UploadStats {
        &self.stats
    }

    /// Largest batch an append may carry
    #[must_use]
    pub const fn max_batch_bytes(&self) -> usize {
        self.max_pending_bytes
    }

    /// Wake the upload loop when enough data is pending
    pub fn maybe_trigger(&self) {
        if self.wal_cache.pending_bytes() >= self.max_pending_bytes {
            self.wakeup.notify_one();
        }
    }

    /// Upload everything pending
    pub async fn upload(&self) -> Result<Option<S3WalObject>> {
        let _cycle = self.cycle.lock().await;
        let pending = self.wal_cache.snapshot(None);
        let object = self.upload_pending(pending).await?;
        self.collect_garbage().await?;
        Ok(object)
    }

    /// Upload the pending data of a single stream
    pub async fn upload_stream(&self, stream_id: StreamId) -> Result<Option<S3WalObject>> {
        let _cycle = self.cycle.lock().await;
        let pending = self.wal_cache.snapshot(Some(stream_id));
        self.upload_pending(pending).await
    }

    async fn upload_pending(&self, pending: PendingUpload) -> Result<Option<S3WalObject>> {
        if pending.is_empty() {
            return Ok(None);
        }

        let mut writer = ObjectWriter::new();
        for (stream_id, batches) in &pending.streams {
            // Data already sealed by an earlier cycle can still sit in the
            // cache after a restart replayed it from the WAL
            let sealed = self.objects.sealed_end(*stream_id).unwrap_or(0);
            let fresh: Vec<_> = batches
                .iter()
                .filter(|b| b.base_offset() >= sealed)
                .cloned()
                .collect();
            if fresh.is_empty() {
                self.wal_cache.release(*stream_id, sealed);
                continue;
            }
            writer.write_block(*stream_id, &fresh)?;
        }
        if writer.is_empty() {
            self.wal.trim(pending.confirmed).await?;
            return Ok(None);
        }

        let ranges = writer.ranges();
        let data = writer.finish()?;
        let size = data.len() as u64;
        let object_id = self.objects.assign_object_id();
        self.catalog
            .store()
            .set_next_object_id(self.objects.next_object_id())?;

        if let Err(e) = self.store.put(object_id, data).await {
            self.objects.abort_object(object_id);
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            warn!("Upload of object {} failed: {}", object_id, e);
            return Err(e);
        }

        let object = match self.objects.commit_object(object_id, size, &ranges) {
            Ok(object) => object,
            Err(e) => {
                self.objects.abort_object(object_id);
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                error!("Commit of object {} failed: {}", object_id, e);
                if let Err(delete) = self.store.delete(object_id).await {
                    warn!("Failed to delete orphan object {}: {}", object_id, delete);
                }
                return Err(e);
            }
        };

        self.publisher
            .replay(&MetadataRecord::wal_object_added(&object));
        self.publisher.publish()?;

        for (stream_id, range) in &ranges {
            if let Err(e) = self.catalog.advance_sealed(*stream_id, range.end) {
                // The image already holds the object, restore picks the
                // sealed end up from there
                warn!("Failed to persist sealed offset of stream {}: {}", stream_id, e);
            }
            self.wal_cache.release(*stream_id, range.end);
            if let Some(meta) = self.catalog.stream_metadata(*stream_id) {
                self.objects.trim_stream(*stream_id, meta.start_offset);
            }
        }
        self.wal.trim(pending.confirmed).await?;

        self.stats.objects.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes.fetch_add(size, Ordering::Relaxed);
        info!(
            "Uploaded object {} ({} bytes, {} streams), WAL trimmed to {}",
            object_id,
            size,
            ranges.len(),
            pending.confirmed
        );
        Ok(Some(object))
    }

    /// Delete objects no live range references and publish their removal
    pub async fn collect_garbage(&self) -> Result<Vec<ObjectId>> {
        let records = self.objects.remove_eligible(self.store.as_ref()).await;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut removed = Vec::with_capacity(records.len());
        for record in &records {
            if let MetadataRecord::WalObjectRemoved(r) = record {
                self.cache.invalidate_object(r.object_id);
                removed.push(r.object_id);
            }
            self.publisher.replay(record);
        }
        self.publisher.publish()?;
        self.stats
            .removed
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        debug!("Garbage collected objects {:?}", removed);
        Ok(removed)
    }

    /// Long-running background task: upload every `interval`, or sooner
    /// when the pending size crosses the trigger
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.wakeup.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            match self.upload().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!("Upload loop stopping: {}", e);
                    break;
                }
                Err(e) => warn!("Upload cycle failed: {}", e),
            }
        }
        debug!("Upload loop exited");
    }
}
