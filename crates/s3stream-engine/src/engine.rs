//! Engine: wires the storage layers together, recovers state on open and
//! owns the background upload task

use crate::catalog::StreamCatalog;
use crate::lazy_stream::LazyStream;
use crate::stream::StreamContext;
use crate::stream_manager::StreamManager;
use crate::uploader::{UploadStats, Uploader};
use crate::wal_cache::WalCache;
use parking_lot::Mutex;
use s3stream_common::config::ObjectStoreKind;
use s3stream_common::{Config, Result, StreamId};
use s3stream_metadata::{
    BrokerS3WalMetadataImage, MetaStore, MetadataPublisher, MetadataRecord, S3WalObject,
    StreamMetadata, StreamState,
};
use s3stream_storage::{
    BlockCache, CacheStats, FileWal, FsObjectStore, MemoryObjectStore, ObjectManager, ObjectStore,
    Wal,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Engine {
    config: Config,
    ctx: Arc<StreamContext>,
    publisher: Arc<MetadataPublisher>,
    streams: StreamManager,
    shutdown_tx: watch::Sender<bool>,
    upload_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Open the engine on the configured data directory: file WAL, redb
    /// meta store and the configured object store
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let wal: Arc<dyn Wal> = Arc::new(FileWal::open(
            config.wal_path(),
            config.wal.max_size,
            config.wal.sync_mode,
        )?);
        let store: Arc<dyn ObjectStore> = match config.object_store.kind {
            ObjectStoreKind::Memory => Arc::new(MemoryObjectStore::new()),
            ObjectStoreKind::Fs => Arc::new(FsObjectStore::open(config.object_store_path())?),
        };
        let meta = Arc::new(MetaStore::open(config.meta_path())?);
        Self::open_with(config, wal, store, meta).await
    }

    /// Open the engine over explicit components and recover:
    /// 1. load stream metadata and the last published image
    /// 2. rebuild object ranges
    /// 3. replay untrimmed WAL records into the WAL cache
    /// 4. reopen the streams this broker owned
    pub async fn open_with(
        config: Config,
        wal: Arc<dyn Wal>,
        store: Arc<dyn ObjectStore>,
        meta: Arc<MetaStore>,
    ) -> Result<Self> {
        config.validate()?;
        let broker_id = config.broker.broker_id;
        let broker_epoch = config.broker.broker_epoch;

        let catalog = Arc::new(StreamCatalog::open(meta.clone(), broker_id)?);
        let image = meta
            .load_image()?
            .unwrap_or_else(|| BrokerS3WalMetadataImage::empty(broker_id, broker_epoch));
        let publisher = Arc::new(MetadataPublisher::new(image, Some(meta.clone())));
        publisher.replay(&MetadataRecord::broker_assigned(broker_id, broker_epoch));
        publisher.publish()?;

        let objects = Arc::new(ObjectManager::new(broker_id));
        let stream_metas = catalog.list_streams();
        objects.restore(&publisher.image(), &stream_metas);
        if let Some(next) = meta.next_object_id()? {
            objects.ensure_next_object_id(next);
        }

        let wal_cache = Arc::new(WalCache::new(wal.next_seq()));
        recover_wal(wal.as_ref(), &wal_cache, &objects, &stream_metas).await?;

        let cache = BlockCache::new(store.clone(), &config.cache);
        let uploader = Arc::new(Uploader::new(
            wal.clone(),
            store,
            objects.clone(),
            cache.clone(),
            wal_cache.clone(),
            publisher.clone(),
            catalog.clone(),
            config.upload.max_pending_bytes,
        ));
        let ctx = Arc::new(StreamContext::new(
            wal,
            objects,
            cache,
            wal_cache,
            catalog.clone(),
            uploader.clone(),
            config.upload.max_objects_per_fetch,
        ));

        let opened: HashMap<StreamId, StreamState> = stream_metas
            .iter()
            .map(|m| (m.stream_id, m.state))
            .collect();
        let assignments: Vec<(String, StreamId)> = catalog
            .stream_names()?
            .into_iter()
            .filter(|(_, id)| opened.get(id) == Some(&StreamState::Opened))
            .collect();
        let streams = StreamManager::with_streams(ctx.clone(), assignments).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let upload_task = tokio::spawn(uploader.run(config.upload.interval(), shutdown_rx));

        info!(
            "Engine opened: broker {} epoch {}, {} streams, {} objects",
            broker_id,
            broker_epoch,
            stream_metas.len(),
            publisher.image().len()
        );
        Ok(Self {
            config,
            ctx,
            publisher,
            streams,
            shutdown_tx,
            upload_task: Mutex::new(Some(upload_task)),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn streams(&self) -> &StreamManager {
        &self.streams
    }

    /// Handle for the stream named `name`, created on first use
    #[must_use]
    pub fn stream(&self, name: &str) -> Arc<LazyStream> {
        self.streams.get_or_create_stream(name)
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<StreamCatalog> {
        &self.ctx.catalog
    }

    #[must_use]
    pub fn list_streams(&self) -> Vec<StreamMetadata> {
        self.ctx.catalog.list_streams()
    }

    /// Currently published metadata image
    #[must_use]
    pub fn image(&self) -> Arc<BrokerS3WalMetadataImage> {
        self.publisher.image()
    }

    #[must_use]
    pub fn object_manager(&self) -> &Arc<ObjectManager> {
        &self.ctx.objects
    }

    #[must_use]
    pub fn cache_stats(&self) -> &CacheStats {
        self.ctx.cache.stats()
    }

    #[must_use]
    pub fn upload_stats(&self) -> &UploadStats {
        self.ctx.uploader.stats()
    }

    /// Bytes waiting in the WAL cache for upload
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.ctx.wal_cache.pending_bytes()
    }

    /// Upload everything pending now
    pub async fn flush(&self) -> Result<Option<S3WalObject>> {
        self.ctx.uploader.upload().await
    }

    /// Stop the upload loop, close every stream (uploading its pending
    /// data) and run a final upload cycle
    pub async fn shutdown(self) -> Result<()> {
        self.stop_upload_loop().await;
        let closed = self.streams.close_all().await;
        let flushed = self.flush().await;
        info!("Engine shut down");
        closed.and(flushed.map(|_| ()))
    }

    /// Stop background work without uploading anything. Data acked by the
    /// WAL stays there for the next open to recover.
    pub async fn abort(self) {
        let task = self.upload_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        warn!("Engine aborted with {} pending bytes", self.pending_bytes());
    }

    async fn stop_upload_loop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.upload_task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!("Upload loop ended abnormally: {}", e);
        }
    }
}

/// Replay untrimmed WAL records into the cache, skipping data already
/// sealed into objects and records of unknown streams
async fn recover_wal(
    wal: &dyn Wal,
    wal_cache: &WalCache,
    objects: &ObjectManager,
    streams: &[StreamMetadata],
) -> Result<()> {
    let sealed: HashMap<StreamId, u64> = streams
        .iter()
        .map(|m| {
            let end = objects.sealed_end(m.stream_id).unwrap_or(0);
            (m.stream_id, end.max(m.sealed_offset))
        })
        .collect();

    let entries = wal.recover().await?;
    let total = entries.len();
    let mut replayed = 0;
    for entry in entries {
        let Some(sealed_end) = sealed.get(&entry.stream_id) else {
            warn!(
                "Dropping WAL record {} of unknown stream {}",
                entry.seq, entry.stream_id
            );
            continue;
        };
        if entry.batch.last_offset() <= *sealed_end {
            continue;
        }
        wal_cache.insert(entry.stream_id, entry.seq, entry.batch);
        replayed += 1;
    }
    if total > 0 {
        info!(
            "Recovered {} of {} WAL records ({} already sealed)",
            replayed,
            total,
            total - replayed
        );
    } else {
        debug!("WAL is empty, nothing to recover");
    }
    Ok(())
}
