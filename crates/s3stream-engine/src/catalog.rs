//! Stream catalog: the metadata authority for streams
//!
//! Every change is written to the [`MetaStore`] before it becomes visible
//! through the in-memory view.

use parking_lot::{Mutex, RwLock};
use s3stream_common::{BrokerId, Epoch, Error, Result, StreamId};
use s3stream_metadata::{MetaStore, StreamMetadata, StreamState};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct StreamCatalog {
    store: Arc<MetaStore>,
    broker_id: BrokerId,
    streams: RwLock<HashMap<StreamId, StreamMetadata>>,
    /// Serializes read-modify-write cycles against the store
    write_lock: Mutex<()>,
}

impl StreamCatalog {
    /// Load every persisted stream
    pub fn open(store: Arc<MetaStore>, broker_id: BrokerId) -> Result<Self> {
        let streams: HashMap<StreamId, StreamMetadata> = store
            .load_streams()?
            .into_iter()
            .map(|meta| (meta.stream_id, meta))
            .collect();
        info!("Loaded {} streams from the meta store", streams.len());
        Ok(Self {
            store,
            broker_id,
            streams: RwLock::new(streams),
            write_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<MetaStore> {
        &self.store
    }

    #[must_use]
    pub const fn broker_id(&self) -> BrokerId {
        self.broker_id
    }

    /// Create the stream bound to `name`, or return the one already bound
    pub fn create_stream(&self, name: &str) -> Result<StreamMetadata> {
        let _guard = self.write_lock.lock();
        let meta = self.store.create_stream(name)?;
        self.streams.write().insert(meta.stream_id, meta.clone());
        debug!("Stream {} bound to name {:?}", meta.stream_id, name);
        Ok(meta)
    }

    /// Take ownership of a stream for this broker: bump the epoch, close
    /// the previous open range at `next_offset` and open a new one
    pub fn open_stream(&self, stream_id: StreamId, next_offset: u64) -> Result<StreamMetadata> {
        let meta = self.update(stream_id, |meta| {
            meta.open(self.broker_id, next_offset)?;
            Ok(())
        })?;
        info!(
            "Opened stream {} at epoch {} (next offset {})",
            stream_id, meta.epoch, next_offset
        );
        Ok(meta)
    }

    /// Advance the start offset of a stream owned at `epoch`
    pub fn trim_stream(
        &self,
        stream_id: StreamId,
        epoch: Epoch,
        new_start: u64,
    ) -> Result<StreamMetadata> {
        self.update(stream_id, |meta| {
            check_owner(meta, epoch)?;
            meta.trim(new_start)
        })
    }

    /// Seal the open range of a stream owned at `epoch` at `end_offset`
    /// and mark it closed
    pub fn close_stream(
        &self,
        stream_id: StreamId,
        epoch: Epoch,
        end_offset: u64,
    ) -> Result<StreamMetadata> {
        let meta = self.update(stream_id, |meta| {
            check_owner(meta, epoch)?;
            meta.close(end_offset)
        })?;
        info!("Closed stream {} at offset {}", stream_id, end_offset);
        Ok(meta)
    }

    /// Fails with [`Error::FencedEpoch`] unless `epoch` still owns the stream
    pub fn check_epoch(&self, stream_id: StreamId, epoch: Epoch) -> Result<()> {
        let streams = self.streams.read();
        let meta = streams
            .get(&stream_id)
            .ok_or(Error::StreamNotFound(stream_id))?;
        check_owner(meta, epoch)
    }

    /// Record that a stream's data up to `sealed_offset` lives in objects
    pub fn advance_sealed(&self, stream_id: StreamId, sealed_offset: u64) -> Result<()> {
        self.update(stream_id, |meta| {
            meta.sealed_offset = meta.sealed_offset.max(sealed_offset);
            Ok(())
        })?;
        Ok(())
    }

    #[must_use]
    pub fn stream_metadata(&self, stream_id: StreamId) -> Option<StreamMetadata> {
        self.streams.read().get(&stream_id).cloned()
    }

    /// Every stream, ordered by id
    #[must_use]
    pub fn list_streams(&self) -> Vec<StreamMetadata> {
        let mut streams: Vec<_> = self.streams.read().values().cloned().collect();
        streams.sort_by_key(|meta| meta.stream_id);
        streams
    }

    /// Streams currently owned by this broker
    #[must_use]
    pub fn opened_streams(&self) -> Vec<StreamMetadata> {
        self.list_streams()
            .into_iter()
            .filter(|meta| meta.state == StreamState::Opened)
            .collect()
    }

    /// Persisted `name → stream id` bindings
    pub fn stream_names(&self) -> Result<Vec<(String, StreamId)>> {
        Ok(self.store.load_stream_names()?)
    }

    fn update<F>(&self, stream_id: StreamId, f: F) -> Result<StreamMetadata>
    where
        F: FnOnce(&mut StreamMetadata) -> Result<()>,
    {
        let _guard = self.write_lock.lock();
        let mut meta = self
            .streams
            .read()
            .get(&stream_id)
            .cloned()
            .ok_or(Error::StreamNotFound(stream_id))?;
        f(&mut meta)?;
        self.store.put_stream(&meta)?;
        self.streams.write().insert(stream_id, meta.clone());
        Ok(meta)
    }
}

fn check_owner(meta: &StreamMetadata, epoch: Epoch) -> Result<()> {
    if meta.epoch != epoch {
        return Err(Error::FencedEpoch {
            stream_id: meta.stream_id,
            epoch,
            current: meta.epoch,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn catalog(dir: &std::path::Path) -> StreamCatalog {
        let store = Arc::new(MetaStore::open(dir.join("meta.redb")).unwrap());
        StreamCatalog::open(store, BrokerId::new(10)).unwrap()
    }

    #[test]
    fn test_create_is_idempotent_per_name() {
        let dir = tempdir().unwrap();
        let catalog = catalog(dir.path());

        let a = catalog.create_stream("orders").unwrap();
        let b = catalog.create_stream("orders").unwrap();
        let c = catalog.create_stream("payments").unwrap();
        assert_eq!(a.stream_id, b.stream_id);
        assert_ne!(a.stream_id, c.stream_id);
        assert_eq!(catalog.list_streams().len(), 2);
    }

    #[test]
    fn test_open_bumps_epoch_and_survives_reload() {
        let dir = tempdir().unwrap();
        let id = {
            let catalog = catalog(dir.path());
            let meta = catalog.create_stream("orders").unwrap();
            let opened = catalog.open_stream(meta.stream_id, 0).unwrap();
            assert_eq!(opened.epoch, 1);
            catalog.advance_sealed(meta.stream_id, 40).unwrap();
            catalog.close_stream(meta.stream_id, 1, 50).unwrap();
            meta.stream_id
        };

        let catalog = catalog(dir.path());
        let meta = catalog.stream_metadata(id).unwrap();
        assert_eq!(meta.sealed_offset, 40);
        assert_eq!(meta.state, StreamState::Closed);
        assert_eq!(meta.ranges[0].end_offset, Some(50));

        let reopened = catalog.open_stream(id, 50).unwrap();
        assert_eq!(reopened.epoch, 2);
        assert_eq!(reopened.ranges.len(), 2);
        reopened.check_invariants().unwrap();
    }

    #[test]
    fn test_trim_regression_rejected() {
        let dir = tempdir().unwrap();
        let catalog = catalog(dir.path());
        let id = catalog.create_stream("orders").unwrap().stream_id;

        catalog.trim_stream(id, 0, 10).unwrap();
        assert!(catalog.trim_stream(id, 0, 5).is_err());
        assert_eq!(catalog.stream_metadata(id).unwrap().start_offset, 10);
        assert!(matches!(
            catalog.trim_stream(StreamId::new(999), 0, 1),
            Err(Error::StreamNotFound(_))
        ));
    }

    #[test]
    fn test_stale_epoch_cannot_change_metadata() {
        let dir = tempdir().unwrap();
        let catalog = catalog(dir.path());
        let id = catalog.create_stream("orders").unwrap().stream_id;
        catalog.open_stream(id, 0).unwrap();
        catalog.open_stream(id, 4).unwrap();

        assert!(matches!(
            catalog.trim_stream(id, 1, 2),
            Err(Error::FencedEpoch { epoch: 1, current: 2, .. })
        ));
        assert!(matches!(
            catalog.close_stream(id, 1, 4),
            Err(Error::FencedEpoch { epoch: 1, current: 2, .. })
        ));
        assert!(catalog.check_epoch(id, 1).is_err());
        catalog.check_epoch(id, 2).unwrap();

        let meta = catalog.stream_metadata(id).unwrap();
        assert_eq!(meta.state, StreamState::Opened);
        assert_eq!(meta.start_offset, 0);
        assert_eq!(meta.ranges.last().unwrap().end_offset, None);

        catalog.trim_stream(id, 2, 2).unwrap();
        catalog.close_stream(id, 2, 6).unwrap();
    }
}
