//! Persistent metadata store backed by redb.
//!
//! Provides typed put/get/delete/load methods for each table. All writes
//! are synchronous (write txn + commit). The catalog and publisher keep the
//! in-memory view; this module only handles persistence.

use crate::image::BrokerS3WalMetadataImage;
use crate::stream::StreamMetadata;
use crate::tables;
use redb::{Database, ReadableTable};
use s3stream_common::StreamId;
use std::path::Path;
use tracing::debug;

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for s3stream_common::Error {
    fn from(e: MetaStoreError) -> Self {
        Self::Metadata(e.to_string())
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Persistent metadata store backed by redb.
pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::STREAMS)?;
            let _t = write_txn.open_table(tables::STREAM_NAMES)?;
            let _t = write_txn.open_table(tables::COUNTERS)?;
            let _t = write_txn.open_table(tables::WAL_IMAGE)?;
        }
        write_txn.commit()?;

        debug!("Opened metadata store at {}", path.display());
        Ok(Self { db })
    }

    // ---- Streams (bincode) ----

    pub fn put_stream(&self, meta: &StreamMetadata) -> MetaStoreResult<()> {
        let bytes = bincode::serialize(meta)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::STREAMS)?;
            table.insert(meta.stream_id.as_u64(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_stream(&self, stream_id: StreamId) -> MetaStoreResult<Option<StreamMetadata>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::STREAMS)?;
        match table.get(stream_id.as_u64())? {
            Some(val) => Ok(Some(bincode::deserialize(val.value())?)),
            None => Ok(None),
        }
    }

    pub fn load_streams(&self) -> MetaStoreResult<Vec<StreamMetadata>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::STREAMS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            result.push(bincode::deserialize(entry.1.value())?);
        }
        Ok(result)
    }

    /// Delete a stream and every name pointing at it
    pub fn delete_stream(&self, stream_id: StreamId) -> MetaStoreResult<()> {
        let names: Vec<String> = self
            .load_stream_names()?
            .into_iter()
            .filter(|(_, id)| *id == stream_id)
            .map(|(name, _)| name)
            .collect();

        let write_txn = self.db.begin_write()?;
        {
            let mut streams = write_txn.open_table(tables::STREAMS)?;
            streams.remove(stream_id.as_u64())?;
            let mut by_name = write_txn.open_table(tables::STREAM_NAMES)?;
            for name in &names {
                by_name.remove(name.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Allocate an id for `name` and persist fresh metadata for it in one
    /// transaction. Returns the existing stream if `name` is already bound.
    pub fn create_stream(&self, name: &str) -> MetaStoreResult<StreamMetadata> {
        if let Some(id) = self.get_stream_id(name)?
            && let Some(existing) = self.get_stream(id)?
        {
            return Ok(existing);
        }

        let write_txn = self.db.begin_write()?;
        let meta = {
            let mut counters = write_txn.open_table(tables::COUNTERS)?;
            let next = counters
                .get(tables::NEXT_STREAM_ID)?
                .map_or(0, |v| v.value());
            counters.insert(tables::NEXT_STREAM_ID, next + 1)?;

            let meta = StreamMetadata::new(StreamId::new(next));
            let bytes = bincode::serialize(&meta)?;
            let mut streams = write_txn.open_table(tables::STREAMS)?;
            streams.insert(next, bytes.as_slice())?;
            let mut by_name = write_txn.open_table(tables::STREAM_NAMES)?;
            by_name.insert(name, next)?;
            meta
        };
        write_txn.commit()?;
        debug!("Created stream '{}' with id {}", name, meta.stream_id);
        Ok(meta)
    }

    // ---- Stream names ----

    pub fn put_stream_name(&self, name: &str, stream_id: StreamId) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::STREAM_NAMES)?;
            table.insert(name, stream_id.as_u64())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_stream_id(&self, name: &str) -> MetaStoreResult<Option<StreamId>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::STREAM_NAMES)?;
        Ok(table.get(name)?.map(|v| StreamId::new(v.value())))
    }

    pub fn load_stream_names(&self) -> MetaStoreResult<Vec<(String, StreamId)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::STREAM_NAMES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            result.push((
                entry.0.value().to_string(),
                StreamId::new(entry.1.value()),
            ));
        }
        Ok(result)
    }

    // ---- Counters ----

    /// Next object id to hand out, `None` on a fresh store
    pub fn next_object_id(&self) -> MetaStoreResult<Option<u64>> {
        self.get_counter(tables::NEXT_OBJECT_ID)
    }

    pub fn set_next_object_id(&self, next: u64) -> MetaStoreResult<()> {
        self.put_counter(tables::NEXT_OBJECT_ID, next)
    }

    // ---- WAL image (bincode, single key) ----

    pub fn put_image(&self, image: &BrokerS3WalMetadataImage) -> MetaStoreResult<()> {
        let bytes = bincode::serialize(image)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::WAL_IMAGE)?;
            table.insert(tables::IMAGE_KEY, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_image(&self) -> MetaStoreResult<Option<BrokerS3WalMetadataImage>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::WAL_IMAGE)?;
        match table.get(tables::IMAGE_KEY)? {
            Some(val) => Ok(Some(bincode::deserialize(val.value())?)),
            None => Ok(None),
        }
    }

    // ---- Generic helpers ----

    fn put_counter(&self, key: &str, value: u64) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::COUNTERS)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_counter(&self, key: &str) -> MetaStoreResult<Option<u64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::COUNTERS)?;
        Ok(table.get(key)?.map(|v| v.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MetadataRecord;
    use crate::wal_object::S3WalObject;
    use crate::BrokerS3WalMetadataDelta;
    use s3stream_common::{BrokerId, ObjectId, OffsetRange};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_create_stream_allocates_ids() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();

        let a = store.create_stream("topic-a-0").unwrap();
        let b = store.create_stream("topic-b-0").unwrap();
        assert_ne!(a.stream_id, b.stream_id);

        // Same name returns the existing stream
        let again = store.create_stream("topic-a-0").unwrap();
        assert_eq!(again.stream_id, a.stream_id);

        let names = store.load_stream_names().unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(store.get_stream_id("topic-b-0").unwrap(), Some(b.stream_id));
    }

    #[test]
    fn test_stream_roundtrip_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.redb");
        let id = {
            let store = MetaStore::open(&path).unwrap();
            let mut meta = store.create_stream("s").unwrap();
            meta.open(BrokerId::new(10), 0).unwrap();
            meta.sealed_offset = 42;
            store.put_stream(&meta).unwrap();
            meta.stream_id
        };

        let store = MetaStore::open(&path).unwrap();
        let meta = store.get_stream(id).unwrap().unwrap();
        assert_eq!(meta.epoch, 1);
        assert_eq!(meta.sealed_offset, 42);
        assert_eq!(store.load_streams().unwrap().len(), 1);

        store.delete_stream(id).unwrap();
        assert!(store.get_stream(id).unwrap().is_none());
        assert!(store.get_stream_id("s").unwrap().is_none());
    }

    #[test]
    fn test_image_and_counters() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();
        assert!(store.load_image().unwrap().is_none());
        assert!(store.next_object_id().unwrap().is_none());

        let object = S3WalObject::new(
            ObjectId::new(123),
            BrokerId::new(10),
            20,
            [(StreamId::new(233), OffsetRange::new(110, 115))].into_iter().collect(),
        );
        let mut delta = BrokerS3WalMetadataDelta::new(Arc::new(
            BrokerS3WalMetadataImage::empty(BrokerId::new(10), 1),
        ));
        delta.replay(&MetadataRecord::wal_object_added(&object));
        let image = delta.apply();

        store.put_image(&image).unwrap();
        store.set_next_object_id(124).unwrap();
        assert_eq!(store.load_image().unwrap(), Some(image));
        assert_eq!(store.next_object_id().unwrap(), Some(124));
    }
}
