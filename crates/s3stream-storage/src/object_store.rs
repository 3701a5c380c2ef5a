//! Object store contract and reference implementations
//!
//! Objects are immutable once put. Gets may address a byte range so the
//! block cache can read an object's footer, index and single data blocks
//! without downloading the whole object.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use s3stream_common::{Error, ObjectId, Result};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Put/get/delete of immutable objects
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Store a complete object. Get-after-put is strongly consistent.
    async fn put(&self, object_id: ObjectId, data: Bytes) -> Result<()>;

    /// Read `range` of an object, or all of it when `range` is `None`
    async fn get(&self, object_id: ObjectId, range: Option<Range<u64>>) -> Result<Bytes>;

    /// Size of a stored object in bytes
    async fn size(&self, object_id: ObjectId) -> Result<u64>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, object_id: ObjectId) -> Result<()>;
}

fn slice_range(data: &Bytes, object_id: ObjectId, range: Option<Range<u64>>) -> Result<Bytes> {
    let Some(range) = range else {
        return Ok(data.clone());
    };
    let len = data.len() as u64;
    if range.start > range.end || range.end > len {
        return Err(Error::object_fetch(
            object_id,
            format!("range {}..{} outside object of {len} bytes", range.start, range.end),
        ));
    }
    Ok(data.slice(range.start as usize..range.end as usize))
}

/// In-memory object store, with get counters and failure injection for tests
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<ObjectId, Bytes>,
    gets: AtomicU64,
    puts: AtomicU64,
    fail_next_gets: AtomicU32,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of get calls served (including failed ones)
    #[must_use]
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Fail the next `n` gets with a retryable error
    pub fn fail_next_gets(&self, n: u32) {
        self.fail_next_gets.store(n, Ordering::Release);
    }

    #[must_use]
    pub fn contains(&self, object_id: ObjectId) -> bool {
        self.objects.contains_key(&object_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, object_id: ObjectId, data: Bytes) -> Result<()> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.objects.insert(object_id, data);
        Ok(())
    }

    async fn get(&self, object_id: ObjectId, range: Option<Range<u64>>) -> Result<Bytes> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let injected = self
            .fail_next_gets
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::object_fetch(object_id, "injected failure"));
        }

        let data = self
            .objects
            .get(&object_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::ObjectStore(format!("object {object_id} not found")))?;
        slice_range(&data, object_id, range)
    }

    async fn size(&self, object_id: ObjectId) -> Result<u64> {
        self.objects
            .get(&object_id)
            .map(|entry| entry.value().len() as u64)
            .ok_or_else(|| Error::ObjectStore(format!("object {object_id} not found")))
    }

    async fn delete(&self, object_id: ObjectId) -> Result<()> {
        self.objects.remove(&object_id);
        Ok(())
    }
}

/// One file per object under a directory
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Open (or create) the store rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        debug!("Opened filesystem object store at {}", root.display());
        Ok(Self { root })
    }

    fn object_path(&self, object_id: ObjectId) -> PathBuf {
        self.root.join(format!("{:020}.obj", object_id.as_u64()))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, object_id: ObjectId, data: Bytes) -> Result<()> {
        let path = self.object_path(object_id);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| Error::ObjectStore(format!("put {object_id}: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::ObjectStore(format!("put {object_id}: {e}")))?;
        Ok(())
    }

    async fn get(&self, object_id: ObjectId, range: Option<Range<u64>>) -> Result<Bytes> {
        let path = self.object_path(object_id);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::object_fetch(object_id, e.to_string()))?;

        let Some(range) = range else {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)
                .await
                .map_err(|e| Error::object_fetch(object_id, e.to_string()))?;
            return Ok(Bytes::from(buf));
        };

        let len = file
            .metadata()
            .await
            .map_err(|e| Error::object_fetch(object_id, e.to_string()))?
            .len();
        if range.start > range.end || range.end > len {
            return Err(Error::object_fetch(
                object_id,
                format!("range {}..{} outside object of {len} bytes", range.start, range.end),
            ));
        }
        file.seek(std::io::SeekFrom::Start(range.start))
            .await
            .map_err(|e| Error::object_fetch(object_id, e.to_string()))?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| Error::object_fetch(object_id, e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    async fn size(&self, object_id: ObjectId) -> Result<u64> {
        let meta = tokio::fs::metadata(self.object_path(object_id))
            .await
            .map_err(|e| Error::object_fetch(object_id, e.to_string()))?;
        Ok(meta.len())
    }

    async fn delete(&self, object_id: ObjectId) -> Result<()> {
        match tokio::fs::remove_file(self.object_path(object_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::ObjectStore(format!("delete {object_id}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_store_range_get() {
        let store = MemoryObjectStore::new();
        store
            .put(ObjectId::new(1), Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let part = store.get(ObjectId::new(1), Some(2..5)).await.unwrap();
        assert_eq!(part.as_ref(), b"234");
        assert_eq!(store.size(ObjectId::new(1)).await.unwrap(), 10);
        assert!(store.get(ObjectId::new(1), Some(8..12)).await.is_err());
        assert_eq!(store.get_count(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryObjectStore::new();
        store.put(ObjectId::new(1), Bytes::from_static(b"x")).await.unwrap();
        store.fail_next_gets(1);

        let err = store.get(ObjectId::new(1), None).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.get(ObjectId::new(1), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::open(dir.path().join("objects")).unwrap();
        let id = ObjectId::new(124);

        store.put(id, Bytes::from_static(b"hello object")).await.unwrap();
        assert_eq!(store.get(id, None).await.unwrap().as_ref(), b"hello object");
        assert_eq!(store.get(id, Some(6..12)).await.unwrap().as_ref(), b"object");
        assert_eq!(store.size(id).await.unwrap(), 12);

        store.delete(id).await.unwrap();
        store.delete(id).await.unwrap();
        assert!(store.get(id, None).await.unwrap_err().is_retryable());
    }
}
