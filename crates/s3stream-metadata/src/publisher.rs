//! Single-writer owner of the current delta and the published image.

use crate::delta::BrokerS3WalMetadataDelta;
use crate::image::BrokerS3WalMetadataImage;
use crate::record::MetadataRecord;
use crate::store::{MetaStore, MetaStoreResult};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Replays metadata records into a delta and publishes new images.
///
/// Readers take an `Arc` snapshot through [`image`](Self::image) and never
/// see a partially applied delta. Publication persists the image before it
/// becomes visible.
pub struct MetadataPublisher {
    current: RwLock<Arc<BrokerS3WalMetadataImage>>,
    delta: Mutex<BrokerS3WalMetadataDelta>,
    store: Option<Arc<MetaStore>>,
    generation: AtomicU64,
}

impl MetadataPublisher {
    #[must_use]
    pub fn new(image: BrokerS3WalMetadataImage, store: Option<Arc<MetaStore>>) -> Self {
        let image = Arc::new(image);
        Self {
            delta: Mutex::new(BrokerS3WalMetadataDelta::new(image.clone())),
            current: RwLock::new(image),
            store,
            generation: AtomicU64::new(0),
        }
    }

    /// Current published image
    #[must_use]
    pub fn image(&self) -> Arc<BrokerS3WalMetadataImage> {
        self.current.read().clone()
    }

    /// Number of images published since construction
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn replay(&self, record: &MetadataRecord) {
        self.delta.lock().replay(record);
    }

    /// Apply the pending delta and publish the result.
    ///
    /// Does nothing when no record was replayed since the last publication.
    pub fn publish(&self) -> MetaStoreResult<Arc<BrokerS3WalMetadataImage>> {
        let mut delta = self.delta.lock();
        if delta.is_empty() {
            return Ok(delta.image().clone());
        }

        let next = Arc::new(delta.apply());
        if let Some(store) = &self.store {
            store.put_image(&next)?;
        }
        *self.current.write() = next.clone();
        *delta = BrokerS3WalMetadataDelta::new(next.clone());
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        if generation % 100 == 0 {
            info!("Published metadata image generation {} ({} objects)", generation, next.len());
        } else {
            debug!("Published metadata image generation {} ({} objects)", generation, next.len());
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal_object::S3WalObject;
    use s3stream_common::{BrokerId, ObjectId, OffsetRange, StreamId};
    use tempfile::tempdir;

    fn object(id: u64) -> S3WalObject {
        S3WalObject::new(
            ObjectId::new(id),
            BrokerId::new(10),
            10,
            [(StreamId::new(233), OffsetRange::new(id * 5, id * 5 + 5))]
                .into_iter()
                .collect(),
        )
    }

    #[test]
    fn test_readers_see_only_published_images() {
        let publisher = MetadataPublisher::new(BrokerS3WalMetadataImage::empty(BrokerId::new(10), 1), None);
        let before = publisher.image();

        publisher.replay(&MetadataRecord::wal_object_added(&object(1)));
        assert!(publisher.image().is_empty());

        let after = publisher.publish().unwrap();
        assert_eq!(after.len(), 1);
        assert!(before.is_empty());
        assert_eq!(publisher.image().len(), 1);
        assert_eq!(publisher.generation(), 1);
    }

    #[test]
    fn test_publish_empty_delta_keeps_image() {
        let publisher = MetadataPublisher::new(BrokerS3WalMetadataImage::empty(BrokerId::new(10), 1), None);
        let before = publisher.image();
        let after = publisher.publish().unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(publisher.generation(), 0);
    }

    #[test]
    fn test_publish_persists_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.redb");
        {
            let store = Arc::new(MetaStore::open(&path).unwrap());
            let publisher = MetadataPublisher::new(
                BrokerS3WalMetadataImage::empty(BrokerId::new(10), 1),
                Some(store),
            );
            publisher.replay(&MetadataRecord::wal_object_added(&object(1)));
            publisher.replay(&MetadataRecord::wal_object_added(&object(2)));
            publisher.publish().unwrap();
            publisher.replay(&MetadataRecord::wal_object_removed(ObjectId::new(1)));
            publisher.publish().unwrap();
        }

        let store = MetaStore::open(&path).unwrap();
        let image = store.load_image().unwrap().unwrap();
        assert_eq!(image.len(), 1);
        assert!(image.get(ObjectId::new(2)).is_some());
    }
}
