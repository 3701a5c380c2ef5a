//! Mutable change set against a [`BrokerS3WalMetadataImage`].

use crate::image::BrokerS3WalMetadataImage;
use crate::record::{
    BrokerWalMetadataRecord, MetadataRecord, RemoveWalObjectRecord, WalObjectRecord,
};
use crate::wal_object::S3WalObject;
use s3stream_common::{BrokerId, Epoch, ObjectId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::error;

/// Accumulates replayed records for one image generation.
///
/// Added and removed object ids are mutually exclusive: the last record
/// replayed for an object wins.
#[derive(Debug)]
pub struct BrokerS3WalMetadataDelta {
    image: Arc<BrokerS3WalMetadataImage>,
    broker_id: BrokerId,
    broker_epoch: Epoch,
    added: BTreeMap<ObjectId, S3WalObject>,
    removed: BTreeSet<ObjectId>,
    changed: bool,
}

impl BrokerS3WalMetadataDelta {
    #[must_use]
    pub fn new(image: Arc<BrokerS3WalMetadataImage>) -> Self {
        Self {
            broker_id: image.broker_id(),
            broker_epoch: image.broker_epoch(),
            image,
            added: BTreeMap::new(),
            removed: BTreeSet::new(),
            changed: false,
        }
    }

    /// The base image this delta applies to
    #[must_use]
    pub const fn image(&self) -> &Arc<BrokerS3WalMetadataImage> {
        &self.image
    }

    /// True when no record has been replayed
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.changed
    }

    pub fn replay(&mut self, record: &MetadataRecord) {
        match record {
            MetadataRecord::BrokerAssigned(r) => self.replay_broker(r),
            MetadataRecord::WalObjectAdded(r) => self.replay_added(r),
            MetadataRecord::WalObjectRemoved(r) => self.replay_removed(r),
        }
    }

    pub fn replay_broker(&mut self, record: &BrokerWalMetadataRecord) {
        self.broker_id = record.broker_id;
        self.broker_epoch = record.broker_epoch;
        self.changed = true;
    }

    pub fn replay_added(&mut self, record: &WalObjectRecord) {
        self.added
            .insert(record.object_id, S3WalObject::of(record));
        self.removed.remove(&record.object_id);
        self.changed = true;
    }

    pub fn replay_removed(&mut self, record: &RemoveWalObjectRecord) {
        let known = self.image.get(record.object_id).is_some()
            || self.added.contains_key(&record.object_id);
        if !known {
            error!(
                "Replayed removal of unknown WAL object {} (broker {})",
                record.object_id, self.broker_id
            );
        }
        debug_assert!(known, "removal of unknown WAL object {}", record.object_id);
        self.removed.insert(record.object_id);
        self.added.remove(&record.object_id);
        self.changed = true;
    }

    /// Produce the next image: base objects overlaid with the added ones,
    /// minus the removed ones. The base image is left untouched.
    #[must_use]
    pub fn apply(&self) -> BrokerS3WalMetadataImage {
        let mut objects = self.image.wal_objects().clone();
        for (id, object) in &self.added {
            objects.insert(*id, object.clone());
        }
        for id in &self.removed {
            objects.remove(id);
        }
        BrokerS3WalMetadataImage::new(self.broker_id, self.broker_epoch, objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s3stream_common::{OffsetRange, StreamId};

    fn added(id: u64, start: u64, end: u64) -> MetadataRecord {
        MetadataRecord::WalObjectAdded(WalObjectRecord {
            object_id: ObjectId::new(id),
            broker_id: BrokerId::new(10),
            object_size: 10,
            stream_ranges: vec![(StreamId::new(233), OffsetRange::new(start, end))],
        })
    }

    fn base() -> Arc<BrokerS3WalMetadataImage> {
        let mut delta =
            BrokerS3WalMetadataDelta::new(Arc::new(BrokerS3WalMetadataImage::empty(BrokerId::new(10), 1)));
        delta.replay(&added(1, 0, 10));
        Arc::new(delta.apply())
    }

    #[test]
    fn test_empty_delta_apply_is_identity() {
        let image = base();
        let delta = BrokerS3WalMetadataDelta::new(image.clone());
        assert!(delta.is_empty());
        assert_eq!(delta.apply(), *image);
    }

    #[test]
    fn test_add_then_remove() {
        let image = base();
        let mut delta = BrokerS3WalMetadataDelta::new(image.clone());
        delta.replay(&added(2, 10, 20));
        delta.replay(&MetadataRecord::wal_object_removed(ObjectId::new(2)));

        let next = delta.apply();
        assert!(next.get(ObjectId::new(2)).is_none());
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn test_remove_then_add() {
        let image = base();
        let mut delta = BrokerS3WalMetadataDelta::new(image.clone());
        delta.replay(&MetadataRecord::wal_object_removed(ObjectId::new(1)));
        delta.replay(&added(1, 0, 12));

        let next = delta.apply();
        let object = next.get(ObjectId::new(1)).unwrap();
        assert_eq!(object.range_of(StreamId::new(233)), Some(OffsetRange::new(0, 12)));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "removal of unknown WAL object")]
    fn test_removing_unknown_object_asserts() {
        let mut delta = BrokerS3WalMetadataDelta::new(base());
        delta.replay(&MetadataRecord::wal_object_removed(ObjectId::new(42)));
    }

    #[test]
    fn test_removing_twice_is_accepted() {
        let mut delta = BrokerS3WalMetadataDelta::new(base());
        delta.replay(&MetadataRecord::wal_object_removed(ObjectId::new(1)));
        delta.replay(&MetadataRecord::wal_object_removed(ObjectId::new(1)));
        assert!(delta.apply().is_empty());
    }

    #[test]
    fn test_apply_does_not_mutate_base() {
        let image = base();
        let mut delta = BrokerS3WalMetadataDelta::new(image.clone());
        delta.replay(&MetadataRecord::wal_object_removed(ObjectId::new(1)));
        delta.replay(&added(5, 10, 20));

        let next = delta.apply();
        assert!(next.get(ObjectId::new(1)).is_none());
        assert!(image.get(ObjectId::new(1)).is_some());
        assert!(image.get(ObjectId::new(5)).is_none());
    }

    #[test]
    fn test_broker_assignment() {
        let mut delta =
            BrokerS3WalMetadataDelta::new(Arc::new(BrokerS3WalMetadataImage::empty(BrokerId::new(1), 1)));
        delta.replay(&MetadataRecord::broker_assigned(BrokerId::new(10), 7));
        let next = delta.apply();
        assert_eq!(next.broker_id(), BrokerId::new(10));
        assert_eq!(next.broker_epoch(), 7);
        assert!(next.is_empty());
    }
}
