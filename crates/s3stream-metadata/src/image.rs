//! Immutable snapshot of a broker's WAL objects.

use crate::wal_object::S3WalObject;
use s3stream_common::{BrokerId, Epoch, ObjectId, OffsetRange, StreamId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Broker → WAL object assignments at one metadata generation.
///
/// Never mutated once built; a [`BrokerS3WalMetadataDelta`] produces the
/// next generation as a new value.
///
/// [`BrokerS3WalMetadataDelta`]: crate::BrokerS3WalMetadataDelta
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerS3WalMetadataImage {
    broker_id: BrokerId,
    broker_epoch: Epoch,
    wal_objects: BTreeMap<ObjectId, S3WalObject>,
}

impl BrokerS3WalMetadataImage {
    #[must_use]
    pub const fn new(
        broker_id: BrokerId,
        broker_epoch: Epoch,
        wal_objects: BTreeMap<ObjectId, S3WalObject>,
    ) -> Self {
        Self {
            broker_id,
            broker_epoch,
            wal_objects,
        }
    }

    /// An image with no objects
    #[must_use]
    pub const fn empty(broker_id: BrokerId, broker_epoch: Epoch) -> Self {
        Self::new(broker_id, broker_epoch, BTreeMap::new())
    }

    #[must_use]
    pub const fn broker_id(&self) -> BrokerId {
        self.broker_id
    }

    #[must_use]
    pub const fn broker_epoch(&self) -> Epoch {
        self.broker_epoch
    }

    #[must_use]
    pub const fn wal_objects(&self) -> &BTreeMap<ObjectId, S3WalObject> {
        &self.wal_objects
    }

    #[must_use]
    pub fn get(&self, object_id: ObjectId) -> Option<&S3WalObject> {
        self.wal_objects.get(&object_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.wal_objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.wal_objects.is_empty()
    }

    /// Objects holding data of `stream_id`, ascending by object id
    pub fn stream_objects(
        &self,
        stream_id: StreamId,
    ) -> impl Iterator<Item = (ObjectId, OffsetRange)> + '_ {
        self.wal_objects
            .values()
            .filter_map(move |o| o.range_of(stream_id).map(|r| (o.object_id, r)))
    }

    /// Highest object id referenced by this image
    #[must_use]
    pub fn max_object_id(&self) -> Option<ObjectId> {
        self.wal_objects.keys().next_back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(id: u64, ranges: &[(u64, u64, u64)]) -> S3WalObject {
        S3WalObject::new(
            ObjectId::new(id),
            BrokerId::new(10),
            100,
            ranges
                .iter()
                .map(|&(s, a, b)| (StreamId::new(s), OffsetRange::new(a, b)))
                .collect(),
        )
    }

    #[test]
    fn test_stream_objects() {
        let mut objects = BTreeMap::new();
        objects.insert(ObjectId::new(124), object(124, &[(233, 115, 120)]));
        objects.insert(ObjectId::new(123), object(123, &[(233, 110, 115), (7, 0, 4)]));
        let image = BrokerS3WalMetadataImage::new(BrokerId::new(10), 1, objects);

        let found: Vec<_> = image.stream_objects(StreamId::new(233)).collect();
        assert_eq!(
            found,
            vec![
                (ObjectId::new(123), OffsetRange::new(110, 115)),
                (ObjectId::new(124), OffsetRange::new(115, 120)),
            ]
        );
        assert_eq!(image.stream_objects(StreamId::new(7)).count(), 1);
        assert_eq!(image.max_object_id(), Some(ObjectId::new(124)));
    }
}
