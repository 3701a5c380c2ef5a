//! Metadata records replayed into a [`BrokerS3WalMetadataDelta`].
//!
//! [`BrokerS3WalMetadataDelta`]: crate::BrokerS3WalMetadataDelta

use crate::wal_object::S3WalObject;
use s3stream_common::{BrokerId, Epoch, ObjectId, OffsetRange, StreamId};
use serde::{Deserialize, Serialize};

/// Assigns the broker identity and epoch of a WAL
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerWalMetadataRecord {
    pub broker_id: BrokerId,
    pub broker_epoch: Epoch,
}

/// Announces a sealed WAL object (new or updated)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalObjectRecord {
    pub object_id: ObjectId,
    pub broker_id: BrokerId,
    pub object_size: u64,
    pub stream_ranges: Vec<(StreamId, OffsetRange)>,
}

/// Announces the removal of a WAL object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveWalObjectRecord {
    pub object_id: ObjectId,
}

/// Any record that can be replayed into a delta, in arrival order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataRecord {
    BrokerAssigned(BrokerWalMetadataRecord),
    WalObjectAdded(WalObjectRecord),
    WalObjectRemoved(RemoveWalObjectRecord),
}

impl MetadataRecord {
    #[must_use]
    pub const fn broker_assigned(broker_id: BrokerId, broker_epoch: Epoch) -> Self {
        Self::BrokerAssigned(BrokerWalMetadataRecord {
            broker_id,
            broker_epoch,
        })
    }

    #[must_use]
    pub fn wal_object_added(object: &S3WalObject) -> Self {
        Self::WalObjectAdded(object.to_record())
    }

    #[must_use]
    pub const fn wal_object_removed(object_id: ObjectId) -> Self {
        Self::WalObjectRemoved(RemoveWalObjectRecord { object_id })
    }
}
