//! Metadata form of a WAL object.

use crate::record::WalObjectRecord;
use s3stream_common::{BrokerId, ObjectId, OffsetRange, StreamId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A sealed WAL object as recorded in the broker's metadata image
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3WalObject {
    pub object_id: ObjectId,
    pub broker_id: BrokerId,
    pub object_size: u64,
    /// Offsets each stream has in this object
    pub stream_ranges: BTreeMap<StreamId, OffsetRange>,
}

impl S3WalObject {
    #[must_use]
    pub const fn new(
        object_id: ObjectId,
        broker_id: BrokerId,
        object_size: u64,
        stream_ranges: BTreeMap<StreamId, OffsetRange>,
    ) -> Self {
        Self {
            object_id,
            broker_id,
            object_size,
            stream_ranges,
        }
    }

    /// Build from the record that announced the object
    #[must_use]
    pub fn of(record: &WalObjectRecord) -> Self {
        Self {
            object_id: record.object_id,
            broker_id: record.broker_id,
            object_size: record.object_size,
            stream_ranges: record.stream_ranges.iter().copied().collect(),
        }
    }

    /// The record that announces this object
    #[must_use]
    pub fn to_record(&self) -> WalObjectRecord {
        WalObjectRecord {
            object_id: self.object_id,
            broker_id: self.broker_id,
            object_size: self.object_size,
            stream_ranges: self.stream_ranges.iter().map(|(k, v)| (*k, *v)).collect(),
        }
    }

    #[must_use]
    pub fn range_of(&self, stream_id: StreamId) -> Option<OffsetRange> {
        self.stream_ranges.get(&stream_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_of_record() {
        let record = WalObjectRecord {
            object_id: ObjectId::new(123),
            broker_id: BrokerId::new(10),
            object_size: 64,
            stream_ranges: vec![
                (StreamId::new(233), OffsetRange::new(110, 115)),
                (StreamId::new(234), OffsetRange::new(0, 3)),
            ],
        };
        let object = S3WalObject::of(&record);
        assert_eq!(object.object_id, ObjectId::new(123));
        assert_eq!(object.range_of(StreamId::new(233)), Some(OffsetRange::new(110, 115)));
        assert_eq!(object.range_of(StreamId::new(1)), None);
        assert_eq!(object.to_record(), record);
    }
}
