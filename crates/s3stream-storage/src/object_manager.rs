//! Object manager
//!
//! Owns object identity, the per-stream map of sealed ranges and the object
//! lifecycle:
//!
//! ```text
//! assign ─▶ Open ─commit─▶ Sealed ─no live range─▶ MarkDestroyed ─delete─▶ Removed
//! ```
//!
//! Object state is locked per object (one `DashMap` shard entry at a time);
//! range maps are locked per stream. Multi-stream mutations (commit and
//! compaction swap) validate every range before applying any of them.

use crate::object_store::ObjectStore;
use dashmap::DashMap;
use parking_lot::Mutex;
use s3stream_common::{BrokerId, Error, ObjectId, OffsetRange, Result, StreamId};
use s3stream_metadata::{BrokerS3WalMetadataImage, MetadataRecord, S3WalObject, StreamMetadata};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Lifecycle state of an object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectState {
    /// Id assigned, data not yet committed
    Open,
    /// Uploaded and referenced by at least one live range
    Sealed,
    /// No live range left; waiting for deletion from the store
    MarkDestroyed,
    /// Deleted from the store
    Removed,
}

struct ObjectEntry {
    state: ObjectState,
    size: u64,
    ranges: BTreeMap<StreamId, OffsetRange>,
    /// Streams whose range in this object is still live
    live: BTreeSet<StreamId>,
}

#[derive(Default)]
struct StreamRanges {
    /// End of the data sealed so far, `None` before the first seal
    sealed_end: Option<u64>,
    /// start offset → (end offset, object)
    ranges: BTreeMap<u64, (u64, ObjectId)>,
}

impl StreamRanges {
    fn check_next(&self, stream_id: StreamId, range: OffsetRange) -> Result<()> {
        if range.is_empty() {
            return Err(Error::invalid_range(format!(
                "stream {stream_id} cannot seal empty range {range}"
            )));
        }
        if let Some(end) = self.sealed_end
            && end != range.start
        {
            return Err(Error::invalid_range(format!(
                "stream {stream_id} range {range} does not start at sealed end {end}"
            )));
        }
        Ok(())
    }
}

/// Tracks objects and the stream ranges they hold
pub struct ObjectManager {
    broker_id: BrokerId,
    next_object_id: AtomicU64,
    objects: DashMap<ObjectId, ObjectEntry>,
    streams: DashMap<StreamId, StreamRanges>,
    /// Serializes multi-stream mutations
    commit_lock: Mutex<()>,
}

impl ObjectManager {
    #[must_use]
    pub fn new(broker_id: BrokerId) -> Self {
        Self {
            broker_id,
            next_object_id: AtomicU64::new(0),
            objects: DashMap::new(),
            streams: DashMap::new(),
            commit_lock: Mutex::new(()),
        }
    }

    /// Hand out the next object id and track it as `Open`
    pub fn assign_object_id(&self) -> ObjectId {
        let id = ObjectId::new(self.next_object_id.fetch_add(1, Ordering::SeqCst));
        self.objects.insert(
            id,
            ObjectEntry {
                state: ObjectState::Open,
                size: 0,
                ranges: BTreeMap::new(),
                live: BTreeSet::new(),
            },
        );
        id
    }

    /// Id the next call to [`assign_object_id`](Self::assign_object_id) returns
    #[must_use]
    pub fn next_object_id(&self) -> u64 {
        self.next_object_id.load(Ordering::SeqCst)
    }

    /// Raise the id counter to at least `next`
    pub fn ensure_next_object_id(&self, next: u64) {
        self.next_object_id.fetch_max(next, Ordering::SeqCst);
    }

    /// Record where a stream's sealed data ends, so the next seal must
    /// start there
    pub fn register_stream(&self, stream_id: StreamId, sealed_offset: u64) {
        let mut entry = self.streams.entry(stream_id).or_default();
        entry.sealed_end = Some(entry.sealed_end.map_or(sealed_offset, |e| e.max(sealed_offset)));
    }

    /// Forget a stream's ranges
    pub fn unregister_stream(&self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
    }

    #[must_use]
    pub fn sealed_end(&self, stream_id: StreamId) -> Option<u64> {
        self.streams.get(&stream_id).and_then(|s| s.sealed_end)
    }

    #[must_use]
    pub fn object_state(&self, object_id: ObjectId) -> Option<ObjectState> {
        self.objects.get(&object_id).map(|o| o.state)
    }

    /// Metadata form of a committed object
    #[must_use]
    pub fn object(&self, object_id: ObjectId) -> Option<S3WalObject> {
        self.objects.get(&object_id).and_then(|o| {
            (o.state != ObjectState::Open).then(|| {
                S3WalObject::new(object_id, self.broker_id, o.size, o.ranges.clone())
            })
        })
    }

    /// Seal a single range of an already committed object
    pub fn seal_range(
        &self,
        stream_id: StreamId,
        start_offset: u64,
        end_offset: u64,
        object_id: ObjectId,
    ) -> Result<()> {
        let _guard = self.commit_lock.lock();
        let range = OffsetRange::new(start_offset, end_offset);
        {
            let mut object = self
                .objects
                .get_mut(&object_id)
                .ok_or_else(|| Error::invalid_range(format!("unknown object {object_id}")))?;
            if !matches!(object.state, ObjectState::Open | ObjectState::Sealed) {
                return Err(Error::invalid_range(format!(
                    "object {object_id} is {:?}",
                    object.state
                )));
            }
            if object.ranges.contains_key(&stream_id) {
                return Err(Error::invalid_range(format!(
                    "object {object_id} already holds stream {stream_id}"
                )));
            }
            self.streams
                .entry(stream_id)
                .or_default()
                .check_next(stream_id, range)?;
            object.ranges.insert(stream_id, range);
            object.live.insert(stream_id);
            object.state = ObjectState::Sealed;
        }
        let mut stream = self.streams.entry(stream_id).or_default();
        stream.ranges.insert(start_offset, (end_offset, object_id));
        stream.sealed_end = Some(end_offset);
        Ok(())
    }

    /// Commit a freshly uploaded object: seal all of its ranges and move it
    /// to `Sealed`. Nothing is applied when any range is rejected.
    pub fn commit_object(
        &self,
        object_id: ObjectId,
        object_size: u64,
        ranges: &[(StreamId, OffsetRange)],
    ) -> Result<S3WalObject> {
        let _guard = self.commit_lock.lock();
        match self.object_state(object_id) {
            Some(ObjectState::Open) => {}
            Some(state) => {
                return Err(Error::invalid_range(format!(
                    "object {object_id} is {state:?}, expected Open"
                )));
            }
            None => {
                return Err(Error::invalid_range(format!("unknown object {object_id}")));
            }
        }

        let mut seen = BTreeSet::new();
        for (stream_id, range) in ranges {
            if !seen.insert(*stream_id) {
                return Err(Error::invalid_range(format!(
                    "object {object_id} lists stream {stream_id} twice"
                )));
            }
            match self.streams.get(stream_id) {
                Some(stream) => stream.check_next(*stream_id, *range)?,
                None => StreamRanges::default().check_next(*stream_id, *range)?,
            }
        }

        for (stream_id, range) in ranges {
            let mut stream = self.streams.entry(*stream_id).or_default();
            stream.ranges.insert(range.start, (range.end, object_id));
            stream.sealed_end = Some(range.end);
        }

        let stream_ranges: BTreeMap<_, _> = ranges.iter().copied().collect();
        if let Some(mut object) = self.objects.get_mut(&object_id) {
            object.state = ObjectState::Sealed;
            object.size = object_size;
            object.live = stream_ranges.keys().copied().collect();
            object.ranges.clone_from(&stream_ranges);
        }

        debug!(
            "Committed object {} ({} bytes, {} streams)",
            object_id,
            object_size,
            stream_ranges.len()
        );
        Ok(S3WalObject::new(object_id, self.broker_id, object_size, stream_ranges))
    }

    /// Drop an object that was assigned but never committed
    pub fn abort_object(&self, object_id: ObjectId) {
        self.objects
            .remove_if(&object_id, |_, o| o.state == ObjectState::Open);
    }

    /// Sealed objects of a stream intersecting `[start_offset, end_offset)`,
    /// ascending, at most `max_objects`
    #[must_use]
    pub fn get_objects(
        &self,
        stream_id: StreamId,
        start_offset: u64,
        end_offset: u64,
        max_objects: usize,
    ) -> Vec<ObjectId> {
        self.get_object_ranges(stream_id, start_offset, end_offset, max_objects)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    /// Like [`get_objects`](Self::get_objects), with the stream's offset
    /// range inside each object
    #[must_use]
    pub fn get_object_ranges(
        &self,
        stream_id: StreamId,
        start_offset: u64,
        end_offset: u64,
        max_objects: usize,
    ) -> Vec<(ObjectId, OffsetRange)> {
        if start_offset >= end_offset || max_objects == 0 {
            return Vec::new();
        }
        let Some(stream) = self.streams.get(&stream_id) else {
            return Vec::new();
        };

        // The range containing start_offset begins at or before it
        let first = stream
            .ranges
            .range(..=start_offset)
            .next_back()
            .map_or(start_offset, |(start, _)| *start);

        stream
            .ranges
            .range(first..end_offset)
            .filter(|(_, (end, _))| *end > start_offset)
            .take(max_objects)
            .map(|(start, (end, id))| (*id, OffsetRange::new(*start, *end)))
            .collect()
    }

    /// Drop a stream's ranges that end at or below `new_start` and mark
    /// objects without any live range. Returns the newly marked objects.
    pub fn trim_stream(&self, stream_id: StreamId, new_start: u64) -> Vec<ObjectId> {
        let released: Vec<ObjectId> = {
            let Some(mut stream) = self.streams.get_mut(&stream_id) else {
                return Vec::new();
            };
            let dead: Vec<u64> = stream
                .ranges
                .iter()
                .take_while(|(_, (end, _))| *end <= new_start)
                .map(|(start, _)| *start)
                .collect();
            dead.iter()
                .filter_map(|start| stream.ranges.remove(start).map(|(_, id)| id))
                .collect()
        };

        let mut marked = Vec::new();
        for object_id in released {
            if let Some(mut object) = self.objects.get_mut(&object_id) {
                object.live.remove(&stream_id);
                if object.live.is_empty() && object.state == ObjectState::Sealed {
                    object.state = ObjectState::MarkDestroyed;
                    marked.push(object_id);
                }
            }
        }
        if !marked.is_empty() {
            debug!(
                "Trim of stream {} to {} released objects {:?}",
                stream_id, new_start, marked
            );
        }
        marked
    }

    /// Objects waiting for deletion
    #[must_use]
    pub fn eligible_for_removal(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|o| o.state == ObjectState::MarkDestroyed)
            .map(|o| *o.key())
            .collect();
        ids.sort();
        ids
    }

    /// Delete every `MarkDestroyed` object from the store and return the
    /// removal records to replay. Objects whose delete fails stay marked.
    pub async fn remove_eligible(&self, store: &dyn ObjectStore) -> Vec<MetadataRecord> {
        let mut records = Vec::new();
        for object_id in self.eligible_for_removal() {
            if let Err(e) = store.delete(object_id).await {
                warn!("Failed to delete object {}: {}", object_id, e);
                continue;
            }
            self.objects.remove(&object_id);
            records.push(MetadataRecord::wal_object_removed(object_id));
            info!("Removed object {}", object_id);
        }
        records
    }

    /// Compaction swap: replace `old_ids` by `new_object`, whose per-stream
    /// ranges must equal the union of the old objects' ranges
    pub fn replace_objects(&self, old_ids: &[ObjectId], new_object: &S3WalObject) -> Result<()> {
        let _guard = self.commit_lock.lock();

        let mut union: BTreeMap<StreamId, Vec<OffsetRange>> = BTreeMap::new();
        for id in old_ids {
            let object = self
                .objects
                .get(id)
                .ok_or_else(|| Error::invalid_range(format!("unknown object {id}")))?;
            if object.state != ObjectState::Sealed {
                return Err(Error::invalid_range(format!(
                    "object {id} is {:?}, expected Sealed",
                    object.state
                )));
            }
            for (stream_id, range) in &object.ranges {
                union.entry(*stream_id).or_default().push(*range);
            }
        }

        let mut merged = BTreeMap::new();
        for (stream_id, mut ranges) in union {
            ranges.sort_by_key(|r| r.start);
            let mut acc = ranges[0];
            for range in &ranges[1..] {
                if range.start != acc.end {
                    return Err(Error::invalid_range(format!(
                        "stream {stream_id} ranges of replaced objects are not contiguous at {}",
                        acc.end
                    )));
                }
                acc.end = range.end;
            }
            merged.insert(stream_id, acc);
        }
        if merged != new_object.stream_ranges {
            return Err(Error::invalid_range(format!(
                "object {} ranges do not match the objects it replaces",
                new_object.object_id
            )));
        }

        let old: BTreeSet<ObjectId> = old_ids.iter().copied().collect();
        let mut live = BTreeSet::new();
        for (stream_id, range) in &new_object.stream_ranges {
            if let Some(mut stream) = self.streams.get_mut(stream_id) {
                let before = stream.ranges.len();
                stream.ranges.retain(|_, (_, id)| !old.contains(id));
                if stream.ranges.len() != before {
                    stream
                        .ranges
                        .insert(range.start, (range.end, new_object.object_id));
                    live.insert(*stream_id);
                }
            }
        }

        for id in &old {
            if let Some(mut object) = self.objects.get_mut(id) {
                object.live.clear();
                object.state = ObjectState::MarkDestroyed;
            }
        }
        let state = if live.is_empty() {
            ObjectState::MarkDestroyed
        } else {
            ObjectState::Sealed
        };
        self.objects.insert(
            new_object.object_id,
            ObjectEntry {
                state,
                size: new_object.object_size,
                ranges: new_object.stream_ranges.clone(),
                live,
            },
        );
        self.ensure_next_object_id(new_object.object_id.as_u64() + 1);

        info!(
            "Replaced objects {:?} with object {}",
            old_ids, new_object.object_id
        );
        Ok(())
    }

    /// Rebuild objects and range maps from a published image and the
    /// persisted stream metadata
    pub fn restore(&self, image: &BrokerS3WalMetadataImage, streams: &[StreamMetadata]) {
        for meta in streams {
            self.register_stream(meta.stream_id, meta.sealed_offset);
        }
        let start_of: BTreeMap<StreamId, u64> = streams
            .iter()
            .map(|m| (m.stream_id, m.start_offset))
            .collect();

        for object in image.wal_objects().values() {
            let mut live = BTreeSet::new();
            for (stream_id, range) in &object.stream_ranges {
                let start = start_of.get(stream_id).copied().unwrap_or(0);
                let mut stream = self.streams.entry(*stream_id).or_default();
                stream.sealed_end = Some(stream.sealed_end.map_or(range.end, |e| e.max(range.end)));
                if range.end > start {
                    stream
                        .ranges
                        .insert(range.start, (range.end, object.object_id));
                    live.insert(*stream_id);
                }
            }
            let state = if live.is_empty() {
                ObjectState::MarkDestroyed
            } else {
                ObjectState::Sealed
            };
            self.objects.insert(
                object.object_id,
                ObjectEntry {
                    state,
                    size: object.object_size,
                    ranges: object.stream_ranges.clone(),
                    live,
                },
            );
        }
        if let Some(max) = image.max_object_id() {
            self.ensure_next_object_id(max.as_u64() + 1);
        }
        info!(
            "Restored {} objects for {} streams, next object id {}",
            image.len(),
            self.streams.len(),
            self.next_object_id()
        );
    }
}
