//! Stream metadata: identity, owner epoch, start offset and owner ranges.

use s3stream_common::{BrokerId, Epoch, Error, Result, StreamId};
use serde::{Deserialize, Serialize};

/// Contiguous slice of a stream's offsets written by one owner generation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeMetadata {
    pub epoch: Epoch,
    pub start_offset: u64,
    /// `None` while the range is still open for appends
    pub end_offset: Option<u64>,
    pub broker_id: BrokerId,
}

impl RangeMetadata {
    #[must_use]
    pub const fn open(epoch: Epoch, start_offset: u64, broker_id: BrokerId) -> Self {
        Self {
            epoch,
            start_offset,
            end_offset: None,
            broker_id,
        }
    }

    #[must_use]
    pub const fn closed(epoch: Epoch, start_offset: u64, end_offset: u64, broker_id: BrokerId) -> Self {
        Self {
            epoch,
            start_offset,
            end_offset: Some(end_offset),
            broker_id,
        }
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.end_offset.is_none()
    }
}

/// Lifecycle of a stream as seen by the catalog
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    Opened,
    #[default]
    Closed,
}

/// Cluster metadata of a single stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub stream_id: StreamId,
    pub epoch: Epoch,
    pub start_offset: u64,
    /// End of the data already sealed into objects
    pub sealed_offset: u64,
    pub ranges: Vec<RangeMetadata>,
    pub state: StreamState,
}

impl StreamMetadata {
    /// A freshly created stream: epoch 0, no ranges, closed
    #[must_use]
    pub const fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            epoch: 0,
            start_offset: 0,
            sealed_offset: 0,
            ranges: Vec::new(),
            state: StreamState::Closed,
        }
    }

    /// The range currently accepting appends, if any
    #[must_use]
    pub fn open_range(&self) -> Option<&RangeMetadata> {
        self.ranges.last().filter(|r| r.is_open())
    }

    /// Take ownership for `broker_id` starting at `next_offset`.
    ///
    /// Bumps the epoch, closes the previous open range at `next_offset` and
    /// opens a new one. Returns the new epoch.
    pub fn open(&mut self, broker_id: BrokerId, next_offset: u64) -> Result<Epoch> {
        if next_offset < self.start_offset {
            return Err(Error::invalid_range(format!(
                "stream {} cannot open at {next_offset}, start offset is {}",
                self.stream_id, self.start_offset
            )));
        }
        self.seal(next_offset)?;
        self.epoch += 1;
        self.ranges
            .push(RangeMetadata::open(self.epoch, next_offset, broker_id));
        self.state = StreamState::Opened;
        Ok(self.epoch)
    }

    /// Close the open range (if any) at `end_offset`
    pub fn seal(&mut self, end_offset: u64) -> Result<()> {
        if let Some(last) = self.ranges.last_mut()
            && last.end_offset.is_none()
        {
            if end_offset < last.start_offset {
                return Err(Error::invalid_range(format!(
                    "stream {} range starting at {} cannot end at {end_offset}",
                    self.stream_id, last.start_offset
                )));
            }
            last.end_offset = Some(end_offset);
        }
        Ok(())
    }

    /// Close the stream, sealing its open range at `end_offset`
    pub fn close(&mut self, end_offset: u64) -> Result<()> {
        self.seal(end_offset)?;
        self.state = StreamState::Closed;
        Ok(())
    }

    /// Advance the start offset, dropping closed ranges that end at or below it
    pub fn trim(&mut self, new_start: u64) -> Result<()> {
        if new_start < self.start_offset {
            return Err(Error::invalid_range(format!(
                "stream {} start offset cannot regress from {} to {new_start}",
                self.stream_id, self.start_offset
            )));
        }
        self.start_offset = new_start;
        self.ranges
            .retain(|r| r.end_offset.is_none_or(|end| end > new_start));
        Ok(())
    }

    /// Check the range invariants: contiguous, at most one open range and it
    /// is the last one, closed ranges are well formed
    pub fn check_invariants(&self) -> Result<()> {
        let mut prev_end: Option<u64> = None;
        for (i, range) in self.ranges.iter().enumerate() {
            if range.is_open() && i + 1 != self.ranges.len() {
                return Err(Error::integrity(format!(
                    "stream {} has an open range before the last one",
                    self.stream_id
                )));
            }
            if let Some(end) = range.end_offset
                && end < range.start_offset
            {
                return Err(Error::integrity(format!(
                    "stream {} range [{}, {end}) is inverted",
                    self.stream_id, range.start_offset
                )));
            }
            if let Some(prev) = prev_end
                && prev != range.start_offset
            {
                return Err(Error::integrity(format!(
                    "stream {} ranges are not contiguous at {prev}",
                    self.stream_id
                )));
            }
            prev_end = range.end_offset;
        }
        if let Some(first) = self.ranges.first()
            && first.start_offset > self.start_offset
        {
            return Err(Error::integrity(format!(
                "stream {} first range starts at {} past start offset {}",
                self.stream_id, first.start_offset, self.start_offset
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_closes_previous_range() {
        let mut meta = StreamMetadata::new(StreamId::new(1));
        assert_eq!(meta.open(BrokerId::new(10), 0).unwrap(), 1);
        assert_eq!(meta.open(BrokerId::new(11), 40).unwrap(), 2);

        assert_eq!(meta.ranges.len(), 2);
        assert_eq!(meta.ranges[0], RangeMetadata::closed(1, 0, 40, BrokerId::new(10)));
        assert_eq!(meta.open_range(), Some(&RangeMetadata::open(2, 40, BrokerId::new(11))));
        assert_eq!(meta.state, StreamState::Opened);
        meta.check_invariants().unwrap();
    }

    #[test]
    fn test_close_seals_open_range() {
        let mut meta = StreamMetadata::new(StreamId::new(1));
        meta.open(BrokerId::new(10), 0).unwrap();
        meta.close(25).unwrap();

        assert!(meta.open_range().is_none());
        assert_eq!(meta.ranges[0].end_offset, Some(25));
        assert_eq!(meta.state, StreamState::Closed);
    }

    #[test]
    fn test_trim_drops_ranges_below_start() {
        let mut meta = StreamMetadata::new(StreamId::new(1));
        meta.open(BrokerId::new(10), 0).unwrap();
        meta.open(BrokerId::new(10), 30).unwrap();
        meta.open(BrokerId::new(10), 60).unwrap();

        meta.trim(30).unwrap();
        assert_eq!(meta.start_offset, 30);
        assert_eq!(meta.ranges.len(), 2);
        assert_eq!(meta.ranges[0].start_offset, 30);

        meta.trim(70).unwrap();
        assert_eq!(meta.ranges.len(), 1);
        assert!(meta.ranges[0].is_open());
    }

    #[test]
    fn test_trim_cannot_regress() {
        let mut meta = StreamMetadata::new(StreamId::new(1));
        meta.trim(10).unwrap();
        assert!(matches!(meta.trim(5), Err(Error::InvalidRange(_))));
    }

    #[test]
    fn test_check_invariants_detects_gap() {
        let meta = StreamMetadata {
            stream_id: StreamId::new(233),
            epoch: 2,
            start_offset: 0,
            sealed_offset: 0,
            ranges: vec![
                RangeMetadata::closed(1, 0, 10, BrokerId::new(1)),
                RangeMetadata::open(2, 12, BrokerId::new(1)),
            ],
            state: StreamState::Opened,
        };
        assert!(matches!(meta.check_invariants(), Err(Error::DataIntegrity(_))));
    }

    #[test]
    fn test_open_range_covers_start_offset() {
        // Owner range opened at 50, start offset advanced to 100 by trims
        let meta = StreamMetadata {
            stream_id: StreamId::new(233),
            epoch: 1,
            start_offset: 100,
            sealed_offset: 0,
            ranges: vec![RangeMetadata::open(1, 50, BrokerId::new(10))],
            state: StreamState::Opened,
        };
        meta.check_invariants().unwrap();
    }
}
