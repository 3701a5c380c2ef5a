//! WAL object layout
//!
//! ```text
//! +-------------------+-----+-------------------+-------+--------+
//! | data block (s1)   | ... | data block (sN)   | index | footer |
//! +-------------------+-----+-------------------+-------+--------+
//! ```
//!
//! A data block holds the batches of one stream, back to back:
//! `[base offset u64][count u32][len u32][payload]`. The index starts with
//! an entry count (u32) followed by one fixed-size entry per block. The
//! footer is fixed at 24 bytes: index position (u64), index length (u32),
//! index CRC32C (u32), magic `S3WALOBJ`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use s3stream_common::checksum::{compute_crc32c, verify_crc32c};
use s3stream_common::{
    Checksum, ChecksumCalculator, Error, ObjectId, OffsetRange, RecordBatch,
    RecordBatchWithContext, Result, StreamId,
};

/// Footer magic
pub const OBJECT_MAGIC: u64 = 0x5333_5741_4C4F_424A; // "S3WALOBJ"

/// Fixed footer size
pub const FOOTER_SIZE: u64 = 24;

const INDEX_ENTRY_SIZE: usize = 52;

const BATCH_HEADER_SIZE: usize = 16;

/// Most blocks one object can index; the index length must fit its u32
/// footer field
const MAX_BLOCKS: usize = (u32::MAX as usize - 4) / INDEX_ENTRY_SIZE;

/// Length of `len` bytes as a u32 field, or an error naming `what`
fn u32_len(len: usize, what: impl FnOnce() -> String) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        Error::invalid_range(format!("{} is {len} bytes, limit is {}", what(), u32::MAX))
    })
}

/// Location and checksum of one stream's data block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub stream_id: StreamId,
    pub start_offset: u64,
    pub end_offset: u64,
    pub record_count: u32,
    pub position: u64,
    pub size: u32,
    pub checksum: Checksum,
}

impl IndexEntry {
    #[must_use]
    pub const fn range(&self) -> OffsetRange {
        OffsetRange::new(self.start_offset, self.end_offset)
    }

    /// Byte range of the block inside the object
    #[must_use]
    pub const fn byte_range(&self) -> std::ops::Range<u64> {
        self.position..self.position + self.size as u64
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.stream_id.as_u64());
        buf.put_u64_le(self.start_offset);
        buf.put_u64_le(self.end_offset);
        buf.put_u32_le(self.record_count);
        buf.put_u64_le(self.position);
        buf.put_u32_le(self.size);
        buf.put_u32_le(self.checksum.crc32c);
        buf.put_u64_le(self.checksum.xxhash64);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        Self {
            stream_id: StreamId::new(buf.get_u64_le()),
            start_offset: buf.get_u64_le(),
            end_offset: buf.get_u64_le(),
            record_count: buf.get_u32_le(),
            position: buf.get_u64_le(),
            size: buf.get_u32_le(),
            checksum: Checksum::new(buf.get_u32_le(), buf.get_u64_le()),
        }
    }
}

/// Decoded footer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Footer {
    pub index_position: u64,
    pub index_len: u32,
    pub index_crc: u32,
}

impl Footer {
    pub fn decode(object_id: ObjectId, mut data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_SIZE as usize {
            return Err(Error::integrity(format!(
                "object {object_id} footer is {} bytes",
                data.len()
            )));
        }
        let footer = Self {
            index_position: data.get_u64_le(),
            index_len: data.get_u32_le(),
            index_crc: data.get_u32_le(),
        };
        if data.get_u64_le() != OBJECT_MAGIC {
            return Err(Error::integrity(format!("object {object_id} has a bad magic")));
        }
        Ok(footer)
    }

    #[must_use]
    pub const fn index_range(&self) -> std::ops::Range<u64> {
        self.index_position..self.index_position + self.index_len as u64
    }
}

/// Index of a WAL object: one entry per stream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectIndex {
    entries: Vec<IndexEntry>,
}

impl ObjectIndex {
    /// Decode and verify an index against its footer
    pub fn decode(object_id: ObjectId, footer: &Footer, data: &[u8]) -> Result<Self> {
        if data.len() != footer.index_len as usize || !verify_crc32c(data, footer.index_crc) {
            return Err(Error::integrity(format!(
                "object {object_id} index checksum mismatch"
            )));
        }
        let mut buf = data;
        if buf.remaining() < 4 {
            return Err(Error::integrity(format!("object {object_id} index truncated")));
        }
        let count = buf.get_u32_le() as usize;
        if buf.remaining() != count * INDEX_ENTRY_SIZE {
            return Err(Error::integrity(format!(
                "object {object_id} index holds {} bytes for {count} entries",
                buf.remaining()
            )));
        }
        let entries = (0..count).map(|_| IndexEntry::decode(&mut buf)).collect();
        Ok(Self { entries })
    }

    #[must_use]
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    #[must_use]
    pub fn find(&self, stream_id: StreamId) -> Option<&IndexEntry> {
        self.entries.iter().find(|e| e.stream_id == stream_id)
    }

    /// Approximate in-memory size
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.len() * INDEX_ENTRY_SIZE
    }
}

/// Builds a WAL object from per-stream batch runs
#[derive(Default)]
pub struct ObjectWriter {
    buf: BytesMut,
    index: Vec<IndexEntry>,
}

impl ObjectWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one stream's batches as a data block.
    ///
    /// Batches must be contiguous and the stream must not already have a
    /// block in this object.
    pub fn write_block(&mut self, stream_id: StreamId, batches: &[RecordBatchWithContext]) -> Result<()> {
        let (Some(first), Some(last)) = (batches.first(), batches.last()) else {
            return Ok(());
        };
        if self.index.iter().any(|e| e.stream_id == stream_id) {
            return Err(Error::invalid_range(format!(
                "stream {stream_id} already has a block in this object"
            )));
        }
        for pair in batches.windows(2) {
            if pair[0].last_offset() != pair[1].base_offset() {
                return Err(Error::integrity(format!(
                    "stream {stream_id} batches are not contiguous at {}",
                    pair[0].last_offset()
                )));
            }
        }

        if self.index.len() >= MAX_BLOCKS {
            return Err(Error::invalid_range(format!(
                "object already holds {MAX_BLOCKS} blocks"
            )));
        }

        // Validate every length field before the buffer is touched
        let mut record_count = 0u32;
        let mut block_len = 0usize;
        let mut sizes = Vec::with_capacity(batches.len());
        for batch in batches {
            let size = u32_len(batch.size(), || {
                format!("stream {stream_id} batch at {}", batch.base_offset())
            })?;
            record_count = record_count.checked_add(batch.count()).ok_or_else(|| {
                Error::invalid_range(format!(
                    "stream {stream_id} block holds more than {} records",
                    u32::MAX
                ))
            })?;
            block_len = block_len.saturating_add(BATCH_HEADER_SIZE + batch.size());
            sizes.push(size);
        }
        let size = u32_len(block_len, || format!("stream {stream_id} block"))?;

        let position = self.buf.len() as u64;
        let mut checksum = ChecksumCalculator::new();
        for (batch, len) in batches.iter().zip(sizes) {
            let mut header = [0u8; BATCH_HEADER_SIZE];
            let mut cursor = &mut header[..];
            cursor.put_u64_le(batch.base_offset());
            cursor.put_u32_le(batch.count());
            cursor.put_u32_le(len);
            checksum.update(&header);
            checksum.update(batch.payload());
            self.buf.put_slice(&header);
            self.buf.put_slice(batch.payload());
        }
        self.index.push(IndexEntry {
            stream_id,
            start_offset: first.base_offset(),
            end_offset: last.last_offset(),
            record_count,
            position,
            size,
            checksum: checksum.finalize(),
        });
        Ok(())
    }

    /// Per-stream offset ranges written so far
    #[must_use]
    pub fn ranges(&self) -> Vec<(StreamId, OffsetRange)> {
        self.index.iter().map(|e| (e.stream_id, e.range())).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Bytes of data written so far
    #[must_use]
    pub fn data_size(&self) -> usize {
        self.buf.len()
    }

    /// Append index and footer and return the finished object
    pub fn finish(mut self) -> Result<Bytes> {
        let index_position = self.buf.len() as u64;
        let mut index = BytesMut::with_capacity(4 + self.index.len() * INDEX_ENTRY_SIZE);
        index.put_u32_le(u32_len(self.index.len(), || "object index entry count".to_owned())?);
        for entry in &self.index {
            entry.encode(&mut index);
        }
        let index_len = u32_len(index.len(), || "object index".to_owned())?;

        self.buf.put_slice(&index);
        self.buf.put_u64_le(index_position);
        self.buf.put_u32_le(index_len);
        self.buf.put_u32_le(compute_crc32c(&index));
        self.buf.put_u64_le(OBJECT_MAGIC);
        Ok(self.buf.freeze())
    }
}

/// Decode and verify one data block
pub fn decode_block(object_id: ObjectId, entry: &IndexEntry, data: Bytes) -> Result<Vec<RecordBatchWithContext>> {
    if data.len() != entry.size as usize || !entry.checksum.verify(&data) {
        return Err(Error::integrity(format!(
            "object {object_id} block of stream {} failed checksum",
            entry.stream_id
        )));
    }

    let mut buf = data;
    let mut batches = Vec::new();
    let mut expected = entry.start_offset;
    while buf.has_remaining() {
        if buf.remaining() < BATCH_HEADER_SIZE {
            return Err(Error::integrity(format!(
                "object {object_id} block of stream {} is truncated",
                entry.stream_id
            )));
        }
        let base_offset = buf.get_u64_le();
        let count = buf.get_u32_le();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len || base_offset != expected {
            return Err(Error::integrity(format!(
                "object {object_id} block of stream {} is malformed at offset {base_offset}",
                entry.stream_id
            )));
        }
        let payload = buf.split_to(len);
        let batch = RecordBatchWithContext::new(RecordBatch::new(count, payload), base_offset);
        expected = batch.last_offset();
        batches.push(batch);
    }
    if expected != entry.end_offset {
        return Err(Error::integrity(format!(
            "object {object_id} block of stream {} ends at {expected}, index says {}",
            entry.stream_id, entry.end_offset
        )));
    }
    Ok(batches)
}

/// Decode a complete object held in memory
pub fn decode_object(object_id: ObjectId, data: &Bytes) -> Result<(ObjectIndex, Vec<(StreamId, Vec<RecordBatchWithContext>)>)> {
    let len = data.len() as u64;
    if len < FOOTER_SIZE {
        return Err(Error::integrity(format!("object {object_id} is too small")));
    }
    let footer = Footer::decode(object_id, &data[(len - FOOTER_SIZE) as usize..])?;
    let index_range = footer.index_range();
    if index_range.end > len - FOOTER_SIZE {
        return Err(Error::integrity(format!("object {object_id} index out of bounds")));
    }
    let index = ObjectIndex::decode(
        object_id,
        &footer,
        &data[index_range.start as usize..index_range.end as usize],
    )?;

    let mut streams = Vec::with_capacity(index.entries().len());
    for entry in index.entries() {
        let range = entry.byte_range();
        if range.end > index_range.start {
            return Err(Error::integrity(format!("object {object_id} block out of bounds")));
        }
        let block = data.slice(range.start as usize..range.end as usize);
        streams.push((entry.stream_id, decode_block(object_id, entry, block)?));
    }
    Ok((index, streams))
}
