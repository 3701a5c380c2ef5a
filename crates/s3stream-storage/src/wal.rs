//! Write-ahead log
//!
//! The WAL is the only synchronous step of the append path: a batch is
//! acknowledged once its record is durable here. Records stay in the log
//! until the uploader has sealed them into an object and trimmed the log.
//!
//! File layout:
//! ```text
//! +--------+---------+-----------+
//! | Magic  | Version | Start seq |   header, 20 bytes
//! | 8B     | 4B      | 8B        |
//! +--------+---------+-----------+
//! ```
//!
//! Record format:
//! ```text
//! +--------+------+--------+--------+------+--------+
//! | Magic  | Type | Seq    | Length | Data | CRC32C |
//! | 4B     | 1B   | 8B     | 4B     | var  | 4B     |
//! +--------+------+--------+--------+------+--------+
//! ```

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use s3stream_common::checksum::{compute_crc32c, verify_crc32c};
use s3stream_common::config::WalSyncMode;
use s3stream_common::{
    Epoch, Error, RecordBatch, RecordBatchWithContext, Result, StreamId,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// WAL record magic number
const WAL_RECORD_MAGIC: u32 = 0x5741_4C52; // "WALR"

/// WAL header magic number
const WAL_HEADER_MAGIC: u64 = 0x5333_5741_4C4C_4F47; // "S3WALLOG"

const WAL_VERSION: u32 = 1;

const WAL_HEADER_SIZE: usize = 20;

/// Record header size (magic + type + seq + length)
const RECORD_HEADER_SIZE: usize = 17;

/// Fixed part of an append record body (stream + epoch + base offset + count)
const APPEND_BODY_SIZE: usize = 28;

/// Largest record body; the length field is a u32
const MAX_RECORD_DATA: usize = u32::MAX as usize;

/// Record type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// A record batch of one stream
    Append = 1,
    /// Every append up to the carried sequence has been uploaded
    Trim = 2,
    /// Raises the epoch fence of a stream
    Fence = 3,
}

impl RecordType {
    const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Append),
            2 => Some(Self::Trim),
            3 => Some(Self::Fence),
            _ => None,
        }
    }
}

/// A framed WAL record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub record_type: RecordType,
    pub seq: u64,
    pub data: Bytes,
}

impl WalRecord {
    fn append(
        seq: u64,
        stream_id: StreamId,
        epoch: Epoch,
        base_offset: u64,
        batch: &RecordBatch,
    ) -> Result<Self> {
        if APPEND_BODY_SIZE + batch.size() > MAX_RECORD_DATA {
            return Err(Error::invalid_range(format!(
                "batch of {} bytes does not fit a WAL record",
                batch.size()
            )));
        }
        let mut data = BytesMut::with_capacity(APPEND_BODY_SIZE + batch.size());
        data.put_u64_le(stream_id.as_u64());
        data.put_u64_le(epoch);
        data.put_u64_le(base_offset);
        data.put_u32_le(batch.count());
        data.put_slice(batch.payload());
        Ok(Self {
            record_type: RecordType::Append,
            seq,
            data: data.freeze(),
        })
    }

    fn trim(upto: u64) -> Self {
        let mut data = BytesMut::with_capacity(8);
        data.put_u64_le(upto);
        Self {
            record_type: RecordType::Trim,
            seq: 0,
            data: data.freeze(),
        }
    }

    fn fence(stream_id: StreamId, epoch: Epoch) -> Self {
        let mut data = BytesMut::with_capacity(16);
        data.put_u64_le(stream_id.as_u64());
        data.put_u64_le(epoch);
        Self {
            record_type: RecordType::Fence,
            seq: 0,
            data: data.freeze(),
        }
    }

    /// Serialize a record to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.put_u32_le(WAL_RECORD_MAGIC);
        buf.put_u8(self.record_type as u8);
        buf.put_u64_le(self.seq);
        // Bodies are bounded by MAX_RECORD_DATA when built
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);

        // CRC over everything before the CRC field
        let crc = compute_crc32c(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Parse one record from the front of `data`
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_HEADER_SIZE + 4 {
            return Err(Error::integrity("WAL record too small"));
        }

        let mut header = &data[..RECORD_HEADER_SIZE];
        if header.get_u32_le() != WAL_RECORD_MAGIC {
            return Err(Error::integrity("invalid WAL record magic"));
        }
        let record_type = RecordType::from_u8(header.get_u8())
            .ok_or_else(|| Error::integrity("invalid WAL record type"))?;
        let seq = header.get_u64_le();
        let data_len = header.get_u32_le() as usize;

        let total_len = RECORD_HEADER_SIZE + data_len + 4;
        if data.len() < total_len {
            return Err(Error::integrity("WAL record data truncated"));
        }

        let mut crc_field = &data[RECORD_HEADER_SIZE + data_len..total_len];
        let stored_crc = crc_field.get_u32_le();
        if !verify_crc32c(&data[..RECORD_HEADER_SIZE + data_len], stored_crc) {
            return Err(Error::integrity("WAL record CRC mismatch"));
        }

        Ok(Self {
            record_type,
            seq,
            data: Bytes::copy_from_slice(&data[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + data_len]),
        })
    }

    /// Get the serialized size of this record
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.data.len() + 4
    }

    fn to_entry(&self) -> Result<WalEntry> {
        if self.data.len() < APPEND_BODY_SIZE {
            return Err(Error::integrity("WAL append record body too small"));
        }
        let mut body = self.data.clone();
        let stream_id = StreamId::new(body.get_u64_le());
        let epoch = body.get_u64_le();
        let base_offset = body.get_u64_le();
        let count = body.get_u32_le();
        Ok(WalEntry {
            seq: self.seq,
            stream_id,
            epoch,
            batch: RecordBatchWithContext::new(RecordBatch::new(count, body), base_offset),
        })
    }

    fn decode_u64_pair(&self) -> Result<(u64, u64)> {
        if self.data.len() < 16 {
            return Err(Error::integrity("WAL fence record body too small"));
        }
        let mut body = &self.data[..];
        Ok((body.get_u64_le(), body.get_u64_le()))
    }

    fn decode_trim(&self) -> Result<u64> {
        if self.data.len() < 8 {
            return Err(Error::integrity("WAL trim record body too small"));
        }
        let mut body = &self.data[..];
        Ok(body.get_u64_le())
    }
}

/// A durable record batch recovered from (or appended to) the WAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub seq: u64,
    pub stream_id: StreamId,
    pub epoch: Epoch,
    pub batch: RecordBatchWithContext,
}

/// Durable append-only buffer in front of the object store.
#[async_trait]
pub trait Wal: Send + Sync + 'static {
    /// Persist one batch. Returns once the record is durable.
    ///
    /// Fails with [`Error::FencedEpoch`] when `epoch` is older than the
    /// stream's fence and with [`Error::WalWrite`] on device failure.
    async fn append(
        &self,
        stream_id: StreamId,
        epoch: Epoch,
        base_offset: u64,
        batch: RecordBatch,
    ) -> Result<u64>;

    /// Raise the epoch fence of a stream without writing data
    async fn fence(&self, stream_id: StreamId, epoch: Epoch) -> Result<()>;

    /// Mark every record up to and including `seq` as uploaded
    async fn trim(&self, seq: u64) -> Result<()>;

    /// Records that have not been trimmed, in sequence order
    async fn recover(&self) -> Result<Vec<WalEntry>>;

    /// Sequence the next successful append will receive. Sequences of
    /// successful appends are contiguous.
    fn next_seq(&self) -> u64;
}

/// State rebuilt from the WAL file on open
struct ScanState {
    entries: Vec<WalEntry>,
    trimmed: u64,
    fences: HashMap<StreamId, Epoch>,
    next_seq: u64,
    valid_len: u64,
}

fn write_header<W: Write>(writer: &mut W, start_seq: u64) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(WAL_HEADER_SIZE);
    buf.put_u64_le(WAL_HEADER_MAGIC);
    buf.put_u32_le(WAL_VERSION);
    buf.put_u64_le(start_seq);
    writer.write_all(&buf)?;
    writer.flush()
}

/// Walk the records of a WAL file without loading it whole, stopping at
/// the first torn or corrupt record. Errors from `visit` are returned.
/// Returns the start sequence from the header and the length of the valid
/// prefix.
fn read_log<F>(path: &Path, mut visit: F) -> Result<(u64, u64)>
where
    F: FnMut(&WalRecord) -> Result<()>,
{
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut header = [0u8; WAL_HEADER_SIZE];
    if file_len < WAL_HEADER_SIZE as u64 {
        return Err(Error::integrity(format!(
            "WAL header truncated in {}",
            path.display()
        )));
    }
    reader.read_exact(&mut header)?;
    let mut cursor = &header[..];
    if cursor.get_u64_le() != WAL_HEADER_MAGIC {
        return Err(Error::integrity("invalid WAL header magic"));
    }
    let version = cursor.get_u32_le();
    if version != WAL_VERSION {
        return Err(Error::integrity(format!("unsupported WAL version: {version}")));
    }
    let start_seq = cursor.get_u64_le();

    let mut pos = WAL_HEADER_SIZE as u64;
    let mut buf = Vec::new();
    while pos < file_len {
        let remaining = file_len - pos;
        if remaining < (RECORD_HEADER_SIZE + 4) as u64 {
            warn!("WAL scan stopped at byte {}: record header truncated", pos);
            break;
        }
        buf.resize(RECORD_HEADER_SIZE, 0);
        reader.read_exact(&mut buf)?;
        let data_len = u64::from((&buf[RECORD_HEADER_SIZE - 4..]).get_u32_le());
        let total = RECORD_HEADER_SIZE as u64 + data_len + 4;
        if total > remaining {
            warn!("WAL scan stopped at byte {}: record data truncated", pos);
            break;
        }
        // total fits in memory: it is bounded by the file length
        buf.resize(total as usize, 0);
        reader.read_exact(&mut buf[RECORD_HEADER_SIZE..])?;

        let record = match WalRecord::from_bytes(&buf) {
            Ok(record) => record,
            Err(e) => {
                warn!("WAL scan stopped at byte {}: {}", pos, e);
                break;
            }
        };
        visit(&record)?;
        pos += total;
    }
    Ok((start_seq, pos))
}

/// Rebuild the untrimmed entries, fences and sequence counters of a WAL file
fn scan(path: &Path) -> Result<ScanState> {
    let mut entries = Vec::new();
    let mut trimmed = 0;
    let mut fences: HashMap<StreamId, Epoch> = HashMap::new();
    let mut max_seq = 0;

    let (start_seq, valid_len) = read_log(path, |record| {
        match record.record_type {
            RecordType::Append => {
                let entry = record.to_entry()?;
                let fence = fences.entry(entry.stream_id).or_insert(0);
                *fence = (*fence).max(entry.epoch);
                max_seq = max_seq.max(entry.seq);
                entries.push(entry);
            }
            RecordType::Trim => trimmed = trimmed.max(record.decode_trim()?),
            RecordType::Fence => {
                let (stream, epoch) = record.decode_u64_pair()?;
                let fence = fences.entry(StreamId::new(stream)).or_insert(0);
                *fence = (*fence).max(epoch);
            }
        }
        Ok(())
    })?;

    let trimmed = trimmed.max(start_seq.saturating_sub(1));
    entries.retain(|e: &WalEntry| e.seq > trimmed);
    Ok(ScanState {
        entries,
        trimmed,
        fences,
        next_seq: start_seq.max(max_seq + 1),
        valid_len,
    })
}

/// Serialized size of the append record carrying `entry`
fn append_record_size(entry: &WalEntry) -> u64 {
    (RECORD_HEADER_SIZE + APPEND_BODY_SIZE + entry.batch.size() + 4) as u64
}

struct WalInner {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    next_seq: u64,
    trimmed: u64,
    fences: HashMap<StreamId, Epoch>,
    /// Sizes of the untrimmed append records, in sequence order
    live: VecDeque<(u64, u64)>,
    live_bytes: u64,
    size: u64,
    max_size: u64,
    sync_mode: WalSyncMode,
    /// Set after a failed write; the tail of the file is unknown from then on
    failed: bool,
}

impl WalInner {
    fn check_fence(&self, stream_id: StreamId, epoch: Epoch) -> Result<Epoch> {
        let current = self.fences.get(&stream_id).copied().unwrap_or(0);
        if epoch < current {
            return Err(Error::FencedEpoch {
                stream_id,
                epoch,
                current,
            });
        }
        Ok(current)
    }

    fn write_record(&mut self, record: &WalRecord, sync: bool) -> Result<()> {
        if self.failed {
            return Err(Error::wal_write("WAL is unusable after a failed write"));
        }
        let bytes = record.to_bytes();
        let result = match self.writer.as_mut() {
            Some(writer) => writer
                .write_all(&bytes)
                .and_then(|()| writer.flush())
                .and_then(|()| if sync { writer.get_ref().sync_data() } else { Ok(()) }),
            None => Err(std::io::Error::other("WAL closed")),
        };
        if let Err(e) = result {
            self.failed = true;
            return Err(Error::wal_write(format!(
                "write to {} failed: {e}",
                self.path.display()
            )));
        }
        self.size += bytes.len() as u64;
        Ok(())
    }

    fn append(
        &mut self,
        stream_id: StreamId,
        epoch: Epoch,
        base_offset: u64,
        batch: &RecordBatch,
    ) -> Result<u64> {
        let current = self.check_fence(stream_id, epoch)?;
        let seq = self.next_seq;
        let record = WalRecord::append(seq, stream_id, epoch, base_offset, batch)?;
        self.write_record(&record, self.sync_mode == WalSyncMode::EveryWrite)?;
        if epoch > current {
            self.fences.insert(stream_id, epoch);
        }
        let size = record.serialized_size() as u64;
        self.live.push_back((seq, size));
        self.live_bytes += size;
        self.next_seq += 1;
        Ok(seq)
    }

    fn fence(&mut self, stream_id: StreamId, epoch: Epoch) -> Result<()> {
        let current = self.check_fence(stream_id, epoch)?;
        if epoch == current {
            return Ok(());
        }
        self.write_record(&WalRecord::fence(stream_id, epoch), true)?;
        self.fences.insert(stream_id, epoch);
        debug!("WAL fence for stream {} raised to epoch {}", stream_id, epoch);
        Ok(())
    }

    fn trim(&mut self, seq: u64) -> Result<()> {
        let upto = seq.min(self.next_seq.saturating_sub(1));
        if upto <= self.trimmed {
            return Ok(());
        }
        self.write_record(&WalRecord::trim(upto), true)?;
        self.trimmed = upto;
        while let Some(&(seq, size)) = self.live.front() {
            if seq > upto {
                break;
            }
            self.live.pop_front();
            self.live_bytes -= size;
        }

        // Rotate once trimmed records make up at least half of an
        // oversized file
        if self.size > self.max_size && self.live_bytes <= self.size / 2 {
            self.rotate()?;
        }
        Ok(())
    }

    /// Rewrite the log keeping only untrimmed appends, preceded by the
    /// epoch fences
    fn rotate(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        let tmp_path = self.path.with_extension("rotating");
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            write_header(&mut writer, self.trimmed + 1)?;
            for (stream_id, epoch) in &self.fences {
                writer.write_all(&WalRecord::fence(*stream_id, *epoch).to_bytes())?;
            }
            let trimmed = self.trimmed;
            read_log(&self.path, |record| {
                if record.record_type == RecordType::Append && record.seq > trimmed {
                    writer.write_all(&record.to_bytes())?;
                }
                Ok(())
            })?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        self.writer = None;
        std::fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.size = file.metadata()?.len();
        self.writer = Some(BufWriter::new(file));

        info!(
            "Rotated WAL {} at sequence {} ({} untrimmed records, {} bytes)",
            self.path.display(),
            self.next_seq,
            self.live.len(),
            self.size
        );
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

/// File-backed [`Wal`]
pub struct FileWal {
    inner: Arc<Mutex<WalInner>>,
}

impl FileWal {
    /// Create or open the WAL at `path`, truncating a torn tail
    pub fn open(path: impl AsRef<Path>, max_size: u64, sync_mode: WalSyncMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file_len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if file_len == 0 {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            let mut writer = BufWriter::new(file);
            write_header(&mut writer, 1)?;
            writer.get_ref().sync_all()?;
        }

        let state = scan(&path)?;
        let file = OpenOptions::new().append(true).open(&path)?;
        let current_len = file.metadata()?.len();
        if state.valid_len < current_len {
            warn!(
                "Truncating torn WAL tail of {}: {} -> {} bytes",
                path.display(),
                current_len,
                state.valid_len
            );
            file.set_len(state.valid_len)?;
            file.sync_all()?;
        }

        info!(
            "Opened WAL at {}: next_seq={}, trimmed={}, pending={}, size={}",
            path.display(),
            state.next_seq,
            state.trimmed,
            state.entries.len(),
            state.valid_len
        );

        let live: VecDeque<(u64, u64)> = state
            .entries
            .iter()
            .map(|entry| (entry.seq, append_record_size(entry)))
            .collect();
        let live_bytes = live.iter().map(|(_, size)| size).sum();

        Ok(Self {
            inner: Arc::new(Mutex::new(WalInner {
                path,
                writer: Some(BufWriter::new(file)),
                next_seq: state.next_seq,
                trimmed: state.trimmed,
                fences: state.fences,
                live,
                live_bytes,
                size: state.valid_len,
                max_size,
                sync_mode,
                failed: false,
            })),
        })
    }

    /// Highest trimmed sequence
    #[must_use]
    pub fn trimmed(&self) -> u64 {
        self.inner.lock().trimmed
    }

    /// Current file size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Flush and fsync the log
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().sync()
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WalInner) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock();
            f(&mut *guard)
        })
            .await
            .map_err(|e| Error::wal_write(format!("WAL task failed: {e}")))?
    }
}

#[async_trait]
impl Wal for FileWal {
    async fn append(
        &self,
        stream_id: StreamId,
        epoch: Epoch,
        base_offset: u64,
        batch: RecordBatch,
    ) -> Result<u64> {
        self.run(move |inner| inner.append(stream_id, epoch, base_offset, &batch))
            .await
    }

    async fn fence(&self, stream_id: StreamId, epoch: Epoch) -> Result<()> {
        self.run(move |inner| inner.fence(stream_id, epoch)).await
    }

    async fn trim(&self, seq: u64) -> Result<()> {
        self.run(move |inner| inner.trim(seq)).await
    }

    async fn recover(&self) -> Result<Vec<WalEntry>> {
        self.run(|inner| {
            inner.sync()?;
            let state = scan(&inner.path)?;
            Ok(state.entries)
        })
        .await
    }

    fn next_seq(&self) -> u64 {
        self.inner.lock().next_seq
    }
}

/// In-memory [`Wal`] with failure injection
#[derive(Default)]
pub struct MemoryWal {
    state: Mutex<MemoryWalState>,
    fail_appends: AtomicBool,
}

#[derive(Default)]
struct MemoryWalState {
    entries: BTreeMap<u64, WalEntry>,
    fences: HashMap<StreamId, Epoch>,
    next_seq: u64,
}

impl MemoryWal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following append fail with [`Error::WalWrite`]
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::Release);
    }

    /// Number of untrimmed records
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Wal for MemoryWal {
    async fn append(
        &self,
        stream_id: StreamId,
        epoch: Epoch,
        base_offset: u64,
        batch: RecordBatch,
    ) -> Result<u64> {
        if self.fail_appends.load(Ordering::Acquire) {
            return Err(Error::wal_write("injected append failure"));
        }
        let mut state = self.state.lock();
        let current = state.fences.get(&stream_id).copied().unwrap_or(0);
        if epoch < current {
            return Err(Error::FencedEpoch {
                stream_id,
                epoch,
                current,
            });
        }
        state.fences.insert(stream_id, epoch);
        state.next_seq += 1;
        let seq = state.next_seq;
        state.entries.insert(
            seq,
            WalEntry {
                seq,
                stream_id,
                epoch,
                batch: RecordBatchWithContext::new(batch, base_offset),
            },
        );
        Ok(seq)
    }

    async fn fence(&self, stream_id: StreamId, epoch: Epoch) -> Result<()> {
        let mut state = self.state.lock();
        let current = state.fences.entry(stream_id).or_insert(0);
        if epoch < *current {
            return Err(Error::FencedEpoch {
                stream_id,
                epoch,
                current: *current,
            });
        }
        *current = epoch;
        Ok(())
    }

    async fn trim(&self, seq: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.entries = state.entries.split_off(&(seq + 1));
        Ok(())
    }

    async fn recover(&self) -> Result<Vec<WalEntry>> {
        Ok(self.state.lock().entries.values().cloned().collect())
    }

    fn next_seq(&self) -> u64 {
        self.state.lock().next_seq + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn batch(count: u32, fill: u8) -> RecordBatch {
        RecordBatch::new(count, vec![fill; 16])
    }

    #[test]
    fn test_record_roundtrip() {
        let record = WalRecord::append(42, StreamId::new(233), 1, 110, &batch(5, 7)).unwrap();
        let bytes = record.to_bytes();
        let parsed = WalRecord::from_bytes(&bytes).unwrap();

        assert_eq!(parsed, record);
        let entry = parsed.to_entry().unwrap();
        assert_eq!(entry.stream_id, StreamId::new(233));
        assert_eq!(entry.batch.base_offset(), 110);
        assert_eq!(entry.batch.last_offset(), 115);
        assert_eq!(entry.batch.payload().as_ref(), &[7u8; 16]);
    }

    #[test]
    fn test_record_crc_mismatch() {
        let mut bytes = WalRecord::trim(9).to_bytes();
        bytes[RECORD_HEADER_SIZE] ^= 0xFF;
        assert!(matches!(
            WalRecord::from_bytes(&bytes),
            Err(Error::DataIntegrity(_))
        ));
    }

    #[tokio::test]
    async fn test_wal_append_and_recover() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        {
            let wal = FileWal::open(&path, 1024 * 1024, WalSyncMode::EveryWrite).unwrap();
            assert_eq!(wal.append(StreamId::new(1), 1, 0, batch(2, 1)).await.unwrap(), 1);
            assert_eq!(wal.append(StreamId::new(1), 1, 2, batch(3, 2)).await.unwrap(), 2);
            assert_eq!(wal.append(StreamId::new(2), 1, 0, batch(1, 3)).await.unwrap(), 3);
            wal.trim(1).await.unwrap();
        }

        let wal = FileWal::open(&path, 1024 * 1024, WalSyncMode::EveryWrite).unwrap();
        let entries = wal.recover().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 2);
        assert_eq!(entries[0].batch.base_offset(), 2);
        assert_eq!(entries[1].stream_id, StreamId::new(2));
        assert_eq!(wal.next_seq(), 4);
        assert_eq!(wal.trimmed(), 1);
    }

    #[tokio::test]
    async fn test_wal_fencing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        {
            let wal = FileWal::open(&path, 1024 * 1024, WalSyncMode::EveryWrite).unwrap();
            wal.append(StreamId::new(1), 1, 0, batch(1, 0)).await.unwrap();
            wal.fence(StreamId::new(1), 3).await.unwrap();

            let err = wal.append(StreamId::new(1), 2, 1, batch(1, 0)).await.unwrap_err();
            assert!(err.is_fenced());
            assert_eq!(wal.next_seq(), 2);
        }

        // Fence survives restart
        let wal = FileWal::open(&path, 1024 * 1024, WalSyncMode::EveryWrite).unwrap();
        assert!(
            wal.append(StreamId::new(1), 2, 1, batch(1, 0))
                .await
                .unwrap_err()
                .is_fenced()
        );
        wal.append(StreamId::new(1), 3, 1, batch(1, 0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wal_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        {
            let wal = FileWal::open(&path, 1024 * 1024, WalSyncMode::EveryWrite).unwrap();
            wal.append(StreamId::new(1), 1, 0, batch(1, 1)).await.unwrap();
            wal.append(StreamId::new(1), 1, 1, batch(1, 2)).await.unwrap();
        }

        // Chop the last record in half
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 10).unwrap();
        drop(file);

        let wal = FileWal::open(&path, 1024 * 1024, WalSyncMode::EveryWrite).unwrap();
        let entries = wal.recover().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, 1);

        // The torn sequence is reissued and later records are readable again
        assert_eq!(wal.append(StreamId::new(1), 1, 1, batch(1, 3)).await.unwrap(), 2);
        assert_eq!(wal.recover().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_wal_rotation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let wal = FileWal::open(&path, 64, WalSyncMode::Deferred).unwrap();
        for i in 0..4 {
            wal.append(StreamId::new(7), 2, i, batch(1, 0)).await.unwrap();
        }
        let before = wal.size();
        wal.trim(4).await.unwrap();
        assert!(wal.size() < before);
        assert!(wal.recover().await.unwrap().is_empty());

        drop(wal);
        let wal = FileWal::open(&path, 64, WalSyncMode::Deferred).unwrap();
        assert_eq!(wal.next_seq(), 5);
        assert!(
            wal.append(StreamId::new(7), 1, 4, batch(1, 0))
                .await
                .unwrap_err()
                .is_fenced()
        );
    }

    #[tokio::test]
    async fn test_wal_stays_bounded_under_steady_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let max_size = 4096;

        let wal = FileWal::open(&path, max_size, WalSyncMode::Deferred).unwrap();
        let payload = RecordBatch::new(1, vec![5u8; 64]);
        let mut prev = None;
        for offset in 0..2000u64 {
            let seq = wal
                .append(StreamId::new(1), 1, offset, payload.clone())
                .await
                .unwrap();
            // The uploader always lags one record behind
            if let Some(prev) = prev {
                wal.trim(prev).await.unwrap();
            }
            prev = Some(seq);
            assert!(wal.size() <= 2 * max_size, "WAL grew to {}", wal.size());
        }
        assert!(std::fs::metadata(&path).unwrap().len() <= 2 * max_size);

        // Only the last append survives, and it survives a restart
        let entries = wal.recover().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, 2000);
        assert_eq!(entries[0].batch.base_offset(), 1999);
        drop(wal);

        let wal = FileWal::open(&path, max_size, WalSyncMode::Deferred).unwrap();
        assert_eq!(wal.next_seq(), 2001);
        assert_eq!(wal.trimmed(), 1999);
        let entries = wal.recover().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].batch.payload().as_ref(), &[5u8; 64]);
    }

    #[tokio::test]
    async fn test_wal_rotation_keeps_untrimmed_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let wal = FileWal::open(&path, 256, WalSyncMode::EveryWrite).unwrap();
        wal.fence(StreamId::new(2), 4).await.unwrap();
        for i in 0..8 {
            wal.append(StreamId::new(1), 1, i, batch(1, 0)).await.unwrap();
        }
        wal.append(StreamId::new(2), 4, 0, batch(3, 9)).await.unwrap();
        let before = wal.size();
        wal.trim(8).await.unwrap();
        assert!(wal.size() < before);

        let entries = wal.recover().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, 9);
        assert_eq!(entries[0].stream_id, StreamId::new(2));
        assert_eq!(entries[0].batch.last_offset(), 3);

        drop(wal);
        let wal = FileWal::open(&path, 256, WalSyncMode::EveryWrite).unwrap();
        assert_eq!(wal.next_seq(), 10);
        assert_eq!(wal.recover().await.unwrap().len(), 1);
        assert!(
            wal.append(StreamId::new(2), 3, 3, batch(1, 0))
                .await
                .unwrap_err()
                .is_fenced()
        );
        assert_eq!(wal.append(StreamId::new(2), 4, 3, batch(1, 0)).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_memory_wal_failure_injection() {
        let wal = MemoryWal::new();
        wal.append(StreamId::new(1), 1, 0, batch(1, 0)).await.unwrap();
        wal.set_fail_appends(true);
        let err = wal.append(StreamId::new(1), 1, 1, batch(1, 0)).await.unwrap_err();
        assert!(matches!(err, Error::WalWrite(_)));
        wal.set_fail_appends(false);
        wal.trim(1).await.unwrap();
        assert!(wal.is_empty());
    }
}
