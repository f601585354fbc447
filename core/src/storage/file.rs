//! Append-structured record file.
//!
//! A store file is a 64-byte header followed by checksummed frames, each
//! holding one [`LogRecord`]. Opening replays the frames; compaction
//! rewrites the file from the live image.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{OpenMode, TuneOpts};
use crate::error::{CaskError, Result};
use crate::storage::Codec;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 64;

/// Frame prefix: payload length and payload checksum.
const FRAME_PREFIX: usize = 8;

/// File size limit without [`TuneOpts::LARGE`].
const SMALL_FILE_LIMIT: u64 = 2 * 1024 * 1024 * 1024;

const MAGIC: &[u8; 4] = b"CASK";
const FORMAT_VERSION: u16 = 1;

/// Store kind recorded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StoreKind {
    Hash = 1,
    BTree = 2,
    Table = 3,
}

impl StoreKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(StoreKind::Hash),
            2 => Some(StoreKind::BTree),
            3 => Some(StoreKind::Table),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StoreKind::Hash => "hash",
            StoreKind::BTree => "btree",
            StoreKind::Table => "table",
        }
    }
}

/// Tuning recorded at creation and adopted on reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub kind: StoreKind,
    pub opts: TuneOpts,
    /// Builtin comparator id, 0 when none is recorded.
    pub comparator: u8,
    pub alignment_power: u8,
    pub free_pool_power: u8,
    pub bucket_count: u64,
    pub leaf_members: u32,
    pub internal_members: u32,
}

impl FileHeader {
    pub fn new(kind: StoreKind) -> Self {
        Self {
            kind,
            opts: TuneOpts::empty(),
            comparator: 0,
            alignment_power: 4,
            free_pool_power: 10,
            bucket_count: 0,
            leaf_members: 0,
            internal_members: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(MAGIC);
        bytes[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes[6] = self.kind as u8;
        bytes[7] = self.opts.bits();
        bytes[8] = self.comparator;
        bytes[9] = self.alignment_power;
        bytes[10] = self.free_pool_power;
        bytes[12..20].copy_from_slice(&self.bucket_count.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.leaf_members.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.internal_members.to_le_bytes());

        let checksum = crc32fast::hash(&bytes[..HEADER_SIZE - 4]);
        bytes[HEADER_SIZE - 4..].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(CaskError::Corrupt(format!(
                "header too short: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[0..4] != MAGIC {
            return Err(CaskError::Corrupt("invalid magic number".into()));
        }

        let stored = read_u32(bytes, HEADER_SIZE - 4);
        if stored != crc32fast::hash(&bytes[..HEADER_SIZE - 4]) {
            return Err(CaskError::Corrupt("header checksum mismatch".into()));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(CaskError::Corrupt(format!(
                "unsupported format version {version}"
            )));
        }

        let kind = StoreKind::from_u8(bytes[6])
            .ok_or_else(|| CaskError::Corrupt(format!("unknown store kind {}", bytes[6])))?;

        Ok(Self {
            kind,
            opts: TuneOpts::from_bits_truncate(bytes[7]),
            comparator: bytes[8],
            alignment_power: bytes[9],
            free_pool_power: bytes[10],
            bucket_count: read_u64(bytes, 12),
            leaf_members: read_u32(bytes, 20),
            internal_members: read_u32(bytes, 24),
        })
    }
}

/// One logical mutation, the payload of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Replace the value chain of `key`.
    Put { key: Vec<u8>, values: Vec<Vec<u8>> },
    Out { key: Vec<u8> },
    /// Remove every record.
    Vanish,
    /// Set or clear a named metadata entry.
    Meta { name: String, value: Option<Vec<u8>> },
    TxBegin,
    TxCommit,
    /// Insert one value at `index` of the chain of `key`, creating the key.
    Insert { key: Vec<u8>, index: u64, value: Vec<u8> },
    /// Remove the value at `index`; the key goes with its last value.
    Remove { key: Vec<u8>, index: u64 },
    /// Overwrite the value at `index`.
    Replace { key: Vec<u8>, index: u64, value: Vec<u8> },
}

/// Result of replaying a file.
pub struct Replay {
    pub records: Vec<LogRecord>,
    /// Frames present in the file, including superseded ones.
    pub frames: u64,
}

/// Durable byte store of one database file.
pub struct RecordFile {
    path: PathBuf,
    file: File,
    header: FileHeader,
    mode: OpenMode,
    /// Codec in use, set only for compressed files.
    codec: Option<Arc<dyn Codec>>,
    /// Codec supplied by the caller, kept for recompression on compaction.
    registered: Option<Arc<dyn Codec>>,
    /// Append offset.
    end: u64,
    /// Frames buffered by an open batch.
    batch: Option<Vec<u8>>,
    batch_frames: u64,
}

impl RecordFile {
    /// Open or create a store file.
    ///
    /// `proposed` is written when the file is new or truncated; otherwise
    /// the file's own header is adopted and must match `proposed.kind`.
    pub fn open(
        path: &Path,
        mode: OpenMode,
        proposed: FileHeader,
        codec: Option<Arc<dyn Codec>>,
    ) -> Result<(Self, Replay)> {
        let writer = mode.is_writer();
        let mut file = OpenOptions::new()
            .read(true)
            .write(writer)
            .create(writer && mode.contains(OpenMode::CREATE))
            .open(path)
            .map_err(|e| CaskError::Io(format!("{}: {e}", path.display())))?;

        if !mode.contains(OpenMode::NO_LOCK) {
            lock_file(&file, writer, mode.contains(OpenMode::LOCK_NB))?;
        }

        if writer && mode.contains(OpenMode::TRUNCATE) {
            file.set_len(0)?;
        }

        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;

        let header = if data.is_empty() {
            if !writer {
                return Err(CaskError::Corrupt(format!(
                    "{} is empty",
                    path.display()
                )));
            }
            file.write_all(&proposed.to_bytes())?;
            file.sync_all()?;
            data.extend_from_slice(&proposed.to_bytes());
            proposed
        } else {
            FileHeader::from_bytes(&data)?
        };

        if header.kind != proposed.kind {
            return Err(CaskError::InvalidOperation(format!(
                "{} holds a {} store, not a {} store",
                path.display(),
                header.kind.name(),
                proposed.kind.name()
            )));
        }

        let active = active_codec(&header, &codec)?;

        let mut record_file = Self {
            path: path.to_path_buf(),
            file,
            header,
            mode,
            codec: active,
            registered: codec,
            end: HEADER_SIZE as u64,
            batch: None,
            batch_frames: 0,
        };

        let (replay, valid_end) = record_file.replay(&data);
        if valid_end != data.len() as u64 {
            if writer {
                warn!(
                    path = %path.display(),
                    discarded = data.len() as u64 - valid_end,
                    "truncating unreadable tail of store file"
                );
                record_file.file.set_len(valid_end)?;
                record_file.file.sync_all()?;
            } else {
                warn!(path = %path.display(), "ignoring unreadable tail of store file");
            }
        }
        record_file.end = valid_end;

        debug!(
            path = %path.display(),
            kind = header.kind.name(),
            records = replay.records.len(),
            "opened store file"
        );

        Ok((record_file, replay))
    }

    /// Decode frames. Returns the committed records and the end offset of
    /// the last usable frame.
    fn replay(&self, data: &[u8]) -> (Replay, u64) {
        let mut records = Vec::new();
        let mut pending: Option<Vec<LogRecord>> = None;
        let mut pos = HEADER_SIZE;
        let mut valid_end = HEADER_SIZE;
        let mut frames = 0u64;

        while pos + FRAME_PREFIX <= data.len() {
            let len = read_u32(data, pos) as usize;
            let crc = read_u32(data, pos + 4);
            let start = pos + FRAME_PREFIX;
            if len == 0 || start + len > data.len() {
                break;
            }
            let payload = &data[start..start + len];
            if crc32fast::hash(payload) != crc {
                break;
            }
            let record = match self.decode_payload(payload) {
                Ok(record) => record,
                Err(err) => {
                    warn!(offset = pos, "undecodable frame: {err}");
                    break;
                }
            };
            pos += self.padded(FRAME_PREFIX + len);

            match record {
                LogRecord::TxBegin => {
                    // A batch never nests; a second begin means the first was torn.
                    pending = Some(Vec::new());
                }
                LogRecord::TxCommit => {
                    if let Some(batch) = pending.take() {
                        frames += batch.len() as u64;
                        records.extend(batch);
                    }
                    valid_end = pos;
                }
                record => match pending.as_mut() {
                    Some(batch) => batch.push(record),
                    None => {
                        frames += 1;
                        records.push(record);
                        valid_end = pos;
                    }
                },
            }
        }

        if pending.is_some() {
            debug!("discarding uncommitted batch at end of store file");
        }

        (Replay { records, frames }, valid_end as u64)
    }

    fn decode_payload(&self, payload: &[u8]) -> Result<LogRecord> {
        match &self.codec {
            Some(codec) => Ok(bincode::deserialize(&codec.decode(payload)?)?),
            None => Ok(bincode::deserialize(payload)?),
        }
    }

    fn encode_frame(&self, record: &LogRecord, out: &mut Vec<u8>) -> Result<()> {
        let mut payload = bincode::serialize(record)?;
        if let Some(codec) = &self.codec {
            payload = codec.encode(&payload)?;
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| CaskError::InvalidOperation("record too large".into()))?;

        let start = out.len();
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        out.extend_from_slice(&payload);
        out.resize(start + self.padded(FRAME_PREFIX + payload.len()), 0);
        Ok(())
    }

    fn padded(&self, len: usize) -> usize {
        let unit = 1usize << self.header.alignment_power;
        len.div_ceil(unit) * unit
    }

    fn write_at_end(&mut self, bytes: &[u8], sync: bool) -> Result<()> {
        let limit = if self.header.opts.contains(TuneOpts::LARGE) {
            u64::MAX
        } else {
            SMALL_FILE_LIMIT
        };
        if self.end + bytes.len() as u64 > limit {
            return Err(CaskError::Io(
                "file would exceed 2 GiB without the LARGE option".into(),
            ));
        }

        let result = self
            .file
            .seek(SeekFrom::Start(self.end))
            .and_then(|_| self.file.write_all(bytes))
            .and_then(|_| if sync { self.file.sync_data() } else { Ok(()) });
        if let Err(err) = result {
            // Drop whatever part of the write landed.
            let _ = self.file.set_len(self.end);
            return Err(err.into());
        }
        self.end += bytes.len() as u64;
        Ok(())
    }

    /// Append one record, or buffer it while a batch is open.
    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        let mut frame = Vec::new();
        self.encode_frame(record, &mut frame)?;
        if let Some(batch) = self.batch.as_mut() {
            batch.extend_from_slice(&frame);
            self.batch_frames += 1;
            return Ok(());
        }
        let sync = self.mode.contains(OpenMode::TSYNC);
        self.write_at_end(&frame, sync)
    }

    /// Append one record straight to the file, bypassing an open batch.
    pub fn append_unbatched(&mut self, record: &LogRecord) -> Result<()> {
        let mut frame = Vec::new();
        self.encode_frame(record, &mut frame)?;
        let sync = self.mode.contains(OpenMode::TSYNC);
        self.write_at_end(&frame, sync)
    }

    pub fn begin_batch(&mut self) {
        self.batch = Some(Vec::new());
        self.batch_frames = 0;
    }

    /// Write the buffered batch between begin and commit markers, then sync.
    /// Returns the number of record frames written.
    pub fn commit_batch(&mut self) -> Result<u64> {
        let Some(buffered) = self.batch.take() else {
            return Ok(0);
        };
        let frames = self.batch_frames;
        self.batch_frames = 0;
        if frames == 0 {
            return Ok(0);
        }

        let mut bytes = Vec::with_capacity(buffered.len() + 2 * self.padded(16));
        self.encode_frame(&LogRecord::TxBegin, &mut bytes)?;
        bytes.extend_from_slice(&buffered);
        self.encode_frame(&LogRecord::TxCommit, &mut bytes)?;
        self.write_at_end(&bytes, true)?;
        Ok(frames)
    }

    pub fn discard_batch(&mut self) {
        self.batch = None;
        self.batch_frames = 0;
    }

    /// Rewrite the file with `header` and `records` only.
    pub fn compact<I>(&mut self, header: FileHeader, records: I) -> Result<()>
    where
        I: IntoIterator<Item = LogRecord>,
    {
        let tmp_path = self.path.with_extension("cask-tmp");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        if !self.mode.contains(OpenMode::NO_LOCK) {
            FileExt::lock_exclusive(&tmp)?;
        }

        let codec = active_codec(&header, &self.registered)?;
        let previous = (self.header, std::mem::replace(&mut self.codec, codec));
        self.header = header;
        let written = self.write_compacted(&mut tmp, records);
        let renamed = written.and_then(|end| {
            fs::rename(&tmp_path, &self.path)?;
            Ok(end)
        });
        match renamed {
            Ok(end) => {
                self.file = tmp;
                self.end = end;
                debug!(path = %self.path.display(), size = end, "compacted store file");
                Ok(())
            }
            Err(err) => {
                (self.header, self.codec) = previous;
                let _ = fs::remove_file(&tmp_path);
                Err(err)
            }
        }
    }

    fn write_compacted<I>(&self, tmp: &mut File, records: I) -> Result<u64>
    where
        I: IntoIterator<Item = LogRecord>,
    {
        let mut bytes = self.header.to_bytes().to_vec();
        for record in records {
            self.encode_frame(&record, &mut bytes)?;
        }
        tmp.write_all(&bytes)?;
        tmp.sync_all()?;
        Ok(bytes.len() as u64)
    }

    /// Copy the committed file contents to `dest`.
    pub fn copy_to(&self, dest: &Path) -> Result<()> {
        self.file.sync_all()?;
        fs::copy(&self.path, dest)
            .map_err(|e| CaskError::Io(format!("{}: {e}", dest.display())))?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.end
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Sync if writable and release the lock.
    pub fn close(self) -> Result<()> {
        if self.mode.is_writer() {
            self.file.sync_all()?;
        }
        if !self.mode.contains(OpenMode::NO_LOCK) {
            FileExt::unlock(&self.file)?;
        }
        debug!(path = %self.path.display(), "closed store file");
        Ok(())
    }
}

fn active_codec(
    header: &FileHeader,
    registered: &Option<Arc<dyn Codec>>,
) -> Result<Option<Arc<dyn Codec>>> {
    if !header.opts.compressed() {
        return Ok(None);
    }
    registered
        .clone()
        .map(Some)
        .ok_or_else(|| CaskError::Config("file is compressed but no codec is registered".into()))
}

fn lock_file(file: &File, exclusive: bool, nonblocking: bool) -> Result<()> {
    let result = match (exclusive, nonblocking) {
        (true, true) => FileExt::try_lock_exclusive(file),
        (true, false) => FileExt::lock_exclusive(file),
        (false, true) => FileExt::try_lock_shared(file),
        (false, false) => FileExt::lock_shared(file),
    };
    result.map_err(|err| {
        if err.kind() == std::io::ErrorKind::WouldBlock || nonblocking {
            CaskError::Lock(format!("file is locked by another process: {err}"))
        } else {
            CaskError::from(err)
        }
    })
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}
