//! Double-write staging buffer
//!
//! Each writer owns one staging file. Pages of a batch are collected in
//! memory, written to the staging file in one piece and made durable, and
//! only then written to their real location in the data file. A crash during
//! the data-file writes leaves an intact copy of every page in the staging
//! file for recovery to repair torn pages from.
//!
//! File format: StagingHeader (32 bytes) + page_count × (record prefix + page)
//!
//! The header's batch index is rewritten to -1 once the batch has been
//! applied to the data file, which tells recovery there is nothing to replay.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{FlushError, FlushResult};
use crate::platform_durability::{durable_sync, sync_directory};
use crate::types::BlockNumber;

/// Staging header size in bytes
pub const STAGING_HEADER_SIZE: usize = 32;

/// Bytes preceding each page in the payload (block u32 + reserved u32)
pub const RECORD_PREFIX_SIZE: usize = 8;

/// Batch index meaning "already applied, nothing to replay"
pub const APPLIED_BATCH: i64 = -1;

const STAGING_MAGIC: [u8; 4] = *b"PFDW";
const STAGING_VERSION: u16 = 1;
const FLAG_LAYOUT_SENSITIVE: u16 = 0x0001;

/// Staging file header.
///
/// Layout:
///   [0..4]   magic:        [u8;4] - "PFDW"
///   [4..6]   version:      u16 LE
///   [6..8]   flags:        u16 LE - bit 0 = batch holds a layout-sensitive page
///   [8..16]  batch_index:  i64 LE - -1 once applied
///   [16..20] page_count:   u32 LE
///   [20..24] page_size:    u32 LE
///   [24..28] payload_crc:  u32 LE - CRC32C of all records
///   [28..32] header_crc:   u32 LE - CRC32C of bytes [0..28]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingHeader {
    pub flags: u16,
    pub batch_index: i64,
    pub page_count: u32,
    pub page_size: u32,
    pub payload_crc: u32,
}

impl StagingHeader {
    fn to_bytes(self) -> [u8; STAGING_HEADER_SIZE] {
        let mut buf = [0u8; STAGING_HEADER_SIZE];
        buf[0..4].copy_from_slice(&STAGING_MAGIC);
        buf[4..6].copy_from_slice(&STAGING_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.batch_index.to_le_bytes());
        buf[16..20].copy_from_slice(&self.page_count.to_le_bytes());
        buf[20..24].copy_from_slice(&self.page_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.payload_crc.to_le_bytes());
        let header_crc = crc32c::crc32c(&buf[0..28]);
        buf[28..32].copy_from_slice(&header_crc.to_le_bytes());
        buf
    }

    fn from_bytes(path: &Path, buf: &[u8; STAGING_HEADER_SIZE]) -> FlushResult<Self> {
        if buf[0..4] != STAGING_MAGIC {
            return Err(corrupted(path, 0, "bad magic"));
        }
        let stored_crc = u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]);
        if crc32c::crc32c(&buf[0..28]) != stored_crc {
            return Err(corrupted(path, 28, "header checksum mismatch"));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != STAGING_VERSION {
            return Err(corrupted(path, 4, &format!("unsupported version {}", version)));
        }
        let mut batch = [0u8; 8];
        batch.copy_from_slice(&buf[8..16]);
        Ok(Self {
            flags: u16::from_le_bytes([buf[6], buf[7]]),
            batch_index: i64::from_le_bytes(batch),
            page_count: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            page_size: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            payload_crc: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
        })
    }

    /// True if the batch contains a layout-sensitive page.
    pub fn layout_sensitive(&self) -> bool {
        self.flags & FLAG_LAYOUT_SENSITIVE != 0
    }
}

fn corrupted(path: &Path, offset: u64, reason: &str) -> FlushError {
    FlushError::StagingCorrupted {
        path: path.to_path_buf(),
        offset,
        reason: reason.to_string(),
    }
}

/// Result of [`StagingBuffer::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Page staged; the batch has room for more
    Appended,
    /// Page staged and the batch is now full: flush before writing pages
    BatchFull,
}

/// Per-writer double-write buffer backed by its own staging file.
///
/// Not `Sync`-shared: it is moved into its writer thread and used only there.
pub struct StagingBuffer {
    file: File,
    path: PathBuf,
    page_size: usize,
    capacity: usize,
    /// Encoded records of the current batch
    records: Vec<u8>,
    /// Pages appended to the current batch
    write_position: usize,
    /// Index of the durable batch, or -1 once applied (or before the first)
    batch_index: i64,
    next_batch: i64,
    layout_sensitive: bool,
}

impl StagingBuffer {
    /// Open the staging file for `writer_id` in `dir`, creating it if needed.
    ///
    /// Recovery must have run first: any batch still in the file is
    /// overwritten by the next flush.
    pub fn open(dir: &Path, writer_id: usize, page_size: usize, capacity: usize) -> FlushResult<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| FlushError::io_at(dir, &e, "Failed to create staging directory"))?;

        let path = staging_path(dir, writer_id);
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| FlushError::io_at(&path, &e, "Failed to open staging file"))?;
        if !existed {
            sync_directory(dir)
                .map_err(|e| FlushError::io_at(dir, &e, "Failed to sync staging directory"))?;
        }

        Ok(Self {
            file,
            path,
            page_size,
            capacity,
            records: Vec::with_capacity(capacity * (RECORD_PREFIX_SIZE + page_size)),
            write_position: 0,
            batch_index: APPLIED_BATCH,
            next_batch: 0,
            layout_sensitive: false,
        })
    }

    /// Stage a page image for `block`.
    ///
    /// Returns `BatchFull` when this page filled the batch; the caller must
    /// then call [`flush_durable`](Self::flush_durable) before writing any
    /// page of the batch to the data file.
    pub fn append(&mut self, block: BlockNumber, page: &[u8], layout_sensitive: bool) -> FlushResult<AppendOutcome> {
        if page.len() != self.page_size {
            return Err(FlushError::PageSizeMismatch { expected: self.page_size, actual: page.len() });
        }
        if self.write_position >= self.capacity {
            return Err(corrupted(&self.path, 0, "append to a full staging batch"));
        }
        self.records.extend_from_slice(&block.0.to_le_bytes());
        self.records.extend_from_slice(&[0u8; 4]);
        self.records.extend_from_slice(page);
        self.write_position += 1;
        self.layout_sensitive |= layout_sensitive;

        if self.write_position == self.capacity {
            Ok(AppendOutcome::BatchFull)
        } else {
            Ok(AppendOutcome::Appended)
        }
    }

    /// Write the batch to the staging file and make it durable.
    pub fn flush_durable(&mut self) -> FlushResult<()> {
        let batch_index = self.next_batch;
        let header = StagingHeader {
            flags: if self.layout_sensitive { FLAG_LAYOUT_SENSITIVE } else { 0 },
            batch_index,
            page_count: self.write_position as u32,
            page_size: self.page_size as u32,
            payload_crc: crc32c::crc32c(&self.records),
        };

        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(&header.to_bytes()))
            .and_then(|_| self.file.write_all(&self.records))
            .map_err(|e| FlushError::io_at(&self.path, &e, "Staging write failed"))?;

        durable_sync(&self.file)
            .map_err(|e| FlushError::io_at(&self.path, &e, "Staging durable_sync failed"))?;

        self.batch_index = batch_index;
        self.next_batch += 1;
        Ok(())
    }

    /// Record that every page of the durable batch reached the data file.
    ///
    /// The header rewrite is not synced: if it is lost, recovery replays the
    /// batch and skips pages the data file already holds in a newer or equal
    /// version.
    pub fn mark_applied(&mut self) -> FlushResult<()> {
        if self.batch_index == APPLIED_BATCH {
            return Ok(());
        }
        let header = StagingHeader {
            flags: if self.layout_sensitive { FLAG_LAYOUT_SENSITIVE } else { 0 },
            batch_index: APPLIED_BATCH,
            page_count: self.write_position as u32,
            page_size: self.page_size as u32,
            payload_crc: crc32c::crc32c(&self.records),
        };
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(&header.to_bytes()))
            .map_err(|e| FlushError::io_at(&self.path, &e, "Staging header update failed"))?;
        self.batch_index = APPLIED_BATCH;
        Ok(())
    }

    /// Start a new batch. Keeps the allocation.
    pub fn reset(&mut self) {
        self.records.clear();
        self.write_position = 0;
        self.layout_sensitive = false;
    }

    /// Pages of the current batch, in append order.
    pub fn staged(&self) -> impl Iterator<Item = (BlockNumber, &[u8])> {
        self.records
            .chunks_exact(RECORD_PREFIX_SIZE + self.page_size)
            .map(|rec| {
                let block = u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]);
                (BlockNumber(block), &rec[RECORD_PREFIX_SIZE..])
            })
    }

    /// Pages appended to the current batch.
    pub fn write_position(&self) -> usize {
        self.write_position
    }

    /// True when the current batch holds no page.
    pub fn is_empty(&self) -> bool {
        self.write_position == 0
    }

    /// Pages per batch.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Index of the durable batch, or -1 if it has been applied.
    pub fn batch_index(&self) -> i64 {
        self.batch_index
    }

    /// True if the current batch holds a layout-sensitive page.
    pub fn layout_sensitive(&self) -> bool {
        self.layout_sensitive
    }

    /// Path of the staging file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Staging file name for a writer.
pub fn staging_path(dir: &Path, writer_id: usize) -> PathBuf {
    dir.join(format!("stage-{:02}.dw", writer_id))
}

/// A batch read back from a staging file.
#[derive(Debug, Clone)]
pub struct StagedBatch {
    pub header: StagingHeader,
    pub pages: Vec<(BlockNumber, Vec<u8>)>,
}

/// Read the batch stored in a staging file.
///
/// Returns `Ok(None)` for an empty file (writer never flushed). A batch whose
/// header or payload fails its CRC is reported as `StagingCorrupted`; such a
/// batch never reached the data file, since data writes only start after the
/// staging flush succeeded.
pub fn read_staging_file(path: &Path) -> FlushResult<Option<StagedBatch>> {
    let mut file = File::open(path)
        .map_err(|e| FlushError::io_at(path, &e, "Failed to open staging file"))?;
    let file_len = file
        .metadata()
        .map_err(|e| FlushError::io_at(path, &e, "Failed to stat staging file"))?
        .len();
    if file_len == 0 {
        return Ok(None);
    }
    if file_len < STAGING_HEADER_SIZE as u64 {
        return Err(corrupted(path, 0, "file shorter than header"));
    }

    let mut hdr_buf = [0u8; STAGING_HEADER_SIZE];
    file.read_exact(&mut hdr_buf)
        .map_err(|e| FlushError::io_at(path, &e, "Failed to read staging header"))?;
    let header = StagingHeader::from_bytes(path, &hdr_buf)?;

    let record_size = RECORD_PREFIX_SIZE as u64 + header.page_size as u64;
    let payload_len = record_size * header.page_count as u64;
    if STAGING_HEADER_SIZE as u64 + payload_len > file_len {
        return Err(corrupted(path, STAGING_HEADER_SIZE as u64, "payload truncated"));
    }

    let mut payload = vec![0u8; payload_len as usize];
    file.read_exact(&mut payload)
        .map_err(|e| FlushError::io_at(path, &e, "Failed to read staging payload"))?;
    if crc32c::crc32c(&payload) != header.payload_crc {
        return Err(corrupted(path, STAGING_HEADER_SIZE as u64, "payload checksum mismatch"));
    }

    let pages = payload
        .chunks_exact(record_size as usize)
        .map(|rec| {
            let block = u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]);
            (BlockNumber(block), rec[RECORD_PREFIX_SIZE..].to_vec())
        })
        .collect();

    Ok(Some(StagedBatch { header, pages }))
}

/// Rewrite a staging file's header as applied and make it durable.
pub fn mark_file_applied(path: &Path, header: &StagingHeader) -> FlushResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| FlushError::io_at(path, &e, "Failed to open staging file"))?;
    let applied = StagingHeader { batch_index: APPLIED_BATCH, ..*header };
    file.write_all(&applied.to_bytes())
        .map_err(|e| FlushError::io_at(path, &e, "Staging header update failed"))?;
    durable_sync(&file).map_err(|e| FlushError::io_at(path, &e, "Staging durable_sync failed"))
}
