//! Data file access
//!
//! Writers put pages at `block * page_size` with positional I/O, so no seek
//! position is shared between threads and no lock is needed around the file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{FlushError, FlushResult};
use crate::platform_durability::durable_sync;
use crate::types::BlockNumber;

/// Random-access page storage the writer pool applies batches to.
pub trait PageStore: Send + Sync {
    /// Page size in bytes.
    fn page_size(&self) -> usize;

    /// Write one full page at its block position.
    fn write_page(&self, block: BlockNumber, page: &[u8]) -> FlushResult<()>;

    /// Read one page into `buf`. Returns `Ok(false)` if the block lies past
    /// the end of the file (never written).
    fn read_page(&self, block: BlockNumber, buf: &mut [u8]) -> FlushResult<bool>;

    /// Make every completed `write_page` durable.
    fn sync(&self) -> FlushResult<()>;
}

/// Single data file addressed by block number.
#[derive(Debug)]
pub struct FilePageStore {
    file: File,
    path: PathBuf,
    page_size: usize,
}

impl FilePageStore {
    /// Open (or create) the data file at `path`.
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> FlushResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FlushError::io_at(parent, &e, "Failed to create data directory"))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| FlushError::io_at(&path, &e, "Failed to open data file"))?;
        Ok(Self { file, path, page_size })
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_len(&self, len: usize) -> FlushResult<()> {
        if len != self.page_size {
            return Err(FlushError::PageSizeMismatch { expected: self.page_size, actual: len });
        }
        Ok(())
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn write_page(&self, block: BlockNumber, page: &[u8]) -> FlushResult<()> {
        self.check_len(page.len())?;
        write_all_at(&self.file, page, block.offset(self.page_size))
            .map_err(|e| FlushError::io_at(&self.path, &e, &format!("Data write of {} failed", block)))
    }

    fn read_page(&self, block: BlockNumber, buf: &mut [u8]) -> FlushResult<bool> {
        self.check_len(buf.len())?;
        let offset = block.offset(self.page_size);
        let len = self
            .file
            .metadata()
            .map_err(|e| FlushError::io_at(&self.path, &e, "Failed to stat data file"))?
            .len();
        if offset + self.page_size as u64 > len {
            return Ok(false);
        }
        read_exact_at(&self.file, buf, offset)
            .map_err(|e| FlushError::io_at(&self.path, &e, &format!("Data read of {} failed", block)))?;
        Ok(true)
    }

    fn sync(&self) -> FlushResult<()> {
        durable_sync(&self.file)
            .map_err(|e| FlushError::io_at(&self.path, &e, "Data file durable_sync failed"))
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        let rest = std::mem::take(&mut buf);
        buf = &mut rest[n..];
        offset += n as u64;
    }
    Ok(())
}
