//! Page header layout
//!
//! Every page starts with a fixed header. The engine only touches the LSN
//! (read during recovery) and the checksum field (stamped before staging).
//!
//! Layout:
//!   [0..8]   lsn:      u64 LE - log position of the last modification
//!   [8..10]  checksum: u16 LE - 0 = no checksum present
//!   [10..12] flags:    u16 LE - owned by the buffer pool
//!   [12..24] reserved
//!
//! The rest of the page is opaque.

use crate::checksum::compute_page_checksum;
use crate::error::{FlushError, FlushResult};
use crate::types::{BlockNumber, LogPosition};

/// Page header size in bytes
pub const PAGE_HEADER_SIZE: usize = 24;

/// Byte offset of the LSN field
pub const LSN_OFFSET: usize = 0;

/// Byte offset of the checksum field
pub const CHECKSUM_OFFSET: usize = 8;

/// Log position stored in the page header.
pub fn page_lsn(page: &[u8]) -> LogPosition {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&page[LSN_OFFSET..LSN_OFFSET + 8]);
    LogPosition(u64::from_le_bytes(raw))
}

/// Store a log position in the page header.
pub fn set_page_lsn(page: &mut [u8], lsn: LogPosition) {
    page[LSN_OFFSET..LSN_OFFSET + 8].copy_from_slice(&lsn.0.to_le_bytes());
}

/// Checksum currently stored in the page header.
pub fn stored_checksum(page: &[u8]) -> u16 {
    u16::from_le_bytes([page[CHECKSUM_OFFSET], page[CHECKSUM_OFFSET + 1]])
}

/// Compute the checksum for `block` and write it into the header.
pub fn set_page_checksum(page: &mut [u8], block: BlockNumber) -> u16 {
    let checksum = compute_page_checksum(page, block);
    page[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_le_bytes());
    checksum
}

/// True for a never-written page (all zero bytes).
pub fn is_zeroed(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

/// Verify a page read back from storage.
///
/// A zeroed page and a page with a stored checksum of 0 carry no checksum
/// and are accepted. A mismatch is reported as `PageCorrupted`, which callers
/// treat as a data problem, not an engine failure.
pub fn verify_page_checksum(page: &[u8], block: BlockNumber) -> FlushResult<()> {
    let stored = stored_checksum(page);
    if stored == 0 {
        return Ok(());
    }
    let computed = compute_page_checksum(page, block);
    if computed != stored {
        return Err(FlushError::PageCorrupted { block: block.0, stored, computed });
    }
    Ok(())
}
