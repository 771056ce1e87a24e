//! Buffer pool collaborator
//!
//! The engine never owns page content. It asks the buffer pool whether a
//! buffer is still dirty, clears the dirty flag, and copies the page out
//! under whatever latching the pool provides. [`MemBufferPool`] is a
//! complete in-memory pool used by the tests and usable by embedders that
//! keep their pages in a plain map.

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::checkpoint::WalPositions;
use crate::page::{page_lsn, set_page_lsn, PAGE_HEADER_SIZE};
use crate::types::{BlockNumber, BufferId, LogPosition};

/// A page copied out of the buffer pool for flushing.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// Where the page lives in the data file
    pub block: BlockNumber,
    /// Full page bytes (exactly one page)
    pub data: Vec<u8>,
    /// Page needs layout-aware handling on recovery; passed through untouched
    pub layout_sensitive: bool,
}

/// Interface the engine consumes from the buffer pool.
///
/// Implementations must be callable from any writer thread.
pub trait BufferPool: Send + Sync {
    /// True while the buffer holds modifications not yet written.
    fn is_dirty(&self, buffer: BufferId) -> bool;

    /// Copy the current page image out of the buffer, or `None` if the
    /// buffer no longer holds a page.
    fn read_page(&self, buffer: BufferId) -> Option<PageImage>;

    /// Clear the dirty flag. Called right before the page is copied out, so
    /// a modification made after the copy dirties the buffer again and the
    /// producer queues it again.
    fn clear_dirty(&self, buffer: BufferId);
}

#[derive(Debug, Clone)]
struct Frame {
    block: BlockNumber,
    data: Vec<u8>,
    dirty: bool,
    layout_sensitive: bool,
}

/// In-memory buffer pool keyed by buffer id.
///
/// Also answers [`WalPositions`] from the LSN stored in each page header.
pub struct MemBufferPool {
    page_size: usize,
    frames: RwLock<HashMap<BufferId, Frame>>,
}

impl MemBufferPool {
    /// Create an empty pool of `page_size` pages.
    pub fn new(page_size: usize) -> Self {
        Self { page_size, frames: RwLock::new(HashMap::new()) }
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Modify the page held by `buffer` (creating a zeroed page at `block`
    /// if the buffer is empty), stamp `lsn` and mark it dirty.
    ///
    /// Returns true when the buffer went from clean to dirty. Only then must
    /// the caller push it into the dirty page queue.
    pub fn modify(
        &self,
        buffer: BufferId,
        block: BlockNumber,
        lsn: LogPosition,
        f: impl FnOnce(&mut [u8]),
    ) -> bool {
        let mut frames = self.frames.write();
        let frame = frames.entry(buffer).or_insert_with(|| Frame {
            block,
            data: vec![0u8; self.page_size],
            dirty: false,
            layout_sensitive: false,
        });
        if frame.block != block {
            // buffer reused for another block
            frame.block = block;
            frame.data.iter_mut().for_each(|b| *b = 0);
        }
        f(&mut frame.data);
        set_page_lsn(&mut frame.data, lsn);
        let newly_dirty = !frame.dirty;
        frame.dirty = true;
        newly_dirty
    }

    /// Copy `payload` into the page body (after the header).
    pub fn write(&self, buffer: BufferId, block: BlockNumber, lsn: LogPosition, payload: &[u8]) -> bool {
        self.modify(buffer, block, lsn, |page| {
            let end = (PAGE_HEADER_SIZE + payload.len()).min(page.len());
            page[PAGE_HEADER_SIZE..end].copy_from_slice(&payload[..end - PAGE_HEADER_SIZE]);
        })
    }

    /// Flag the page as needing layout-aware recovery.
    pub fn set_layout_sensitive(&self, buffer: BufferId, sensitive: bool) {
        if let Some(frame) = self.frames.write().get_mut(&buffer) {
            frame.layout_sensitive = sensitive;
        }
    }

    /// Clean the buffer outside the writer pool (eviction, drop). Returns
    /// true if it was dirty.
    pub fn mark_clean(&self, buffer: BufferId) -> bool {
        match self.frames.write().get_mut(&buffer) {
            Some(frame) => std::mem::replace(&mut frame.dirty, false),
            None => false,
        }
    }

    /// Copy of the page currently held by `buffer`.
    pub fn page(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.frames.read().get(&buffer).map(|f| f.data.clone())
    }

    /// Number of dirty buffers.
    pub fn dirty_count(&self) -> usize {
        self.frames.read().values().filter(|f| f.dirty).count()
    }
}

impl BufferPool for MemBufferPool {
    fn is_dirty(&self, buffer: BufferId) -> bool {
        self.frames.read().get(&buffer).map_or(false, |f| f.dirty)
    }

    fn read_page(&self, buffer: BufferId) -> Option<PageImage> {
        let frames = self.frames.read();
        frames.get(&buffer).map(|f| PageImage {
            block: f.block,
            data: f.data.clone(),
            layout_sensitive: f.layout_sensitive,
        })
    }

    fn clear_dirty(&self, buffer: BufferId) {
        if let Some(frame) = self.frames.write().get_mut(&buffer) {
            frame.dirty = false;
        }
    }
}

impl WalPositions for MemBufferPool {
    fn last_modifying_position(&self, buffer: BufferId) -> LogPosition {
        self.frames
            .read()
            .get(&buffer)
            .map_or(LogPosition::default(), |f| page_lsn(&f.data))
    }
}
