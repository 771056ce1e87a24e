//! Writer pool: background threads that flush assigned queue ranges
//!
//! Each writer owns a [`StagingBuffer`]. For every entry of its range it
//! claims the slot, copies the page out of the buffer pool, stamps the page
//! checksum and stages it. A full (or final partial) batch goes through the
//! double-write protocol:
//!
//! 1. staging file written and made durable
//! 2. every staged page whose slot is still Valid moved to Writing and
//!    written to the data file; pages invalidated meanwhile are skipped
//! 3. data file made durable
//! 4. staging header marked applied
//! 5. written slots completed and the head retired
//!
//! The coordinator hands out ranges with [`WriterPool::dispatch`] and blocks
//! in [`WriterPool::wait_idle`] until every writer has finished.

use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use tracing::{debug, error, trace};

use crate::engine::Shared;
use crate::error::{FlushError, FlushResult};
use crate::page::set_page_checksum;
use crate::staging::{AppendOutcome, StagingBuffer};

/// Assignment and counters for one writer thread.
pub struct WriterThreadState {
    start: AtomicU64,
    end: AtomicU64,
    need_flush: AtomicBool,
    actual_flushed: AtomicU64,
    batches: AtomicU64,
    thread: OnceLock<Thread>,
}

impl WriterThreadState {
    fn new() -> Self {
        Self {
            start: AtomicU64::new(0),
            end: AtomicU64::new(0),
            need_flush: AtomicBool::new(false),
            actual_flushed: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            thread: OnceLock::new(),
        }
    }

    /// Range most recently assigned to this writer.
    pub fn range(&self) -> Range<u64> {
        self.start.load(Ordering::Acquire)..self.end.load(Ordering::Acquire)
    }

    /// True while an assigned range has not been finished.
    pub fn need_flush(&self) -> bool {
        self.need_flush.load(Ordering::Acquire)
    }

    /// Pages this writer has written to the data file.
    pub fn actual_flushed(&self) -> u64 {
        self.actual_flushed.load(Ordering::Relaxed)
    }

    /// Double-write batches this writer has applied.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    fn wake(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }
}

/// Fixed set of writer states plus the count of writers still busy with
/// the current round.
pub struct WriterPool {
    states: Vec<WriterThreadState>,
    running_count: AtomicUsize,
}

impl WriterPool {
    pub(crate) fn new(writers: usize) -> Self {
        Self {
            states: (0..writers).map(|_| WriterThreadState::new()).collect(),
            running_count: AtomicUsize::new(0),
        }
    }

    /// Number of writers.
    pub(crate) fn len(&self) -> usize {
        self.states.len()
    }

    /// Writers that have been dispatched and not yet finished.
    pub fn running_count(&self) -> usize {
        self.running_count.load(Ordering::Acquire)
    }

    /// Per-writer states, indexed by writer id.
    pub fn states(&self) -> &[WriterThreadState] {
        &self.states
    }

    /// Pages written by all writers together.
    pub fn total_flushed(&self) -> u64 {
        self.states.iter().map(|s| s.actual_flushed()).sum()
    }

    /// Batches applied by all writers together.
    pub fn total_batches(&self) -> u64 {
        self.states.iter().map(|s| s.batches()).sum()
    }

    /// Assign `ranges[i]` to writer `i` and wake it. Empty ranges are not
    /// dispatched. Returns the number of writers started.
    ///
    /// `running_count` is raised before `need_flush` is set so a waiter
    /// never sees zero while a writer is about to start.
    pub(crate) fn dispatch(&self, ranges: &[Range<u64>]) -> usize {
        let mut started = 0;
        for (state, range) in self.states.iter().zip(ranges) {
            if range.is_empty() {
                continue;
            }
            state.start.store(range.start, Ordering::Release);
            state.end.store(range.end, Ordering::Release);
            self.running_count.fetch_add(1, Ordering::AcqRel);
            state.need_flush.store(true, Ordering::Release);
            state.wake();
            started += 1;
        }
        started
    }

    /// Block until every dispatched writer has finished, or `abort` says to
    /// give up. Returns true if the pool went idle.
    pub(crate) fn wait_idle(&self, poll: Duration, abort: impl Fn() -> bool) -> bool {
        while self.running_count() > 0 {
            if abort() {
                return false;
            }
            thread::park_timeout(poll);
        }
        true
    }

    pub(crate) fn wake_all(&self) {
        for state in &self.states {
            state.wake();
        }
    }

    fn finish(&self, id: usize) {
        self.states[id].need_flush.store(false, Ordering::Release);
        self.running_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Start writer thread `id`, moving `staging` into it.
pub(crate) fn spawn_writer(shared: Arc<Shared>, id: usize, mut staging: StagingBuffer) -> FlushResult<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("pageflush-writer-{}", id))
        .spawn({
            let shared = Arc::clone(&shared);
            move || writer_loop(&shared, id, &mut staging)
        })
        .map_err(|e| FlushError::Io {
            path: None,
            kind: e.kind(),
            message: format!("Failed to spawn writer thread {}: {}", id, e),
        })?;
    let _ = shared.writers.states[id].thread.set(handle.thread().clone());
    Ok(handle)
}

/// Main writer loop; runs until the engine stops.
fn writer_loop(shared: &Shared, id: usize, staging: &mut StagingBuffer) {
    let state = &shared.writers.states[id];
    loop {
        if state.need_flush() {
            let range = state.range();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| flush_range(shared, id, staging, range.clone())));
            match outcome {
                Ok(Ok(flushed)) => {
                    trace!(writer = id, start = range.start, end = range.end, flushed, "range finished");
                }
                Ok(Err(e)) => {
                    error!(writer = id, error = %e, "writer failed, halting flush engine");
                    shared.halt(e);
                }
                Err(_) => {
                    error!(writer = id, "writer panicked, halting flush engine");
                    shared.halt(FlushError::Halted { reason: format!("writer {} panicked", id) });
                }
            }
            shared.writers.finish(id);
            shared.coordinator.wake();
            continue;
        }
        if shared.should_stop() {
            break;
        }
        thread::park_timeout(shared.config.poll_interval);
    }
    debug!(writer = id, flushed = state.actual_flushed(), "writer stopped");
}

/// Flush every pending entry in `range`. Returns pages written.
///
/// Stops early, leaving the rest of the range untouched, once the engine
/// has halted.
fn flush_range(shared: &Shared, id: usize, staging: &mut StagingBuffer, range: Range<u64>) -> FlushResult<u64> {
    let mut claimed: Vec<u64> = Vec::with_capacity(staging.capacity());
    let mut flushed = 0;

    for position in range {
        if shared.is_halted() {
            return Ok(flushed);
        }
        // Free (not yet published) or finished slots are skipped
        let Some(buffer) = shared.queue.claim(position) else {
            continue;
        };
        if !shared.buffers.is_dirty(buffer) {
            // cleaned by someone else since it was queued
            shared.queue.abandon(position);
            shared.queue.retire_head();
            continue;
        }
        shared.buffers.clear_dirty(buffer);
        let Some(mut image) = shared.buffers.read_page(buffer) else {
            shared.queue.abandon(position);
            shared.queue.retire_head();
            continue;
        };
        set_page_checksum(&mut image.data, image.block);
        claimed.push(position);
        if staging.append(image.block, &image.data, image.layout_sensitive)? == AppendOutcome::BatchFull {
            flushed += apply_batch(shared, id, staging, &mut claimed)?;
        }
    }

    if !staging.is_empty() {
        flushed += apply_batch(shared, id, staging, &mut claimed)?;
    }
    Ok(flushed)
}

/// Run the double-write protocol for the staged batch. Returns pages
/// written to the data file.
///
/// `claimed[i]` is the queue position of the i-th staged page.
fn apply_batch(shared: &Shared, id: usize, staging: &mut StagingBuffer, claimed: &mut Vec<u64>) -> FlushResult<u64> {
    staging.flush_durable()?;
    let mut written = Vec::with_capacity(claimed.len());
    for (&position, (block, page)) in claimed.iter().zip(staging.staged()) {
        // Invalidated since the claim: the buffer was cleaned elsewhere,
        // possibly from a newer image than this one
        if !shared.queue.begin_write(position) {
            trace!(writer = id, position, block = block.0, "staged page invalidated, skipping write");
            continue;
        }
        shared.store.write_page(block, page)?;
        written.push(position);
    }
    shared.store.sync()?;
    staging.mark_applied()?;

    let pages = written.len() as u64;
    let skipped = staging.write_position() as u64 - pages;
    let state = &shared.writers.states[id];
    state.actual_flushed.fetch_add(pages, Ordering::Relaxed);
    state.batches.fetch_add(1, Ordering::Relaxed);

    for position in written {
        shared.queue.complete(position);
    }
    claimed.clear();
    shared.queue.retire_head();
    debug!(writer = id, pages, skipped, layout_sensitive = staging.layout_sensitive(), "batch applied");
    staging.reset();
    Ok(pages)
}
