//! Flush engine: the one object embedders construct.
//!
//! `FlushEngine::start` replays any unapplied staging batch, opens one
//! staging buffer per writer and spawns the writer pool plus the checkpoint
//! coordinator. Producers call [`FlushEngine::mark_dirty`] on every clean to
//! dirty transition; the background threads take it from there.
//!
//! **Hot path**: `mark_dirty` is a lock-free queue push, never blocks
//! **Background**: coordinator rounds flush the oldest entries through the
//! double-write protocol
//! **Shutdown**: `shutdown_drain` closes the queue and waits until every
//! queued page is on disk

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::buffer::BufferPool;
use crate::checkpoint::{self, spawn_coordinator, CheckpointCoordinator, WalPositions};
use crate::config::Config;
use crate::error::{FlushError, FlushResult};
use crate::queue::DirtyPageQueue;
use crate::recovery::{recover_staging, RecoveryReport};
use crate::staging::StagingBuffer;
use crate::store::PageStore;
use crate::types::{BufferId, LogPosition};
use crate::writer::{spawn_writer, WriterPool};

/// Callback invoked once with the error that halted the engine.
pub type FatalHook = Box<dyn Fn(&FlushError) + Send + Sync>;

/// The systems the engine works against.
pub struct Collaborators {
    /// Source of dirty page images
    pub buffers: Arc<dyn BufferPool>,
    /// Log positions for `min_required_log_position`
    pub wal: Arc<dyn WalPositions>,
    /// Data file the pages are written to
    pub store: Arc<dyn PageStore>,
    /// Called on the first fatal error
    pub on_fatal: Option<FatalHook>,
}

impl Collaborators {
    /// Bundle the three required collaborators, without a fatal hook.
    pub fn new(buffers: Arc<dyn BufferPool>, wal: Arc<dyn WalPositions>, store: Arc<dyn PageStore>) -> Self {
        Self { buffers, wal, store, on_fatal: None }
    }

    /// Install a hook run once when the engine halts, e.g. to request a
    /// process-level shutdown.
    pub fn on_fatal(mut self, hook: impl Fn(&FlushError) + Send + Sync + 'static) -> Self {
        self.on_fatal = Some(Box::new(hook));
        self
    }
}

/// State shared by the engine handle, the coordinator and every writer.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) queue: DirtyPageQueue,
    pub(crate) writers: WriterPool,
    pub(crate) coordinator: CheckpointCoordinator,
    pub(crate) buffers: Arc<dyn BufferPool>,
    pub(crate) wal: Arc<dyn WalPositions>,
    pub(crate) store: Arc<dyn PageStore>,
    stop: AtomicBool,
    halted: AtomicBool,
    fatal: Mutex<Option<FlushError>>,
    on_fatal: Option<FatalHook>,
}

impl Shared {
    /// Threads exit once this is set and they have no assignment left.
    pub(crate) fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Record a fatal error and stop accepting work. Only the first error is
    /// kept and reported to the hook.
    pub(crate) fn halt(&self, err: FlushError) {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_some() {
                return;
            }
            *fatal = Some(err.clone());
        }
        self.halted.store(true, Ordering::Release);
        self.queue.close();
        error!(error = %err, depth = self.queue.depth(), "flush engine halted");
        if let Some(hook) = &self.on_fatal {
            hook(&err);
        }
        self.coordinator.wake();
    }

    fn fatal_error(&self) -> Option<FlushError> {
        self.fatal.lock().clone()
    }
}

/// Point-in-time counters of a running engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Entries not yet retired
    pub queue_depth: usize,
    /// Queue capacity
    pub queue_capacity: usize,
    /// Oldest unretired position
    pub head: u64,
    /// Next position to be pushed
    pub tail: u64,
    /// Writers busy with the current round
    pub running_writers: usize,
    /// Pages written by each writer
    pub flushed_per_writer: Vec<u64>,
    /// Pages written in total
    pub total_flushed: u64,
    /// Double-write batches applied
    pub batches: u64,
    /// Coordinator rounds completed
    pub rounds: u64,
    /// Entries invalidated (cleaned elsewhere or abandoned by a writer)
    pub invalidated: u64,
    /// Entries retired from the head
    pub retired: u64,
    /// Engine stopped after a fatal error
    pub halted: bool,
}

/// Incremental checkpoint engine.
///
/// All public methods take `&self`; the handle can be shared across
/// producer threads behind an `Arc`.
pub struct FlushEngine {
    shared: Arc<Shared>,
    /// Writer and coordinator threads; empty once shut down
    threads: Mutex<Vec<JoinHandle<()>>>,
    staging_dir: PathBuf,
    recovery: RecoveryReport,
    shut_down: AtomicBool,
}

impl FlushEngine {
    /// Validate `config`, repair torn pages from `staging_dir`, and start
    /// the writer pool and coordinator.
    pub fn start<P: AsRef<Path>>(config: Config, staging_dir: P, collaborators: Collaborators) -> FlushResult<Self> {
        config.validate().map_err(FlushError::InvalidConfig)?;
        let staging_dir = staging_dir.as_ref().to_path_buf();
        let Collaborators { buffers, wal, store, on_fatal } = collaborators;

        if store.page_size() != config.page_size {
            return Err(FlushError::PageSizeMismatch {
                expected: config.page_size,
                actual: store.page_size(),
            });
        }

        let recovery = recover_staging(&staging_dir, store.as_ref())?;

        let mut staging = Vec::with_capacity(config.writer_threads);
        for id in 0..config.writer_threads {
            staging.push(StagingBuffer::open(&staging_dir, id, config.page_size, config.staging_pages)?);
        }

        let shared = Arc::new(Shared {
            queue: DirtyPageQueue::new(config.queue_capacity),
            writers: WriterPool::new(config.writer_threads),
            coordinator: CheckpointCoordinator::new(),
            buffers,
            wal,
            store,
            stop: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            fatal: Mutex::new(None),
            on_fatal,
            config,
        });

        let mut threads = Vec::with_capacity(shared.config.writer_threads + 1);
        if let Err(e) = spawn_threads(&shared, staging, &mut threads) {
            shared.stop.store(true, Ordering::Release);
            shared.writers.wake_all();
            for handle in threads {
                let _ = handle.join();
            }
            return Err(e);
        }

        info!(
            writers = shared.config.writer_threads,
            queue_capacity = shared.config.queue_capacity,
            staging_pages = shared.config.staging_pages,
            page_size = shared.config.page_size,
            staging_dir = %staging_dir.display(),
            "flush engine started"
        );

        Ok(Self {
            shared,
            threads: Mutex::new(threads),
            staging_dir,
            recovery,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Queue `buffer` for flushing. Call on every clean to dirty transition.
    ///
    /// Returns false when the queue is full (backpressure) or no longer
    /// accepts entries (shut down or halted).
    pub fn mark_dirty(&self, buffer: BufferId) -> bool {
        self.shared.queue.try_push(buffer)
    }

    /// Like [`mark_dirty`](Self::mark_dirty), but on a full queue requests a
    /// drain and retries until the push lands or `timeout` expires.
    pub fn push_with_backpressure(&self, buffer: BufferId, timeout: Duration) -> FlushResult<()> {
        if self.shared.queue.try_push(buffer) {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        let capacity = self.shared.queue.capacity();
        warn!(%buffer, depth = self.shared.queue.depth(), capacity, "dirty page queue full, draining");
        self.shared.coordinator.request_drain(capacity / 2);
        loop {
            if self.shared.queue.is_closed() {
                return Err(self.closed_error());
            }
            if self.shared.queue.try_push(buffer) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FlushError::Backpressure { depth: self.shared.queue.depth(), capacity });
            }
            thread::sleep(self.shared.config.poll_interval);
        }
    }

    /// The buffer is being written or dropped outside the engine: its
    /// pending entries will not be flushed. Returns the number of entries
    /// cancelled.
    ///
    /// A writer that already copied the page but has not started its data
    /// write drops the copy. A data write already under way is waited for,
    /// so calling this before writing the page elsewhere guarantees no older
    /// image lands on top of it.
    pub fn buffer_cleaned(&self, buffer: BufferId) -> usize {
        let cancelled = self.shared.queue.invalidate(buffer);
        self.shared.queue.retire_head();
        while self.shared.queue.write_in_flight(buffer) && !self.shared.is_halted() {
            thread::sleep(self.shared.config.poll_interval);
        }
        cancelled
    }

    /// Earliest log position still needed to recover queued pages, or `None`
    /// when nothing is pending.
    pub fn min_required_log_position(&self) -> Option<LogPosition> {
        checkpoint::min_required_log_position(&self.shared.queue, self.shared.wal.as_ref())
    }

    /// Flush rounds back-to-back until depth is at most `target_depth`.
    /// Returns immediately.
    pub fn request_drain(&self, target_depth: usize) {
        self.shared.coordinator.request_drain(target_depth);
    }

    /// Block until depth is at most `target_depth`. Returns false on timeout
    /// or if the engine halts first.
    pub fn wait_for_depth(&self, target_depth: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.queue.depth() <= target_depth {
                return true;
            }
            if self.shared.is_halted() || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.shared.config.poll_interval);
        }
    }

    /// Close the queue, flush everything still queued, and stop all threads.
    ///
    /// Returns `Halted` if a fatal error stopped the engine (before or during
    /// the drain) and `ShutDown` if called a second time.
    pub fn shutdown_drain(&self) -> FlushResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Err(FlushError::ShutDown);
        }
        let shared = &self.shared;
        info!(depth = shared.queue.depth(), "shutdown drain started");

        shared.queue.close();
        shared.coordinator.request_shutdown();

        loop {
            if shared.is_halted() {
                break;
            }
            if shared.queue.depth() == 0 && shared.writers.running_count() == 0 {
                break;
            }
            shared.queue.retire_head();
            thread::sleep(shared.config.poll_interval);
        }

        shared.stop.store(true, Ordering::Release);
        shared.coordinator.wake();
        shared.writers.wake_all();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }

        if let Some(err) = shared.fatal_error() {
            return Err(FlushError::Halted { reason: err.to_string() });
        }
        info!(
            flushed = shared.writers.total_flushed(),
            rounds = shared.coordinator.rounds(),
            "flush engine stopped"
        );
        Ok(())
    }

    /// Snapshot of the engine counters.
    pub fn stats(&self) -> FlushStats {
        let shared = &self.shared;
        let flushed_per_writer: Vec<u64> = shared.writers.states().iter().map(|s| s.actual_flushed()).collect();
        FlushStats {
            queue_depth: shared.queue.depth(),
            queue_capacity: shared.queue.capacity(),
            head: shared.queue.head(),
            tail: shared.queue.tail(),
            running_writers: shared.writers.running_count(),
            total_flushed: flushed_per_writer.iter().sum(),
            flushed_per_writer,
            batches: shared.writers.total_batches(),
            rounds: shared.coordinator.rounds(),
            invalidated: shared.queue.total_invalidated(),
            retired: shared.queue.total_retired(),
            halted: shared.is_halted(),
        }
    }

    /// The error that halted the engine, if any.
    pub fn fatal_error(&self) -> Option<FlushError> {
        self.shared.fatal_error()
    }

    /// True once a fatal error has stopped the engine.
    pub fn is_halted(&self) -> bool {
        self.shared.is_halted()
    }

    /// What staging recovery did at start.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Directory holding the staging files.
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Engine configuration.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    fn closed_error(&self) -> FlushError {
        match self.shared.fatal_error() {
            Some(err) => FlushError::Halted { reason: err.to_string() },
            None => FlushError::ShutDown,
        }
    }
}

fn spawn_threads(
    shared: &Arc<Shared>,
    staging: Vec<StagingBuffer>,
    threads: &mut Vec<JoinHandle<()>>,
) -> FlushResult<()> {
    for (id, stage) in staging.into_iter().enumerate() {
        threads.push(spawn_writer(Arc::clone(shared), id, stage)?);
    }
    threads.push(spawn_coordinator(Arc::clone(shared))?);
    Ok(())
}

impl Drop for FlushEngine {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::Acquire) {
            let _ = self.shutdown_drain();
        }
    }
}
