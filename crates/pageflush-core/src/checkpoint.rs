//! Checkpoint coordinator
//!
//! Runs on its own thread. Every round it sizes a flush quota, splits the
//! oldest `quota` queue entries into one contiguous range per writer, wakes
//! the writers and waits until all of them report back. It also answers the
//! question the WAL asks: how far back must the log still reach?

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::Instant;

use tracing::{debug, info};

use crate::config::Config;
use crate::engine::Shared;
use crate::error::{FlushError, FlushResult};
use crate::queue::DirtyPageQueue;
use crate::types::{BufferId, LogPosition};

/// Interface the engine consumes from the write-ahead log.
pub trait WalPositions: Send + Sync {
    /// Log position of the most recent modification of `buffer`.
    fn last_modifying_position(&self, buffer: BufferId) -> LogPosition;
}

const NO_DRAIN: usize = usize::MAX;

/// Earliest log position still needed to recover the queued pages.
///
/// The minimum over every pending (Occupied, Valid or Writing) entry of its
/// buffer's last modifying position. `None` when nothing is pending: the log
/// may be truncated up to its current end.
pub fn min_required_log_position(queue: &DirtyPageQueue, wal: &dyn WalPositions) -> Option<LogPosition> {
    let mut min: Option<LogPosition> = None;
    queue.for_each_pending(|_, buffer| {
        let position = wal.last_modifying_position(buffer);
        min = Some(min.map_or(position, |m| m.min(position)));
    });
    min
}

/// Number of entries to flush this round.
///
/// Rate-limited to `Config::pages_per_round` unless a drain is active or the
/// queue is above its high-water mark, in which case everything pending is
/// taken.
pub fn flush_quota(depth: usize, config: &Config, draining: bool) -> usize {
    if draining || depth >= config.high_water_depth() {
        return depth;
    }
    depth.min(config.pages_per_round())
}

/// Split `[head, head + quota)` into one contiguous range per writer.
///
/// Every writer gets `quota / writers` entries; the remainder goes to the
/// last one. Ranges may be empty.
pub fn assign_ranges(head: u64, quota: usize, writers: usize) -> Vec<Range<u64>> {
    let share = (quota / writers) as u64;
    let mut ranges = Vec::with_capacity(writers);
    let mut start = head;
    for i in 0..writers {
        let end = if i + 1 == writers { head + quota as u64 } else { start + share };
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Drain requests and round bookkeeping shared with the coordinator thread.
pub struct CheckpointCoordinator {
    drain_target: AtomicUsize,
    shutdown_requested: AtomicBool,
    rounds: AtomicU64,
    thread: OnceLock<Thread>,
}

impl CheckpointCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            drain_target: AtomicUsize::new(NO_DRAIN),
            shutdown_requested: AtomicBool::new(false),
            rounds: AtomicU64::new(0),
            thread: OnceLock::new(),
        }
    }

    /// Ask for back-to-back rounds until the queue depth is at most
    /// `target_depth`. Does not wait. A lower pending target wins.
    pub fn request_drain(&self, target_depth: usize) {
        self.drain_target.fetch_min(target_depth, Ordering::AcqRel);
        self.wake();
    }

    /// Active drain target, if any.
    pub fn drain_target(&self) -> Option<usize> {
        match self.drain_target.load(Ordering::Acquire) {
            NO_DRAIN => None,
            target => Some(target),
        }
    }

    /// Rounds completed since start.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// True once the final drain has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
        self.request_drain(0);
    }

    pub(crate) fn register_thread(&self, thread: Thread) {
        let _ = self.thread.set(thread);
    }

    pub(crate) fn wake(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    /// Clear the drain target once it has been reached. A concurrent
    /// request for a lower target is left in place.
    fn finish_drain(&self, reached: usize) {
        if self.is_shutting_down() {
            return;
        }
        let _ = self.drain_target.compare_exchange(reached, NO_DRAIN, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Start the coordinator thread.
pub(crate) fn spawn_coordinator(shared: Arc<Shared>) -> FlushResult<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("pageflush-ckpt".to_string())
        .spawn({
            let shared = Arc::clone(&shared);
            move || coordinator_loop(&shared)
        })
        .map_err(|e| FlushError::Io {
            path: None,
            kind: e.kind(),
            message: format!("Failed to spawn checkpoint thread: {}", e),
        })?;
    shared.coordinator.register_thread(handle.thread().clone());
    Ok(handle)
}

/// Main coordinator loop; runs until the engine stops or halts.
fn coordinator_loop(shared: &Shared) {
    let config = &shared.config;
    let mut next_round = Instant::now() + config.round_interval;

    loop {
        if shared.should_stop() || shared.is_halted() {
            break;
        }

        let depth = shared.queue.depth();
        let target = shared.coordinator.drain_target();
        let draining = target.map_or(false, |t| depth > t);
        if let Some(t) = target {
            if !draining {
                shared.coordinator.finish_drain(t);
            }
        }

        let now = Instant::now();
        let due = now >= next_round || depth >= config.high_water_depth();
        if depth == 0 || !(draining || due) {
            if now >= next_round {
                next_round = now + config.round_interval;
            }
            thread::park_timeout(config.poll_interval);
            continue;
        }

        run_round(shared, depth, draining);
        next_round = Instant::now() + config.round_interval;

        // Nothing moved (entries not yet published by their producer): back
        // off instead of spinning.
        if shared.queue.depth() >= depth {
            thread::park_timeout(config.poll_interval);
        }
    }
    debug!(rounds = shared.coordinator.rounds(), "checkpoint coordinator stopped");
}

/// Dispatch one round and wait for every writer to finish it.
fn run_round(shared: &Shared, depth: usize, draining: bool) {
    let quota = flush_quota(depth, &shared.config, draining);
    let head = shared.queue.head();
    let ranges = assign_ranges(head, quota, shared.writers.len());
    let dispatched = shared.writers.dispatch(&ranges);
    debug!(head, depth, quota, dispatched, draining, "flush round dispatched");

    shared.writers.wait_idle(shared.config.poll_interval, || shared.should_stop());

    // sweep: a writer's retire can stop at a slot another writer finishes later
    shared.queue.retire_head();
    let round = shared.coordinator.rounds.fetch_add(1, Ordering::Relaxed) + 1;
    if draining && shared.queue.depth() == 0 {
        info!(round, "dirty page queue drained");
    }
}
