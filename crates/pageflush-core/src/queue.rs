//! Dirty page queue
//!
//! A fixed-capacity ring of slots recording which buffers are dirty and not
//! yet flushed. Producers append at `tail`, writers flush slots anywhere in
//! `[head, tail)`, and `head` only moves past a contiguous run of finished
//! (Flushed or Invalidated) slots. The oldest unflushed modification is
//! therefore always at or after `head`.
//!
//! `head` and `tail` are monotonic ring positions, not wrapped indices; the
//! slot for position `p` is `p % capacity`. Each slot packs the position it
//! currently holds together with its state into one `AtomicU64`
//! (`position << 3 | state`), so every compare-and-swap also checks that the
//! slot has not been recycled for a later position in between.
//!
//! No lock is taken anywhere in this module.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::types::BufferId;

/// High bit of `tail`: set once the queue is closed for pushes.
const CLOSED_BIT: u64 = 1 << 63;

const STATE_BITS: u32 = 3;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

/// Lifecycle of a queue slot.
///
/// `Free → Occupied → Valid → Writing → Flushed → Free`, with
/// `Occupied | Valid → Invalidated → Free` when the buffer is cleaned
/// elsewhere first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Not holding an entry (or claimed by a producer that has not yet
    /// published its buffer id)
    Free = 0,
    /// Published by a producer, waiting for a writer
    Occupied = 1,
    /// Claimed by a writer in the current round
    Valid = 2,
    /// Written to the data file; ready to retire
    Flushed = 3,
    /// Buffer cleaned by another path; ready to retire without a write
    Invalidated = 4,
    /// Page image being written to the data file; can no longer be
    /// invalidated
    Writing = 5,
}

impl SlotState {
    fn from_bits(bits: u64) -> Self {
        match bits {
            1 => SlotState::Occupied,
            2 => SlotState::Valid,
            3 => SlotState::Flushed,
            4 => SlotState::Invalidated,
            5 => SlotState::Writing,
            _ => SlotState::Free,
        }
    }

    /// Still holds an unflushed modification.
    pub fn is_pending(self) -> bool {
        matches!(self, SlotState::Occupied | SlotState::Valid | SlotState::Writing)
    }

    /// Finished and may be retired.
    pub fn is_done(self) -> bool {
        matches!(self, SlotState::Flushed | SlotState::Invalidated)
    }
}

#[inline]
fn pack(position: u64, state: SlotState) -> u64 {
    (position << STATE_BITS) | state as u64
}

#[inline]
fn unpack(tag: u64) -> (u64, SlotState) {
    (tag >> STATE_BITS, SlotState::from_bits(tag & STATE_MASK))
}

/// One ring element. Allocated once, reused for every position that maps to it.
struct QueueSlot {
    /// `position << 3 | state`
    tag: AtomicU64,
    /// Buffer recorded by the producer; written before the tag is published
    buffer: AtomicU32,
}

/// Fixed-capacity concurrent ring of dirty buffer ids.
pub struct DirtyPageQueue {
    slots: Box<[QueueSlot]>,
    capacity: u64,
    /// Oldest position not yet retired
    head: AtomicU64,
    /// Next position to hand to a producer; `CLOSED_BIT` marks shutdown
    tail: AtomicU64,
    /// Slots retired since creation (observability)
    retired: AtomicU64,
    /// Slots invalidated since creation (observability)
    invalidated: AtomicU64,
}

impl DirtyPageQueue {
    /// Allocate a queue with `capacity` slots.
    ///
    /// # Panics
    /// Panics if `capacity` is zero (rejected earlier by `Config::validate`).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be > 0");
        let slots = (0..capacity as u64)
            .map(|pos| QueueSlot {
                tag: AtomicU64::new(pack(pos, SlotState::Free)),
                buffer: AtomicU32::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            capacity: capacity as u64,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            invalidated: AtomicU64::new(0),
        }
    }

    #[inline]
    fn slot(&self, position: u64) -> &QueueSlot {
        &self.slots[(position % self.capacity) as usize]
    }

    /// Append `buffer` at the tail.
    ///
    /// Returns false, without touching the queue, when it is full or closed.
    /// That is backpressure for the caller to handle, not an error.
    pub fn try_push(&self, buffer: BufferId) -> bool {
        let position = loop {
            let tail = self.tail.load(Ordering::Acquire);
            if tail & CLOSED_BIT != 0 {
                return false;
            }
            let head = self.head.load(Ordering::Acquire);
            if tail - head >= self.capacity {
                return false;
            }
            if self
                .tail
                .compare_exchange_weak(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break tail;
            }
        };

        // `position - capacity` has been retired (head > position - capacity),
        // so the slot is ours until we publish it.
        let slot = self.slot(position);
        slot.buffer.store(buffer.0, Ordering::Relaxed);
        slot.tag.store(pack(position, SlotState::Occupied), Ordering::Release);
        true
    }

    /// Claim the entry at `position` for flushing (Occupied → Valid).
    ///
    /// Returns `None` when the slot is not published yet, already claimed,
    /// finished, or recycled for another position.
    pub fn claim(&self, position: u64) -> Option<BufferId> {
        let slot = self.slot(position);
        let claimed = slot.tag.compare_exchange(
            pack(position, SlotState::Occupied),
            pack(position, SlotState::Valid),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        claimed.ok().map(|_| BufferId(slot.buffer.load(Ordering::Acquire)))
    }

    /// Commit to writing the claimed entry (Valid → Writing). Called right
    /// before the page goes to the data file.
    ///
    /// Returns false if the slot was invalidated since it was claimed; the
    /// caller must then skip the write.
    pub fn begin_write(&self, position: u64) -> bool {
        self.slot(position)
            .tag
            .compare_exchange(
                pack(position, SlotState::Valid),
                pack(position, SlotState::Writing),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Record a finished write (Writing → Flushed).
    pub fn complete(&self, position: u64) -> bool {
        self.slot(position)
            .tag
            .compare_exchange(
                pack(position, SlotState::Writing),
                pack(position, SlotState::Flushed),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Drop a claimed entry without writing it (Valid → Invalidated).
    pub fn abandon(&self, position: u64) -> bool {
        let done = self
            .slot(position)
            .tag
            .compare_exchange(
                pack(position, SlotState::Valid),
                pack(position, SlotState::Invalidated),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if done {
            self.invalidated.fetch_add(1, Ordering::Relaxed);
        }
        done
    }

    /// Mark every Occupied or Valid entry for `buffer` Invalidated.
    ///
    /// Used when the buffer was cleaned outside the writer pool. A writer
    /// holding an invalidated Valid slot fails [`begin_write`](Self::begin_write)
    /// and drops its image. Writing slots are left alone; see
    /// [`write_in_flight`](Self::write_in_flight). Head does not move; call
    /// [`retire_head`](Self::retire_head) afterwards. Returns the number of
    /// slots invalidated.
    pub fn invalidate(&self, buffer: BufferId) -> usize {
        let head = self.head();
        let tail = self.tail();
        let mut count = 0;
        for position in head..tail {
            let slot = self.slot(position);
            let tag = slot.tag.load(Ordering::Acquire);
            let (held, state) = unpack(tag);
            if held != position || !matches!(state, SlotState::Occupied | SlotState::Valid) {
                continue;
            }
            if slot.buffer.load(Ordering::Acquire) != buffer.0 {
                continue;
            }
            // The CAS fails if the slot changed state or was recycled after
            // we read the buffer id.
            if slot
                .tag
                .compare_exchange(
                    tag,
                    pack(position, SlotState::Invalidated),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                count += 1;
            }
        }
        self.invalidated.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Free the contiguous run of finished slots at head and advance head.
    ///
    /// Stops at the first slot that is pending or not yet published. Safe to
    /// call from any number of threads at once. Returns the number of slots
    /// this call retired.
    pub fn retire_head(&self) -> usize {
        let mut retired = 0;
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head >= self.tail() {
                break;
            }
            let slot = self.slot(head);
            let tag = slot.tag.load(Ordering::Acquire);
            let (held, state) = unpack(tag);
            if held != head || !state.is_done() {
                break;
            }
            // Free the slot for the position that will reuse it. Only the
            // thread that wins this CAS advances head past `head`.
            if slot
                .tag
                .compare_exchange(
                    tag,
                    pack(head + self.capacity, SlotState::Free),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }
            self.head.store(head + 1, Ordering::Release);
            retired += 1;
        }
        if retired > 0 {
            self.retired.fetch_add(retired as u64, Ordering::Relaxed);
        }
        retired
    }

    /// True while a writer is writing a page image of `buffer`.
    pub fn write_in_flight(&self, buffer: BufferId) -> bool {
        let mut found = false;
        self.for_each_in_state(SlotState::Writing, |_, b| found |= b == buffer);
        found
    }

    /// Close the queue: every later `try_push` returns false. Irreversible.
    pub fn close(&self) {
        self.tail.fetch_or(CLOSED_BIT, Ordering::AcqRel);
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.tail.load(Ordering::Acquire) & CLOSED_BIT != 0
    }

    /// Oldest unretired position.
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Next position a producer will receive.
    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire) & !CLOSED_BIT
    }

    /// Entries between head and tail (pending, in flight, or awaiting retirement).
    pub fn depth(&self) -> usize {
        // head first: tail read afterwards can only be larger
        let head = self.head();
        let tail = self.tail();
        (tail.saturating_sub(head)).min(self.capacity) as usize
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// True when no entry is between head and tail.
    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// State of the slot holding `position`, or `None` if the slot has been
    /// recycled for a different position.
    pub fn state_at(&self, position: u64) -> Option<SlotState> {
        let (held, state) = unpack(self.slot(position).tag.load(Ordering::Acquire));
        (held == position).then_some(state)
    }

    /// Visit every pending (Occupied, Valid or Writing) entry from head to
    /// tail.
    pub fn for_each_pending(&self, visit: impl FnMut(u64, BufferId)) {
        self.scan(SlotState::is_pending, visit);
    }

    fn for_each_in_state(&self, wanted: SlotState, visit: impl FnMut(u64, BufferId)) {
        self.scan(|state| state == wanted, visit);
    }

    fn scan(&self, keep: impl Fn(SlotState) -> bool, mut visit: impl FnMut(u64, BufferId)) {
        let head = self.head();
        let tail = self.tail();
        for position in head..tail {
            let slot = self.slot(position);
            let tag = slot.tag.load(Ordering::Acquire);
            let (held, state) = unpack(tag);
            if held != position || !keep(state) {
                continue;
            }
            let buffer = BufferId(slot.buffer.load(Ordering::Acquire));
            // re-check: the slot may have been retired and reused in between
            if slot.tag.load(Ordering::Acquire) == tag {
                visit(position, buffer);
            }
        }
    }

    /// Slots retired since creation.
    pub fn total_retired(&self) -> u64 {
        self.retired.load(Ordering::Relaxed)
    }

    /// Slots invalidated since creation.
    pub fn total_invalidated(&self) -> u64 {
        self.invalidated.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DirtyPageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyPageQueue")
            .field("capacity", &self.capacity)
            .field("head", &self.head())
            .field("tail", &self.tail())
            .field("closed", &self.is_closed())
            .finish()
    }
}
