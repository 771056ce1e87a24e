//! Pageflush Core: incremental checkpoint and double-write flushing
//!
//! Moves dirty pages from a buffer pool to a data file in the background so
//! the write-ahead log can be truncated, without ever leaving a torn page
//! behind after a crash.
//!
//! # Architecture
//!
//! - **Dirty page queue**: fixed-capacity lock-free ring; producers push a
//!   buffer id on every clean to dirty transition
//! - **Writer pool**: background threads flush contiguous queue ranges
//!   through a per-writer double-write staging file
//! - **Checkpoint coordinator**: rate-limited rounds, drains on demand, and
//!   reports the oldest log position still needed
//! - **Recovery**: at start, torn data pages are repaired from staging files
//!
//! The buffer pool, the WAL and the data file are collaborators behind
//! traits ([`BufferPool`], [`WalPositions`], [`PageStore`]). In-memory and
//! file-backed implementations are included.

pub mod buffer;
pub mod checkpoint;
pub mod checksum;
pub mod config;
pub mod engine;
pub mod error;
pub mod page;
pub mod platform_durability;
pub mod queue;
pub mod recovery;
pub mod staging;
pub mod store;
pub mod types;
pub mod writer;

// Re-export key types for convenience
pub use buffer::{BufferPool, MemBufferPool, PageImage};
pub use checkpoint::{assign_ranges, flush_quota, min_required_log_position, CheckpointCoordinator, WalPositions};
pub use checksum::compute_page_checksum;
pub use config::Config;
pub use engine::{Collaborators, FatalHook, FlushEngine, FlushStats};
pub use error::{FlushError, FlushResult};
pub use queue::{DirtyPageQueue, SlotState};
pub use recovery::{recover_staging, RecoveryReport};
pub use staging::{AppendOutcome, StagingBuffer};
pub use store::{FilePageStore, PageStore};
pub use types::{BlockNumber, BufferId, LogPosition};
pub use writer::{WriterPool, WriterThreadState};
