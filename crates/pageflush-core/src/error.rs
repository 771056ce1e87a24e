//! Error types for pageflush operations
//!
//! Every failure the engine can report is a variant of [`FlushError`]. The enum
//! is `Clone` because the first fatal I/O error is stored by the engine and
//! re-reported to every later caller.

use std::path::PathBuf;

use thiserror::Error;

/// Pageflush error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum FlushError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", display_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A page failed checksum verification when read back
    #[error("Page corrupted at block {block}: stored checksum 0x{stored:04x}, computed 0x{computed:04x}")]
    PageCorrupted {
        /// Block number of the page
        block: u32,
        /// Checksum found in the page header
        stored: u16,
        /// Checksum computed over the page content
        computed: u16,
    },

    /// A staging file header or payload is damaged
    #[error("Staging file {} corrupted at offset {offset}: {reason}", .path.display())]
    StagingCorrupted {
        /// Staging file path
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// A page image does not match the configured page size
    #[error("Page size mismatch: expected {expected} bytes, got {actual}")]
    PageSizeMismatch {
        /// Configured page size
        expected: usize,
        /// Size of the offending image
        actual: usize,
    },

    /// Configuration rejected by `Config::validate`
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The dirty page queue stayed full for the whole wait
    #[error("Dirty page queue still full after waiting: depth {depth} of {capacity}")]
    Backpressure {
        /// Queue depth observed at the deadline
        depth: usize,
        /// Queue capacity
        capacity: usize,
    },

    /// The engine stopped after a fatal error and accepts no more work
    #[error("Flush engine halted: {reason}")]
    Halted {
        /// Description of the error that halted the engine
        reason: String,
    },

    /// The engine has already been shut down
    #[error("Flush engine is shut down")]
    ShutDown,
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

impl FlushError {
    /// Build an `Io` error with path context from a `std::io::Error`.
    pub fn io_at(path: impl Into<PathBuf>, err: &std::io::Error, what: &str) -> Self {
        FlushError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }
}

/// Convert std::io::Error to FlushError::Io
impl From<std::io::Error> for FlushError {
    fn from(err: std::io::Error) -> Self {
        FlushError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for pageflush operations
pub type FlushResult<T> = Result<T, FlushError>;
