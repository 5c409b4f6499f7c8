//! Error types for the puller
//!
//! Only two conditions are fatal to a running pipeline: the store staying
//! unreachable after every reconnection attempt, and an overrun when the
//! overrun policy says so. Everything else is counted and skipped.

use std::time::Duration;
use thiserror::Error;

pub use hwpc_shared::ValidationError;

/// Transient failure talking to the backing store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Store cannot be reached right now
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Store answered but the operation failed
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(e) => StoreError::Unavailable(e.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Conditions surfaced by [`crate::log::Cursor::next`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReaderError {
    /// The cursor's position was evicted before it could be read
    #[error("log overrun: expected position {expected} but oldest entry is {oldest} ({missed} reports missed)")]
    Overrun { expected: u64, oldest: u64, missed: u64 },

    /// Reconnection attempts exhausted
    #[error("store unavailable after {attempts} attempts at position {position}: {last_error}")]
    StoreUnavailable {
        attempts: u32,
        position: u64,
        last_error: StoreError,
    },
}

/// A single consumer invocation went wrong
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsumerError {
    /// The consumer returned an error
    #[error("consumer failed: {0}")]
    Failed(String),

    /// The consumer did not return within the invocation timeout
    #[error("consumer timed out after {0:?}")]
    TimedOut(Duration),

    /// The consumer panicked
    #[error("consumer panicked")]
    Panicked,

    /// The consumer's queue stayed full for the whole dispatch timeout
    #[error("consumer queue full")]
    QueueFull,

    /// The consumer's worker is gone (pipeline shutting down)
    #[error("consumer worker closed")]
    Closed,
}

impl ConsumerError {
    /// Convenience constructor for consumer implementations
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        ConsumerError::Failed(reason.to_string())
    }
}

/// Invalid setup, detected before the pipeline starts running
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("filter `{0}` is already registered")]
    DuplicateFilter(String),

    #[error("filter `{0}` has no predicate")]
    MissingPredicate(String),

    #[error("filter name must not be empty")]
    EmptyFilterName,

    #[error("no filter registered, every report would be dropped")]
    NoFilters,

    #[error("start position {requested} is past the end of the log (next position is {next})")]
    InvalidStartPosition { requested: u64, next: u64 },

    #[error("invalid start position `{0}` (expected beginning, latest, checkpoint or at:<n>)")]
    UnparsableStartPosition(String),

    #[error("invalid setting `{setting}`: {reason}")]
    InvalidSetting { setting: &'static str, reason: String },

    #[error("cannot open store: {0}")]
    Store(StoreError),
}

/// Error kinds used as counter labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Overrun,
    StoreUnavailable,
    Consumer,
    Configuration,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::Validation,
        ErrorKind::Overrun,
        ErrorKind::StoreUnavailable,
        ErrorKind::Consumer,
        ErrorKind::Configuration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Overrun => "overrun",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::Consumer => "consumer",
            ErrorKind::Configuration => "configuration",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            ErrorKind::Validation => 0,
            ErrorKind::Overrun => 1,
            ErrorKind::StoreUnavailable => 2,
            ErrorKind::Consumer => 3,
            ErrorKind::Configuration => 4,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the owner of a pipeline sees
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("pipeline failed at position {position}: {cause}")]
    Failed { position: u64, cause: ReaderError },

    #[error("pipeline task ended abnormally: {0}")]
    Aborted(String),
}
