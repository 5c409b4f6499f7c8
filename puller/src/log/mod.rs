//! Bounded report log and the cursor that tails it.
//!
//! A log assigns every appended document a contiguous position. Once the
//! log holds `capacity` documents, appending evicts the oldest one. Readers
//! compare their position with the oldest surviving position to detect that
//! they fell behind (overrun).

pub mod cursor;
pub mod memory;
pub mod persistent;

pub use cursor::{Cursor, CursorOptions};
pub use memory::CappedLog;
pub use persistent::PersistentCappedLog;

use crate::config::StoreConfig;
use crate::error::{ConfigError, StoreError};
use async_trait::async_trait;
use hwpc_shared::RawDocument;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A document together with its log position
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub position: u64,
    pub document: RawDocument,
}

/// Positions currently held by a log.
///
/// `oldest == next` means the log is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogBounds {
    /// Position of the oldest surviving entry
    pub oldest: u64,
    /// Position the next append will receive
    pub next: u64,
}

impl LogBounds {
    pub fn len(&self) -> u64 {
        self.next - self.oldest
    }

    pub fn is_empty(&self) -> bool {
        self.oldest == self.next
    }
}

/// Result of a [`ReportLog::fetch`]
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub bounds: LogBounds,
    /// Entries starting at `max(from, bounds.oldest)`, in insertion order
    pub entries: Vec<LogEntry>,
}

/// Read side of a bounded append log.
#[async_trait]
pub trait ReportLog: Send + Sync + 'static {
    /// Human-readable name for logging
    fn name(&self) -> &str;

    /// Current oldest/next positions
    async fn bounds(&self) -> Result<LogBounds, StoreError>;

    /// Read up to `limit` entries starting at `from` (or at the oldest
    /// surviving entry if `from` has been evicted).
    async fn fetch(&self, from: u64, limit: usize) -> Result<Fetched, StoreError>;

    /// Suspend until an entry at or after `position` may exist.
    ///
    /// Stores without change notification poll.
    async fn wait_for_append(&self, _position: u64, poll_interval: Duration) {
        tokio::time::sleep(poll_interval).await;
    }

    /// Last committed position of a named reader
    async fn load_checkpoint(&self, _reader: &str) -> Result<Option<u64>, StoreError> {
        Ok(None)
    }

    /// Commit a reader position
    async fn store_checkpoint(&self, _reader: &str, _position: u64) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Where a new cursor starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StartPosition {
    /// Oldest surviving entry
    #[default]
    Beginning,
    /// Only entries appended after opening
    Latest,
    /// A specific position
    At(u64),
    /// The reader's committed checkpoint, or the beginning if there is none
    Checkpoint,
}

impl std::str::FromStr for StartPosition {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "beginning" | "oldest" => Ok(StartPosition::Beginning),
            "latest" | "end" => Ok(StartPosition::Latest),
            "checkpoint" => Ok(StartPosition::Checkpoint),
            other => other
                .strip_prefix("at:")
                .and_then(|n| n.trim().parse().ok())
                .map(StartPosition::At)
                .ok_or_else(|| ConfigError::UnparsableStartPosition(s.to_string())),
        }
    }
}

impl TryFrom<String> for StartPosition {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<StartPosition> for String {
    fn from(p: StartPosition) -> Self {
        p.to_string()
    }
}

impl std::fmt::Display for StartPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartPosition::Beginning => write!(f, "beginning"),
            StartPosition::Latest => write!(f, "latest"),
            StartPosition::At(p) => write!(f, "at:{}", p),
            StartPosition::Checkpoint => write!(f, "checkpoint"),
        }
    }
}

/// A configured store, with both its read and write side
#[derive(Clone)]
pub enum Store {
    Memory(Arc<CappedLog>),
    Persistent(Arc<PersistentCappedLog>),
}

impl Store {
    /// Open the store described by the configuration
    pub fn open(config: &StoreConfig, name: &str) -> Result<Self, StoreError> {
        match config {
            StoreConfig::Memory { capacity } => {
                Ok(Store::Memory(Arc::new(CappedLog::new(name, *capacity))))
            }
            StoreConfig::Persistent { path, capacity } => Ok(Store::Persistent(Arc::new(
                PersistentCappedLog::open(path, name, *capacity)?,
            ))),
        }
    }

    /// Read side, for the pipeline
    pub fn reader(&self) -> Arc<dyn ReportLog> {
        match self {
            Store::Memory(log) => log.clone(),
            Store::Persistent(log) => log.clone(),
        }
    }

    /// Append one document, evicting the oldest entry when full
    pub fn append(&self, document: RawDocument) -> Result<u64, StoreError> {
        match self {
            Store::Memory(log) => log.append(document),
            Store::Persistent(log) => log.append(&document),
        }
    }
}
