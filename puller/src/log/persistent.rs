//! Capped log persisted with sled
//!
//! Tree layout:
//! - `entries`: big-endian position -> JSON document bytes
//! - `meta`: `next` -> big-endian next position
//! - `checkpoints`: reader name -> big-endian committed position

use super::{Fetched, LogBounds, LogEntry, ReportLog};
use crate::error::StoreError;
use async_trait::async_trait;
use hwpc_shared::RawDocument;
use serde_json::Value;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

const NEXT_KEY: &[u8] = b"next";

/// Capped log stored on disk. Survives restarts, including reader checkpoints.
pub struct PersistentCappedLog {
    name: String,
    capacity: usize,
    db: Db,
    entries: Tree,
    meta: Tree,
    checkpoints: Tree,
    // Serializes appends so positions stay contiguous.
    append_lock: Mutex<()>,
}

impl PersistentCappedLog {
    /// Open or create a log at `path`
    pub fn open<P: AsRef<Path>>(path: P, name: &str, capacity: usize) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db, name, capacity)
    }

    /// Open a throwaway log, removed when dropped
    pub fn open_temp(name: &str, capacity: usize) -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, name, capacity)
    }

    fn from_db(db: Db, name: &str, capacity: usize) -> Result<Self, StoreError> {
        let entries = db.open_tree("entries")?;
        let meta = db.open_tree("meta")?;
        let checkpoints = db.open_tree("checkpoints")?;
        Ok(Self {
            name: name.to_string(),
            capacity: capacity.max(1),
            db,
            entries,
            meta,
            checkpoints,
            append_lock: Mutex::new(()),
        })
    }

    /// Append a document and return its position. Drops the oldest if at capacity.
    pub fn append(&self, document: &RawDocument) -> Result<u64, StoreError> {
        let _guard = self
            .append_lock
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let position = self.next_position()?;
        let bytes = serde_json::to_vec(document).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.entries.insert(position.to_be_bytes(), bytes)?;
        let next = position + 1;
        self.meta.insert(NEXT_KEY, next.to_be_bytes().to_vec())?;

        while let Some((key, _)) = self.entries.first()? {
            if next - decode_position(&key)? <= self.capacity as u64 {
                break;
            }
            self.entries.remove(key)?;
        }

        debug!(log = %self.name, position, "Appended document");
        Ok(position)
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn next_position(&self) -> Result<u64, StoreError> {
        match self.meta.get(NEXT_KEY)? {
            Some(bytes) => decode_position(&bytes),
            None => Ok(0),
        }
    }

    fn read_bounds(&self) -> Result<LogBounds, StoreError> {
        let next = self.next_position()?;
        let oldest = match self.entries.first()? {
            Some((key, _)) => decode_position(&key)?,
            None => next,
        };
        Ok(LogBounds { oldest, next })
    }
}

fn decode_position(bytes: &[u8]) -> Result<u64, StoreError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Backend(format!("invalid position key of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

/// Undecodable bytes are surfaced as a string document so the validator
/// rejects them like any other malformed report.
fn decode_document(position: u64, bytes: &[u8]) -> RawDocument {
    serde_json::from_slice(bytes).unwrap_or_else(|e| {
        warn!(position, error = %e, "Stored entry is not JSON");
        Value::String(String::from_utf8_lossy(bytes).into_owned())
    })
}

#[async_trait]
impl ReportLog for PersistentCappedLog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bounds(&self) -> Result<LogBounds, StoreError> {
        self.read_bounds()
    }

    async fn fetch(&self, from: u64, limit: usize) -> Result<Fetched, StoreError> {
        let bounds = self.read_bounds()?;
        let start = from.max(bounds.oldest);

        let mut entries = Vec::with_capacity(limit.min(1024));
        for item in self.entries.range(start.to_be_bytes()..).take(limit) {
            let (key, value) = item?;
            let position = decode_position(&key)?;
            entries.push(LogEntry {
                position,
                document: decode_document(position, &value),
            });
        }

        // An eviction between reading bounds and scanning moves the start forward.
        let bounds = match entries.first() {
            Some(first) if first.position > bounds.oldest => LogBounds {
                oldest: first.position,
                next: bounds.next,
            },
            _ => bounds,
        };

        Ok(Fetched { bounds, entries })
    }

    async fn load_checkpoint(&self, reader: &str) -> Result<Option<u64>, StoreError> {
        match self.checkpoints.get(reader.as_bytes())? {
            Some(bytes) => Ok(Some(decode_position(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn store_checkpoint(&self, reader: &str, position: u64) -> Result<(), StoreError> {
        self.checkpoints
            .insert(reader.as_bytes(), position.to_be_bytes().to_vec())?;
        Ok(())
    }
}
