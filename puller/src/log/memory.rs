//! In-memory capped log

use super::{Fetched, LogBounds, LogEntry, ReportLog};
use crate::error::StoreError;
use async_trait::async_trait;
use hwpc_shared::RawDocument;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
struct StoredEntry {
    position: u64,
    document: RawDocument,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<StoredEntry>,
    next: u64,
    evicted: u64,
}

/// Capped log held in memory. Thread-safe.
///
/// Keeps at most `capacity` documents; each append past that evicts the
/// oldest. Readers are woken through a watch channel carrying the next
/// position.
#[derive(Debug)]
pub struct CappedLog {
    name: String,
    capacity: usize,
    inner: RwLock<Inner>,
    appended: watch::Sender<u64>,
    available: AtomicBool,
    checkpoints: RwLock<HashMap<String, u64>>,
}

impl CappedLog {
    /// Create a log that keeps at most `capacity` documents (at least one).
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (appended, _) = watch::channel(0);
        Self {
            name: name.into(),
            capacity,
            inner: RwLock::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(4096)),
                ..Inner::default()
            }),
            appended,
            available: AtomicBool::new(true),
            checkpoints: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a document and return its position. Drops the oldest if at capacity.
    pub fn append(&self, document: RawDocument) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write().map_err(|e| StoreError::Backend(e.to_string()))?;
        let position = inner.next;
        inner.entries.push_back(StoredEntry {
            position,
            document,
        });
        inner.next += 1;
        while inner.entries.len() > self.capacity {
            inner.entries.pop_front();
            inner.evicted += 1;
        }
        let next = inner.next;
        drop(inner);

        self.appended.send_replace(next);
        Ok(position)
    }

    /// Number of documents evicted so far
    pub fn evicted(&self) -> u64 {
        self.inner.read().map(|inner| inner.evicted).unwrap_or(0)
    }

    /// Simulate the store going away (`false`) or coming back (`true`).
    ///
    /// While unavailable every operation fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        // Wake waiting readers so they observe the change.
        self.appended.send_modify(|_| {});
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("{} is offline", self.name)))
        }
    }

    fn read_bounds(inner: &Inner) -> LogBounds {
        let oldest = inner.entries.front().map_or(inner.next, |e| e.position);
        LogBounds {
            oldest,
            next: inner.next,
        }
    }
}

#[async_trait]
impl ReportLog for CappedLog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bounds(&self) -> Result<LogBounds, StoreError> {
        self.check_available()?;
        let inner = self.inner.read().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self::read_bounds(&inner))
    }

    async fn fetch(&self, from: u64, limit: usize) -> Result<Fetched, StoreError> {
        self.check_available()?;
        let inner = self.inner.read().map_err(|e| StoreError::Backend(e.to_string()))?;
        let bounds = Self::read_bounds(&inner);
        let start = from.max(bounds.oldest);
        let skip = usize::try_from(start - bounds.oldest).unwrap_or(usize::MAX);

        let entries = inner
            .entries
            .iter()
            .skip(skip)
            .take(limit)
            .map(|e| LogEntry {
                position: e.position,
                document: e.document.clone(),
            })
            .collect();

        Ok(Fetched { bounds, entries })
    }

    async fn wait_for_append(&self, position: u64, poll_interval: Duration) {
        let mut rx = self.appended.subscribe();
        if *rx.borrow_and_update() > position {
            return;
        }
        let _ = tokio::time::timeout(poll_interval, rx.changed()).await;
    }

    async fn load_checkpoint(&self, reader: &str) -> Result<Option<u64>, StoreError> {
        self.check_available()?;
        let checkpoints = self
            .checkpoints
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(checkpoints.get(reader).copied())
    }

    async fn store_checkpoint(&self, reader: &str, position: u64) -> Result<(), StoreError> {
        self.check_available()?;
        let mut checkpoints = self
            .checkpoints
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        checkpoints.insert(reader.to_string(), position);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(n: u64) -> RawDocument {
        json!({ "n": n })
    }

    #[tokio::test]
    async fn test_append_assigns_contiguous_positions() {
        let log = CappedLog::new("test", 10);
        for n in 0..3 {
            assert_eq!(log.append(doc(n)).unwrap(), n);
        }
        let fetched = log.fetch(0, 10).await.unwrap();
        assert_eq!(fetched.bounds, LogBounds { oldest: 0, next: 3 });
        let positions: Vec<u64> = fetched.entries.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(fetched.entries[2].document, doc(2));
    }

    #[tokio::test]
    async fn test_eviction_at_capacity() {
        let log = CappedLog::new("test", 3);
        for n in 0..5 {
            log.append(doc(n)).unwrap();
        }
        assert_eq!(log.evicted(), 2);

        // Reading an evicted position starts at the oldest survivor.
        let fetched = log.fetch(0, 10).await.unwrap();
        assert_eq!(fetched.bounds, LogBounds { oldest: 2, next: 5 });
        assert_eq!(fetched.entries.len(), 3);
        assert_eq!(fetched.entries[0].position, 2);
    }

    #[tokio::test]
    async fn test_fetch_respects_limit_and_offset() {
        let log = CappedLog::new("test", 10);
        for n in 0..6 {
            log.append(doc(n)).unwrap();
        }
        let fetched = log.fetch(3, 2).await.unwrap();
        let positions: Vec<u64> = fetched.entries.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![3, 4]);

        let past_end = log.fetch(6, 10).await.unwrap();
        assert!(past_end.entries.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_reads_and_writes() {
        let log = CappedLog::new("test", 10);
        log.append(doc(0)).unwrap();
        log.set_available(false);
        assert!(matches!(log.fetch(0, 1).await, Err(StoreError::Unavailable(_))));
        assert!(matches!(log.append(doc(1)), Err(StoreError::Unavailable(_))));
        log.set_available(true);
        assert_eq!(log.fetch(0, 10).await.unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_append_wakes_on_append() {
        let log = std::sync::Arc::new(CappedLog::new("test", 10));
        let writer = log.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(doc(0)).unwrap();
        });
        let started = std::time::Instant::now();
        log.wait_for_append(0, Duration::from_secs(10)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_checkpoints_per_reader() {
        let log = CappedLog::new("test", 10);
        assert_eq!(log.load_checkpoint("a").await.unwrap(), None);
        log.store_checkpoint("a", 4).await.unwrap();
        log.store_checkpoint("b", 9).await.unwrap();
        assert_eq!(log.load_checkpoint("a").await.unwrap(), Some(4));
        assert_eq!(log.load_checkpoint("b").await.unwrap(), Some(9));
    }
}
