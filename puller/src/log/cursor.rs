//! Tailing cursor over a [`ReportLog`]

use super::{LogEntry, ReportLog, StartPosition};
use crate::error::{ConfigError, ReaderError};
use crate::metrics;
use crate::retry::{retry_with_backoff, Backoff, RetryError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How a cursor reads
#[derive(Debug, Clone)]
pub struct CursorOptions {
    /// Entries fetched per store round-trip
    pub batch_size: usize,
    /// Keep waiting for appends at the end of the log instead of finishing
    pub follow: bool,
    /// Upper bound on a single wait for new entries
    pub poll_interval: Duration,
    /// Reconnection schedule for failing store reads
    pub reconnect: Backoff,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            batch_size: 128,
            follow: true,
            poll_interval: Duration::from_secs(1),
            reconnect: Backoff::default(),
        }
    }
}

/// Reads a log in position order, one entry at a time.
///
/// Entries are fetched in batches and handed out from a local buffer. If the
/// store evicted the cursor's position before it got there, [`Cursor::next`]
/// reports the overrun once and continues from the oldest surviving entry.
pub struct Cursor {
    log: Arc<dyn ReportLog>,
    position: u64,
    buffer: VecDeque<LogEntry>,
    options: CursorOptions,
}

impl Cursor {
    /// Resolve `start` against the log and open a cursor there.
    pub async fn open(
        log: Arc<dyn ReportLog>,
        start: StartPosition,
        reader: &str,
        options: CursorOptions,
    ) -> Result<Self, ConfigError> {
        let bounds = log.bounds().await.map_err(ConfigError::Store)?;
        let position = match start {
            StartPosition::Beginning => bounds.oldest,
            StartPosition::Latest => bounds.next,
            StartPosition::At(requested) => {
                if requested > bounds.next {
                    return Err(ConfigError::InvalidStartPosition {
                        requested,
                        next: bounds.next,
                    });
                }
                requested
            }
            StartPosition::Checkpoint => match log.load_checkpoint(reader).await.map_err(ConfigError::Store)? {
                Some(saved) if saved > bounds.next => {
                    return Err(ConfigError::InvalidStartPosition {
                        requested: saved,
                        next: bounds.next,
                    })
                }
                Some(saved) => saved,
                None => bounds.oldest,
            },
        };

        info!(
            log = log.name(),
            %start,
            position,
            oldest = bounds.oldest,
            next = bounds.next,
            "Cursor opened"
        );

        Ok(Self {
            log,
            position,
            buffer: VecDeque::new(),
            options,
        })
    }

    /// Position of the next entry this cursor will return
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Next entry in position order.
    ///
    /// Returns `Ok(None)` once `cancel` fires, or at the end of the log when
    /// not following. Store failures are retried with backoff; when every
    /// attempt fails the cursor gives up with [`ReaderError::StoreUnavailable`].
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<LogEntry>, ReaderError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(entry) = self.buffer.pop_front() {
                self.position = entry.position + 1;
                metrics::DOCUMENTS_READ.inc();
                return Ok(Some(entry));
            }

            let from = self.position;
            let limit = self.options.batch_size.max(1);
            let log = &self.log;
            let fetched = retry_with_backoff("log fetch", &self.options.reconnect, cancel, || async move {
                let result = log.fetch(from, limit).await;
                if result.is_err() {
                    metrics::STORE_RETRIES.inc();
                }
                result
            })
            .await;

            let fetched = match fetched {
                Ok(fetched) => fetched,
                Err(RetryError::Cancelled) => return Ok(None),
                Err(RetryError::Exhausted { attempts, last }) => {
                    return Err(ReaderError::StoreUnavailable {
                        attempts,
                        position: from,
                        last_error: last,
                    })
                }
            };

            if fetched.bounds.oldest > from {
                let missed = fetched.bounds.oldest - from;
                self.position = fetched.bounds.oldest;
                self.buffer.extend(fetched.entries);
                metrics::OVERRUN_MISSED.inc_by(missed as f64);
                return Err(ReaderError::Overrun {
                    expected: from,
                    oldest: fetched.bounds.oldest,
                    missed,
                });
            }

            if fetched.entries.is_empty() {
                if !self.options.follow {
                    debug!(position = from, "Reached end of log");
                    return Ok(None);
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = self.log.wait_for_append(from, self.options.poll_interval) => {}
                }
                continue;
            }

            self.buffer.extend(fetched.entries);
        }
    }

    /// Commit `reader`'s checkpoint and return the committed position.
    ///
    /// `unfinished` is the lowest position whose reports are still owed to a
    /// consumer; the checkpoint never moves past it.
    pub async fn commit(
        &self,
        reader: &str,
        unfinished: Option<u64>,
    ) -> Result<u64, crate::error::StoreError> {
        let position = unfinished.map_or(self.position, |p| p.min(self.position));
        self.log.store_checkpoint(reader, position).await?;
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::log::CappedLog;
    use serde_json::json;

    fn options(follow: bool) -> CursorOptions {
        CursorOptions {
            batch_size: 2,
            follow,
            poll_interval: Duration::from_millis(10),
            reconnect: Backoff {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 2,
            },
        }
    }

    fn filled(capacity: usize, count: u64) -> Arc<CappedLog> {
        let log = Arc::new(CappedLog::new("test", capacity));
        for n in 0..count {
            log.append(json!({ "n": n })).unwrap();
        }
        log
    }

    async fn drain(cursor: &mut Cursor) -> Vec<u64> {
        let cancel = CancellationToken::new();
        let mut positions = Vec::new();
        while let Some(entry) = cursor.next(&cancel).await.unwrap() {
            positions.push(entry.position);
        }
        positions
    }

    #[tokio::test]
    async fn test_reads_in_order_and_stops_at_end() {
        let log = filled(10, 5);
        let mut cursor = Cursor::open(log, StartPosition::Beginning, "r", options(false))
            .await
            .unwrap();
        assert_eq!(drain(&mut cursor).await, vec![0, 1, 2, 3, 4]);
        assert_eq!(cursor.position(), 5);
    }

    #[tokio::test]
    async fn test_start_positions() {
        let log = filled(10, 5);
        let mut latest = Cursor::open(log.clone(), StartPosition::Latest, "r", options(false))
            .await
            .unwrap();
        assert!(drain(&mut latest).await.is_empty());

        let mut at = Cursor::open(log.clone(), StartPosition::At(3), "r", options(false))
            .await
            .unwrap();
        assert_eq!(drain(&mut at).await, vec![3, 4]);

        let err = Cursor::open(log, StartPosition::At(6), "r", options(false)).await;
        assert!(matches!(
            err,
            Err(ConfigError::InvalidStartPosition { requested: 6, next: 5 })
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_start() {
        let log = filled(10, 5);
        let mut first = Cursor::open(log.clone(), StartPosition::Checkpoint, "r", options(false))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        first.next(&cancel).await.unwrap();
        first.next(&cancel).await.unwrap();
        assert_eq!(first.commit("r", None).await.unwrap(), 2);

        let mut resumed = Cursor::open(log, StartPosition::Checkpoint, "r", options(false))
            .await
            .unwrap();
        assert_eq!(drain(&mut resumed).await, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_commit_holds_back_at_unfinished_position() {
        let log = filled(10, 5);
        let mut cursor = Cursor::open(log.clone(), StartPosition::Beginning, "r", options(false))
            .await
            .unwrap();
        assert_eq!(drain(&mut cursor).await, vec![0, 1, 2, 3, 4]);

        assert_eq!(cursor.commit("r", Some(1)).await.unwrap(), 1);
        assert_eq!(log.load_checkpoint("r").await.unwrap(), Some(1));
        // A bound past the cursor cannot skip unread entries.
        assert_eq!(cursor.commit("r", Some(9)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_overrun_reported_once() {
        let log = filled(3, 3);
        let mut cursor = Cursor::open(log.clone(), StartPosition::Beginning, "r", options(false))
            .await
            .unwrap();
        for n in 3..8 {
            log.append(json!({ "n": n })).unwrap();
        }

        let cancel = CancellationToken::new();
        let err = cursor.next(&cancel).await.unwrap_err();
        assert_eq!(
            err,
            ReaderError::Overrun {
                expected: 0,
                oldest: 5,
                missed: 5
            }
        );
        assert_eq!(drain(&mut cursor).await, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn test_store_outage_exhausts_retries() {
        let log = filled(10, 1);
        let mut cursor = Cursor::open(log.clone(), StartPosition::Beginning, "r", options(true))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(cursor.next(&cancel).await.unwrap().unwrap().position, 0);

        log.set_available(false);
        let err = cursor.next(&cancel).await.unwrap_err();
        match err {
            ReaderError::StoreUnavailable {
                attempts,
                position,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(position, 1);
                assert!(matches!(last_error, StoreError::Unavailable(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_follow_waits_for_append_and_cancels() {
        let log = filled(10, 0);
        let mut cursor = Cursor::open(log.clone(), StartPosition::Beginning, "r", options(true))
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.append(json!({ "n": 0 })).unwrap();
        });
        let entry = cursor.next(&cancel).await.unwrap().unwrap();
        assert_eq!(entry.position, 0);

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            stopper.cancel();
        });
        assert!(cursor.next(&cancel).await.unwrap().is_none());
    }
}
