//! Consumers: the receiving end of a filter

use crate::error::ConsumerError;
use async_trait::async_trait;
use hwpc_shared::HwpcReport;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Receives reports accepted by a filter.
///
/// A consumer attached to several filters (or several times) is one
/// consumer: it sees each report in log order through a single queue.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// Name used in logs, metrics and failure events
    fn name(&self) -> &str;

    async fn consume(&self, report: Arc<HwpcReport>) -> Result<(), ConsumerError>;
}

/// Consumer built from an async closure
pub struct FnConsumer<F> {
    name: String,
    f: F,
}

impl<F> FnConsumer<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F, Fut> Consumer for FnConsumer<F>
where
    F: Fn(Arc<HwpcReport>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ConsumerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume(&self, report: Arc<HwpcReport>) -> Result<(), ConsumerError> {
        (self.f)(report).await
    }
}

/// Shorthand for an `Arc<dyn Consumer>` around a closure
pub fn consumer_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn Consumer>
where
    F: Fn(Arc<HwpcReport>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ConsumerError>> + Send + 'static,
{
    Arc::new(FnConsumer::new(name, f))
}

/// Writes one structured log line per report. Used by the binary.
#[derive(Debug, Clone)]
pub struct LoggingConsumer {
    name: String,
}

impl LoggingConsumer {
    pub fn new(filter: &str) -> Self {
        Self {
            name: format!("{}-log", filter),
        }
    }
}

#[async_trait]
impl Consumer for LoggingConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume(&self, report: Arc<HwpcReport>) -> Result<(), ConsumerError> {
        info!(
            target: "hwpc::reports",
            consumer = %self.name,
            sensor = %report.sensor,
            target_name = %report.target,
            timestamp = %report.timestamp,
            groups = report.groups.len(),
            counters = report.counter_count(),
            "Report"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn report() -> Arc<HwpcReport> {
        let ts = DateTime::<Utc>::from_timestamp_millis(0).unwrap();
        Arc::new(HwpcReport::new(ts, "sensor", "system"))
    }

    #[tokio::test]
    async fn test_fn_consumer_invokes_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let consumer = consumer_fn("counter", move |_report| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        assert_eq!(consumer.name(), "counter");
        consumer.consume(report()).await.unwrap();
        consumer.consume(report()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_logging_consumer_accepts_everything() {
        let consumer = LoggingConsumer::new("sensor1");
        assert_eq!(consumer.name(), "sensor1-log");
        assert!(consumer.consume(report()).await.is_ok());
    }
}
