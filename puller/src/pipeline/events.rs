//! Error events raised while the pipeline runs.
//!
//! Every event is counted in [`PipelineStats`] and handed to an
//! [`ErrorSink`]. The default sink emits it via `tracing` on a dedicated
//! target so operators can route or filter it separately.

use super::stats::PipelineStats;
use crate::error::{ConfigError, ConsumerError, ErrorKind, ReaderError, ValidationError};
use std::sync::Arc;
use tracing::{error, warn};

const EVENT_TARGET: &str = "hwpc::events";

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A document failed validation and was skipped
    Rejected { position: u64, error: ValidationError },

    /// The reader fell behind the log and lost reports
    Overrun { expected: u64, oldest: u64, missed: u64 },

    /// One consumer invocation failed; others were unaffected
    ConsumerFailed {
        filter: String,
        consumer: String,
        error: ConsumerError,
    },

    /// The pipeline could not start
    Misconfigured(ConfigError),

    /// The pipeline stopped on a fatal reader condition
    Failed { position: u64, cause: ReaderError },

    /// Invocations still running when the drain timeout expired
    Abandoned { invocations: u64 },
}

impl PipelineEvent {
    /// Counter this event bumps, if any
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            PipelineEvent::Rejected { .. } => Some(ErrorKind::Validation),
            PipelineEvent::Overrun { .. } => Some(ErrorKind::Overrun),
            PipelineEvent::ConsumerFailed { .. } => Some(ErrorKind::Consumer),
            PipelineEvent::Misconfigured(_) => Some(ErrorKind::Configuration),
            PipelineEvent::Failed {
                cause: ReaderError::StoreUnavailable { .. },
                ..
            } => Some(ErrorKind::StoreUnavailable),
            // The overrun itself was already counted.
            PipelineEvent::Failed { .. } => None,
            PipelineEvent::Abandoned { .. } => None,
        }
    }
}

/// Receives every error event. Must not block.
pub trait ErrorSink: Send + Sync {
    fn record(&self, event: &PipelineEvent);
}

/// Emits events as structured log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn record(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::Rejected { position, error } => warn!(
                target: EVENT_TARGET,
                event = "report_rejected",
                position = *position,
                error = %error,
            ),
            PipelineEvent::Overrun {
                expected,
                oldest,
                missed,
            } => warn!(
                target: EVENT_TARGET,
                event = "overrun",
                expected = *expected,
                oldest = *oldest,
                missed = *missed,
            ),
            PipelineEvent::ConsumerFailed {
                filter,
                consumer,
                error,
            } => warn!(
                target: EVENT_TARGET,
                event = "consumer_failed",
                filter = %filter,
                consumer = %consumer,
                error = %error,
            ),
            PipelineEvent::Misconfigured(err) => error!(
                target: EVENT_TARGET,
                event = "misconfigured",
                error = %err,
            ),
            PipelineEvent::Failed { position, cause } => error!(
                target: EVENT_TARGET,
                event = "pipeline_failed",
                position = *position,
                cause = %cause,
            ),
            PipelineEvent::Abandoned { invocations } => warn!(
                target: EVENT_TARGET,
                event = "invocations_abandoned",
                invocations = *invocations,
            ),
        }
    }
}

/// Counts an event, then forwards it to the sink
#[derive(Clone)]
pub struct Recorder {
    stats: Arc<PipelineStats>,
    sink: Arc<dyn ErrorSink>,
}

impl Recorder {
    pub fn new(stats: Arc<PipelineStats>, sink: Arc<dyn ErrorSink>) -> Self {
        Self { stats, sink }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn record(&self, event: PipelineEvent) {
        if let Some(kind) = event.kind() {
            self.stats.record_error(kind);
        }
        self.sink.record(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<PipelineEvent>>);

    impl ErrorSink for Collect {
        fn record(&self, event: &PipelineEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_recorder_counts_and_forwards() {
        let stats = Arc::new(PipelineStats::new());
        let sink = Arc::new(Collect::default());
        let recorder = Recorder::new(stats.clone(), sink.clone());

        recorder.record(PipelineEvent::Rejected {
            position: 3,
            error: ValidationError::MissingField("sensor"),
        });
        recorder.record(PipelineEvent::ConsumerFailed {
            filter: "f".into(),
            consumer: "c".into(),
            error: ConsumerError::Panicked,
        });
        recorder.record(PipelineEvent::Abandoned { invocations: 2 });

        assert_eq!(stats.errors(ErrorKind::Validation), 1);
        assert_eq!(stats.errors(ErrorKind::Consumer), 1);
        assert_eq!(sink.0.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_failed_event_kind_depends_on_cause() {
        let overrun = PipelineEvent::Failed {
            position: 0,
            cause: ReaderError::Overrun {
                expected: 0,
                oldest: 1,
                missed: 1,
            },
        };
        assert_eq!(overrun.kind(), None);
        assert_eq!(EVENT_TARGET, "hwpc::events");
    }
}
