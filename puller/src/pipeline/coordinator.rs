//! Runs the read, validate, route, dispatch loop as one task

use super::dispatch::{Dispatcher, InvocationOutcome};
use super::events::{ErrorSink, PipelineEvent, Recorder, TracingSink};
use super::state::PipelineState;
use super::stats::{PipelineStats, StatsSnapshot};
use crate::config::{OverrunPolicy, PipelineConfig};
use crate::error::{ConfigError, PipelineError, ReaderError};
use crate::filter::{FilterRegistry, FilterRule};
use crate::log::{Cursor, LogEntry, ReportLog};
use hwpc_shared::{migrate_flat_document, validate, HwpcReport};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Final account of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSummary {
    pub state: PipelineState,
    /// Position of the next unread entry
    pub position: u64,
    pub stats: StatsSnapshot,
}

/// A configured, not yet started pipeline
pub struct Pipeline {
    config: PipelineConfig,
    log: Arc<dyn ReportLog>,
    registry: Arc<FilterRegistry>,
    sink: Arc<dyn ErrorSink>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, log: Arc<dyn ReportLog>, registry: Arc<FilterRegistry>) -> Self {
        Self {
            config,
            log,
            registry,
            sink: Arc::new(TracingSink),
            stats: Arc::new(PipelineStats::new()),
        }
    }

    /// Replace the default tracing sink for error events
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Validate the setup, open the cursor and spawn the pipeline task.
    ///
    /// Setup problems are returned here; nothing is read in that case.
    pub async fn start(self) -> Result<RunningPipeline, PipelineError> {
        let recorder = Recorder::new(self.stats.clone(), self.sink.clone());
        let reject = |err: ConfigError| {
            recorder.record(PipelineEvent::Misconfigured(err.clone()));
            PipelineError::Config(err)
        };

        self.config.validate().map_err(reject)?;
        if self.registry.is_empty() {
            return Err(reject(ConfigError::NoFilters));
        }
        let cursor = Cursor::open(
            self.log.clone(),
            self.config.start,
            &self.config.name,
            self.config.cursor_options(),
        )
        .await
        .map_err(reject)?;

        let (state_tx, state_rx) = watch::channel(PipelineState::Created);
        transition(&state_tx, PipelineState::Running);
        info!(
            pipeline = %self.config.name,
            log = self.log.name(),
            filters = self.registry.len(),
            position = cursor.position(),
            "Pipeline started"
        );

        let stop = CancellationToken::new();
        let task = PipelineTask {
            dispatcher: Dispatcher::new(self.config.dispatch.clone(), recorder.clone()),
            config: self.config,
            registry: self.registry.clone(),
            recorder,
            stats: self.stats.clone(),
            cursor,
            stop: stop.clone(),
            state: state_tx,
            rules: None,
        };

        Ok(RunningPipeline {
            join: tokio::spawn(task.run()),
            state: state_rx,
            stop,
            stats: self.stats,
            registry: self.registry,
        })
    }
}

fn transition(state: &watch::Sender<PipelineState>, next: PipelineState) {
    let current = *state.borrow();
    if current.can_transition_to(next) {
        debug!(from = %current, to = %next, "Pipeline state change");
        state.send_replace(next);
    } else {
        warn!(from = %current, to = %next, "Ignoring invalid pipeline state change");
    }
}

/// Handle to a started pipeline
pub struct RunningPipeline {
    join: JoinHandle<Result<PipelineSummary, PipelineError>>,
    state: watch::Receiver<PipelineState>,
    stop: CancellationToken,
    stats: Arc<PipelineStats>,
    registry: Arc<FilterRegistry>,
}

impl RunningPipeline {
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Wait until the pipeline reaches `target` or a terminal state
    pub async fn wait_for_state(&mut self, target: PipelineState) -> PipelineState {
        loop {
            let current = *self.state.borrow_and_update();
            if current == target || current.is_terminal() {
                return current;
            }
            if self.state.changed().await.is_err() {
                return *self.state.borrow();
            }
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Filters can be added or removed while running
    pub fn registry(&self) -> &Arc<FilterRegistry> {
        &self.registry
    }

    /// Token that stops the pipeline when cancelled
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Ask the pipeline to stop. Idempotent; use [`RunningPipeline::wait`] to join.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait for the pipeline task to end
    pub async fn wait(self) -> Result<PipelineSummary, PipelineError> {
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(PipelineError::Aborted(err.to_string())),
        }
    }

    /// Stop, then wait
    pub async fn shutdown(self) -> Result<PipelineSummary, PipelineError> {
        self.stop();
        self.wait().await
    }
}

struct PipelineTask {
    config: PipelineConfig,
    registry: Arc<FilterRegistry>,
    dispatcher: Dispatcher,
    recorder: Recorder,
    stats: Arc<PipelineStats>,
    cursor: Cursor,
    stop: CancellationToken,
    state: watch::Sender<PipelineState>,
    // Rule list the dispatcher's workers were last matched against.
    rules: Option<Arc<[Arc<FilterRule>]>>,
}

impl PipelineTask {
    async fn run(mut self) -> Result<PipelineSummary, PipelineError> {
        let failure = loop {
            let entry = match self.cursor.next(&self.stop).await {
                Ok(Some(entry)) => entry,
                Ok(None) => break None,
                Err(ReaderError::Overrun {
                    expected,
                    oldest,
                    missed,
                }) => {
                    self.stats.record_overrun(missed);
                    self.recorder.record(PipelineEvent::Overrun {
                        expected,
                        oldest,
                        missed,
                    });
                    if self.config.overrun == OverrunPolicy::Fatal {
                        break Some(ReaderError::Overrun {
                            expected,
                            oldest,
                            missed,
                        });
                    }
                    continue;
                }
                Err(err) => break Some(err),
            };

            self.retire_removed_consumers();
            self.process(entry).await;
            self.checkpoint().await;
        };

        let position = self.cursor.position();
        match failure {
            None => {
                transition(&self.state, PipelineState::Draining);
                info!(pipeline = %self.config.name, position, "Pipeline draining");
                self.drain().await;
                self.checkpoint().await;
                transition(&self.state, PipelineState::Stopped);
                info!(pipeline = %self.config.name, position, "Pipeline stopped");
                Ok(self.summary(PipelineState::Stopped))
            }
            Some(cause) => {
                self.recorder.record(PipelineEvent::Failed {
                    position,
                    cause: cause.clone(),
                });
                self.drain().await;
                self.checkpoint().await;
                transition(&self.state, PipelineState::Failed);
                Err(PipelineError::Failed { position, cause })
            }
        }
    }

    async fn process(&self, entry: LogEntry) {
        self.stats.record_read();
        let position = entry.position;

        let document = match &self.config.legacy_group {
            Some(group) => migrate_flat_document(group, &entry.document),
            None => Ok(entry.document),
        };
        let report = match document.and_then(|doc| validate(&doc)) {
            Ok(report) => Arc::new(report),
            Err(error) => {
                self.recorder.record(PipelineEvent::Rejected { position, error });
                return;
            }
        };
        self.stats.record_accepted();

        let plan = self.registry.route(&report);
        if plan.is_unmatched() {
            self.stats.record_unmatched();
            debug!(position, sensor = %report.sensor, target = %report.target, "No filter matched");
            return;
        }
        self.stats.record_routed();

        let results = self
            .dispatcher
            .dispatch(&plan, &report, position, &self.stop)
            .await;
        let pending = results
            .iter()
            .filter(|r| r.outcome == InvocationOutcome::Pending)
            .count();
        if pending > 0 {
            debug!(position, pending, "Dispatch returned with invocations still running");
        }
        log_report(position, &report, plan.matched.len());
    }

    /// Stop workers whose consumer left the registry since the last entry
    fn retire_removed_consumers(&mut self) {
        let current = self.registry.snapshot();
        let changed = self
            .rules
            .as_ref()
            .map_or(true, |seen| !Arc::ptr_eq(seen, &current));
        if changed {
            self.dispatcher.retain_consumers(&current);
            self.rules = Some(current);
        }
    }

    /// Persist the reader position, held back at the oldest report a
    /// consumer has not finished with
    async fn checkpoint(&self) {
        if !self.config.checkpoint {
            return;
        }
        let unfinished = self.dispatcher.lowest_unfinished();
        match self.cursor.commit(&self.config.name, unfinished).await {
            Ok(committed) if committed < self.cursor.position() => {
                debug!(committed, position = self.cursor.position(), "Checkpoint held back by unfinished deliveries")
            }
            Ok(_) => {}
            Err(e) => warn!(position = self.cursor.position(), error = %e, "Checkpoint write failed"),
        }
    }

    async fn drain(&self) {
        let abandoned = self.dispatcher.shutdown(self.config.drain_timeout()).await as u64;
        if abandoned > 0 {
            self.stats.record_abandoned(abandoned);
            self.recorder.record(PipelineEvent::Abandoned {
                invocations: abandoned,
            });
        }
    }

    fn summary(&self, state: PipelineState) -> PipelineSummary {
        PipelineSummary {
            state,
            position: self.cursor.position(),
            stats: self.stats.snapshot(),
        }
    }
}

fn log_report(position: u64, report: &HwpcReport, filters: usize) {
    debug!(
        position,
        sensor = %report.sensor,
        target = %report.target,
        filters,
        "Report routed"
    );
}
