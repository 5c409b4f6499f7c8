//! The puller pipeline: tail the log, validate, route, dispatch.

pub mod coordinator;
pub mod dispatch;
pub mod events;
pub mod state;
pub mod stats;

pub use coordinator::{Pipeline, PipelineSummary, RunningPipeline};
pub use dispatch::{ConsumerInvocationResult, Dispatcher, InvocationOutcome};
pub use events::{ErrorSink, PipelineEvent, Recorder, TracingSink};
pub use state::PipelineState;
pub use stats::{PipelineStats, StatsSnapshot};
