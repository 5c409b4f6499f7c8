//! HWPC report puller
//!
//! Tails a capped log of hardware performance counter reports, validates
//! each document into an [`HwpcReport`](hwpc_shared::HwpcReport), routes it
//! through named filters and hands it to the filters' consumers.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hwpc_puller::{CappedLog, FilterRegistry, FilterRule, LoggingConsumer, Pipeline, PipelineConfig, Predicate};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let log = Arc::new(CappedLog::new("reports", 10_000));
//! let registry = Arc::new(FilterRegistry::new());
//! registry.register(
//!     FilterRule::new("sensor1")
//!         .with_predicate(Predicate::sensor_is("sensor1"))
//!         .with_consumer(Arc::new(LoggingConsumer::new("sensor1"))),
//! )?;
//!
//! let running = Pipeline::new(PipelineConfig::default(), log, registry).start().await?;
//! let summary = running.shutdown().await?;
//! println!("{} reports routed", summary.stats.reports_routed);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod log;
pub mod metrics;
pub mod pipeline;
pub mod retry;

pub use config::{DispatchConfig, OverrunPolicy, PipelineConfig, StoreConfig};
pub use error::{ConfigError, ConsumerError, ErrorKind, PipelineError, ReaderError, StoreError};
pub use filter::{
    consumer_fn, Consumer, FilterRegistry, FilterRule, FilterRuleSpec, LoggingConsumer, MatchExpr, Pattern,
    Predicate,
};
pub use log::{CappedLog, Cursor, LogEntry, PersistentCappedLog, ReportLog, StartPosition, Store};
pub use pipeline::{
    ConsumerInvocationResult, ErrorSink, InvocationOutcome, Pipeline, PipelineEvent, PipelineState,
    PipelineSummary, RunningPipeline, StatsSnapshot,
};
