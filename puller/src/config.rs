//! Configuration types for the puller
//!
//! Loaded from an optional TOML file, then overridden by `HWPC__*`
//! environment variables (`HWPC__DISPATCH__QUEUE_CAPACITY=8`).

use crate::error::ConfigError;
use crate::filter::FilterRuleSpec;
use crate::log::{CursorOptions, StartPosition};
use crate::retry::Backoff;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What an overrun does to the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrunPolicy {
    /// Count the missed reports and keep going from the oldest entry
    #[default]
    Warn,
    /// Stop the pipeline as failed
    Fatal,
}

impl std::str::FromStr for OverrunPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "warn" => Ok(OverrunPolicy::Warn),
            "fatal" => Ok(OverrunPolicy::Fatal),
            _ => Err(ConfigError::InvalidSetting {
                setting: "overrun",
                reason: format!("expected warn or fatal, got `{}`", s),
            }),
        }
    }
}

/// Backing store for the report log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local log, lost on exit
    Memory { capacity: usize },
    /// sled database at `path`
    Persistent { path: PathBuf, capacity: usize },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory { capacity: 10_000 }
    }
}

impl StoreConfig {
    pub fn capacity(&self) -> usize {
        match self {
            StoreConfig::Memory { capacity } | StoreConfig::Persistent { capacity, .. } => *capacity,
        }
    }
}

/// Consumer fan-out settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Reports buffered per consumer before dispatch waits
    pub queue_capacity: usize,

    /// Consumer invocations allowed to run at the same time, across all consumers
    pub max_concurrent: usize,

    /// How long one report's dispatch may wait for queue space and results
    pub dispatch_timeout_ms: u64,

    /// How long a single consumer invocation may run
    pub invocation_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            max_concurrent: 16,
            dispatch_timeout_ms: 5_000,
            invocation_timeout_ms: 10_000,
        }
    }
}

impl DispatchConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Reader name, used for checkpoints and log context
    pub name: String,

    /// Where reading starts
    pub start: StartPosition,

    /// Keep tailing at the end of the log (false = stop once caught up)
    pub follow: bool,

    /// Entries fetched per store round-trip
    pub batch_size: usize,

    /// Upper bound on a single wait for new entries, in milliseconds
    pub poll_interval_ms: u64,

    /// Reaction to an overrun
    pub overrun: OverrunPolicy,

    /// Reconnection schedule for store failures
    pub reconnect: Backoff,

    pub dispatch: DispatchConfig,

    /// Grace period for in-flight consumer work on stop, in milliseconds
    pub drain_timeout_ms: u64,

    /// Commit the reader position after every processed entry
    pub checkpoint: bool,

    /// Fold legacy flat rows into this group before validation (None = rows pass through without counters)
    pub legacy_group: Option<String>,

    pub store: StoreConfig,

    /// Declarative filters
    pub filters: Vec<FilterRuleSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "hwpc-puller".to_string(),
            start: StartPosition::Beginning,
            follow: true,
            batch_size: 128,
            poll_interval_ms: 1_000,
            overrun: OverrunPolicy::Warn,
            reconnect: Backoff::default(),
            dispatch: DispatchConfig::default(),
            drain_timeout_ms: 5_000,
            checkpoint: false,
            legacy_group: None,
            store: StoreConfig::default(),
            filters: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Load from an optional TOML file plus `HWPC__*` environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("HWPC")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: PipelineConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn cursor_options(&self) -> CursorOptions {
        CursorOptions {
            batch_size: self.batch_size,
            follow: self.follow,
            poll_interval: self.poll_interval(),
            reconnect: self.reconnect,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(setting: &'static str, reason: &str) -> Result<(), ConfigError> {
            Err(ConfigError::InvalidSetting {
                setting,
                reason: reason.to_string(),
            })
        }

        if self.name.trim().is_empty() {
            return invalid("name", "must not be empty");
        }
        if self.batch_size == 0 {
            return invalid("batch_size", "must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms", "must be greater than 0");
        }
        if self.reconnect.max_attempts == 0 {
            return invalid("reconnect.max_attempts", "must be at least 1");
        }
        if self.dispatch.queue_capacity == 0 {
            return invalid("dispatch.queue_capacity", "must be at least 1");
        }
        if self.dispatch.max_concurrent == 0 {
            return invalid("dispatch.max_concurrent", "must be at least 1");
        }
        if self.dispatch.dispatch_timeout_ms == 0 {
            return invalid("dispatch.dispatch_timeout_ms", "must be greater than 0");
        }
        if self.dispatch.invocation_timeout_ms == 0 {
            return invalid("dispatch.invocation_timeout_ms", "must be greater than 0");
        }
        if self.store.capacity() == 0 {
            return invalid("store.capacity", "must be at least 1");
        }
        if matches!(&self.legacy_group, Some(group) if group.is_empty()) {
            return invalid("legacy_group", "must not be empty when set");
        }

        let mut seen = HashSet::new();
        for spec in &self.filters {
            if spec.name.is_empty() {
                return Err(ConfigError::EmptyFilterName);
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateFilter(spec.name.clone()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{MatchExpr, Pattern};
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.overrun, OverrunPolicy::Warn);
        assert_eq!(config.store.capacity(), 10_000);
    }

    #[test]
    fn test_validation_rejects_zero_settings() {
        let mut config = PipelineConfig::default();
        config.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting { setting: "batch_size", .. })
        ));

        let mut config = PipelineConfig::default();
        config.dispatch.queue_capacity = 0;
        assert_err!(config.validate());

        let mut config = PipelineConfig::default();
        config.store = StoreConfig::Memory { capacity: 0 };
        assert_err!(config.validate());
    }

    #[test]
    fn test_validation_rejects_duplicate_filters() {
        let mut config = PipelineConfig::default();
        let spec = FilterRuleSpec {
            name: "sensor1".into(),
            expr: MatchExpr::sensor(Pattern::exact("sensor1")),
        };
        config.filters = vec![spec.clone(), spec];
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateFilter("sensor1".into()))
        );
    }

    #[test]
    fn test_overrun_policy_from_str() {
        assert_eq!("WARN".parse::<OverrunPolicy>().unwrap(), OverrunPolicy::Warn);
        assert_eq!("fatal".parse::<OverrunPolicy>().unwrap(), OverrunPolicy::Fatal);
        assert_err!("ignore".parse::<OverrunPolicy>());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
name = "bench"
start = "at:3"
follow = false
overrun = "fatal"
legacy_group = "rapl"

[dispatch]
queue_capacity = 4

[store]
type = "memory"
capacity = 50

[[filters]]
name = "s1"
sensor = "sensor_test1"

[[filters]]
name = "sockets"
sensor = ["sensor_a", "sensor_b*"]
target = "system"
"#
        )
        .unwrap();

        let config = assert_ok!(PipelineConfig::load(Some(file.path())));
        assert_eq!(config.name, "bench");
        assert_eq!(config.start, StartPosition::At(3));
        assert!(!config.follow);
        assert_eq!(config.overrun, OverrunPolicy::Fatal);
        assert_eq!(config.legacy_group.as_deref(), Some("rapl"));
        assert_eq!(config.dispatch.queue_capacity, 4);
        assert_eq!(config.dispatch.max_concurrent, 16);
        assert_eq!(config.store, StoreConfig::Memory { capacity: 50 });
        assert_eq!(config.filters.len(), 2);
        assert!(config.filters[1].expr.matches("sensor_b7", "system"));
        assert!(!config.filters[1].expr.matches("sensor_b7", "app"));
    }
}
