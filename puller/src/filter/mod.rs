//! Named filters and the registry that routes reports through them.
//!
//! A filter is a predicate on `(sensor, target)` plus the consumers that
//! receive accepted reports. Routing evaluates every filter in registration
//! order, so one report can reach several filters. Registration swaps in a
//! new rule list; routing works on whatever list was current when it began.

pub mod consumer;
pub mod predicate;

pub use consumer::{consumer_fn, Consumer, FnConsumer, LoggingConsumer};
pub use predicate::{MatchExpr, Pattern, Predicate};

use crate::error::ConfigError;
use hwpc_shared::HwpcReport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// A named predicate with its consumers
pub struct FilterRule {
    name: Arc<str>,
    predicate: Option<Predicate>,
    consumers: Vec<Arc<dyn Consumer>>,
}

impl FilterRule {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            predicate: None,
            consumers: Vec::new(),
        }
    }

    pub fn with_predicate(mut self, predicate: impl Into<Predicate>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    /// Attach a consumer. Order of attachment is the order of delivery.
    pub fn with_consumer(mut self, consumer: Arc<dyn Consumer>) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consumers(&self) -> &[Arc<dyn Consumer>] {
        &self.consumers
    }

    pub fn accepts(&self, sensor: &str, target: &str) -> bool {
        self.predicate
            .as_ref()
            .map_or(false, |p| p.evaluate(sensor, target))
    }
}

impl fmt::Debug for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let consumers: Vec<&str> = self.consumers.iter().map(|c| c.name()).collect();
        f.debug_struct("FilterRule")
            .field("name", &self.name)
            .field("predicate", &self.predicate)
            .field("consumers", &consumers)
            .finish()
    }
}

/// Filter definition as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRuleSpec {
    pub name: String,
    #[serde(flatten)]
    pub expr: MatchExpr,
}

impl FilterRuleSpec {
    /// Rule with this spec's predicate and no consumers yet
    pub fn to_rule(&self) -> FilterRule {
        FilterRule::new(&self.name).with_predicate(self.expr.clone())
    }
}

/// One consumer invocation a report needs
#[derive(Clone)]
pub struct Delivery {
    pub filter: Arc<str>,
    pub consumer: Arc<dyn Consumer>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("filter", &self.filter)
            .field("consumer", &self.consumer.name())
            .finish()
    }
}

/// Result of routing one report: which filters matched, and the
/// deliveries owed, in filter then consumer order
#[derive(Debug, Clone, Default)]
pub struct RoutePlan {
    pub matched: Vec<Arc<str>>,
    pub deliveries: Vec<Delivery>,
}

impl RoutePlan {
    pub fn is_unmatched(&self) -> bool {
        self.matched.is_empty()
    }
}

/// Ordered set of filters, safe to change while reports are being routed
pub struct FilterRegistry {
    rules: RwLock<Arc<[Arc<FilterRule>]>>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Build a registry from configured specs, attaching the consumers
    /// `consumers_for` returns for each.
    pub fn from_specs<F>(specs: &[FilterRuleSpec], mut consumers_for: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&FilterRuleSpec) -> Vec<Arc<dyn Consumer>>,
    {
        let registry = Self::new();
        for spec in specs {
            let rule = consumers_for(spec)
                .into_iter()
                .fold(spec.to_rule(), FilterRule::with_consumer);
            registry.register(rule)?;
        }
        Ok(registry)
    }

    /// Add a filter at the end of the routing order.
    pub fn register(&self, rule: FilterRule) -> Result<(), ConfigError> {
        if rule.name.is_empty() {
            return Err(ConfigError::EmptyFilterName);
        }
        if rule.predicate.is_none() {
            return Err(ConfigError::MissingPredicate(rule.name.to_string()));
        }

        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        if rules.iter().any(|r| r.name == rule.name) {
            return Err(ConfigError::DuplicateFilter(rule.name.to_string()));
        }

        info!(filter = %rule.name, consumers = rule.consumers.len(), "Filter registered");
        let mut next: Vec<Arc<FilterRule>> = rules.iter().cloned().collect();
        next.push(Arc::new(rule));
        *rules = Arc::from(next);
        Ok(())
    }

    /// Remove a filter. Returns false if no filter has that name.
    pub fn unregister(&self, name: &str) -> bool {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        if !rules.iter().any(|r| &*r.name == name) {
            return false;
        }
        let next: Vec<Arc<FilterRule>> = rules.iter().filter(|r| &*r.name != name).cloned().collect();
        *rules = Arc::from(next);
        info!(filter = name, "Filter unregistered");
        true
    }

    /// The current rule list
    pub fn snapshot(&self) -> Arc<[Arc<FilterRule>]> {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|r| r.name.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate every filter against `report`, in registration order.
    pub fn route(&self, report: &HwpcReport) -> RoutePlan {
        let rules = self.snapshot();
        let mut plan = RoutePlan::default();
        for rule in rules.iter() {
            if !rule.accepts(&report.sensor, &report.target) {
                continue;
            }
            plan.matched.push(rule.name.clone());
            for consumer in &rule.consumers {
                plan.deliveries.push(Delivery {
                    filter: rule.name.clone(),
                    consumer: consumer.clone(),
                });
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn noop(name: &str) -> Arc<dyn Consumer> {
        consumer_fn(name, |_report| async { Ok(()) })
    }

    fn report(sensor: &str, target: &str) -> HwpcReport {
        let ts = DateTime::<Utc>::from_timestamp_millis(1_000).unwrap();
        HwpcReport::new(ts, sensor, target)
    }

    fn delivered(plan: &RoutePlan) -> Vec<(String, String)> {
        plan.deliveries
            .iter()
            .map(|d| (d.filter.to_string(), d.consumer.name().to_string()))
            .collect()
    }

    #[test]
    fn test_register_rejects_bad_rules() {
        let registry = FilterRegistry::new();
        assert_eq!(
            registry.register(FilterRule::new("").with_predicate(Predicate::always())),
            Err(ConfigError::EmptyFilterName)
        );
        assert_eq!(
            registry.register(FilterRule::new("f")),
            Err(ConfigError::MissingPredicate("f".into()))
        );
        registry
            .register(FilterRule::new("f").with_predicate(Predicate::always()))
            .unwrap();
        assert_eq!(
            registry.register(FilterRule::new("f").with_predicate(Predicate::always())),
            Err(ConfigError::DuplicateFilter("f".into()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_route_fans_out_in_registration_order() {
        let registry = FilterRegistry::new();
        registry
            .register(
                FilterRule::new("r1")
                    .with_predicate(Predicate::sensor_is("s1"))
                    .with_consumer(noop("c1")),
            )
            .unwrap();
        registry
            .register(
                FilterRule::new("r2")
                    .with_predicate(Predicate::target_is("system"))
                    .with_consumer(noop("c2"))
                    .with_consumer(noop("c3")),
            )
            .unwrap();

        let plan = registry.route(&report("s1", "system"));
        assert_eq!(
            delivered(&plan),
            vec![
                ("r1".into(), "c1".into()),
                ("r2".into(), "c2".into()),
                ("r2".into(), "c3".into())
            ]
        );

        let plan = registry.route(&report("s1", "app"));
        assert_eq!(delivered(&plan), vec![("r1".into(), "c1".into())]);

        let plan = registry.route(&report("s2", "app"));
        assert!(plan.is_unmatched());
        assert!(plan.deliveries.is_empty());
    }

    #[test]
    fn test_matched_filter_without_consumers_is_not_unmatched() {
        let registry = FilterRegistry::new();
        registry
            .register(FilterRule::new("quiet").with_predicate(Predicate::always()))
            .unwrap();
        let plan = registry.route(&report("s", "t"));
        assert!(!plan.is_unmatched());
        assert!(plan.deliveries.is_empty());
    }

    #[test]
    fn test_unregister_does_not_disturb_snapshot() {
        let registry = FilterRegistry::new();
        registry
            .register(FilterRule::new("a").with_predicate(Predicate::always()))
            .unwrap();
        registry
            .register(FilterRule::new("b").with_predicate(Predicate::always()))
            .unwrap();

        let before = registry.snapshot();
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert_eq!(before.len(), 2);
        assert_eq!(registry.names(), vec!["b".to_string()]);
    }

    #[test]
    fn test_from_specs_attaches_consumers() {
        let specs: Vec<FilterRuleSpec> = serde_json::from_str(
            r#"[{"name": "a", "sensor": "s1"}, {"name": "b", "target": "system"}]"#,
        )
        .unwrap();
        let registry = FilterRegistry::from_specs(&specs, |spec| vec![noop(&format!("{}-c", spec.name))]).unwrap();
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        let plan = registry.route(&report("s1", "system"));
        assert_eq!(
            delivered(&plan),
            vec![("a".into(), "a-c".into()), ("b".into(), "b-c".into())]
        );

        let dup = vec![specs[0].clone(), specs[0].clone()];
        assert!(matches!(
            FilterRegistry::from_specs(&dup, |_| Vec::new()),
            Err(ConfigError::DuplicateFilter(_))
        ));
    }

    #[test]
    fn test_spec_to_rule() {
        let spec: FilterRuleSpec =
            serde_json::from_str(r#"{"name": "s1", "sensor": "sensor_test1"}"#).unwrap();
        let rule = spec.to_rule();
        assert_eq!(rule.name(), "s1");
        assert!(rule.accepts("sensor_test1", "system"));
        assert!(!rule.accepts("sensor_test2", "system"));
    }
}
