//! Predicates over a report's `(sensor, target)` pair

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A string pattern: exact, `*`, a `prefix*`, or a list of those.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Pattern {
    One(String),
    Any(Vec<String>),
}

impl Pattern {
    pub fn exact(value: impl Into<String>) -> Self {
        Pattern::One(value.into())
    }

    pub fn any_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Pattern::Any(values.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::One(pattern) => glob_match(pattern, value),
            Pattern::Any(patterns) => patterns.iter().any(|p| glob_match(p, value)),
        }
    }
}

fn glob_match(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

/// Declarative predicate. An absent field matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchExpr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor: Option<Pattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Pattern>,
}

impl MatchExpr {
    pub fn sensor(pattern: Pattern) -> Self {
        Self {
            sensor: Some(pattern),
            target: None,
        }
    }

    pub fn target(pattern: Pattern) -> Self {
        Self {
            sensor: None,
            target: Some(pattern),
        }
    }

    pub fn and_target(mut self, pattern: Pattern) -> Self {
        self.target = Some(pattern);
        self
    }

    pub fn matches(&self, sensor: &str, target: &str) -> bool {
        self.sensor.as_ref().map_or(true, |p| p.matches(sensor))
            && self.target.as_ref().map_or(true, |p| p.matches(target))
    }
}

type PredicateFn = dyn Fn(&str, &str) -> bool + Send + Sync;

/// Decides whether a filter accepts a report, from its sensor and target only.
///
/// Evaluation must not block and must not depend on anything but its inputs.
#[derive(Clone)]
pub enum Predicate {
    Match(MatchExpr),
    Func(Arc<PredicateFn>),
}

impl Predicate {
    /// Predicate backed by a closure
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        Predicate::Func(Arc::new(f))
    }

    /// Accept reports from exactly this sensor
    pub fn sensor_is(sensor: impl Into<String>) -> Self {
        Predicate::Match(MatchExpr::sensor(Pattern::exact(sensor)))
    }

    /// Accept reports with exactly this target
    pub fn target_is(target: impl Into<String>) -> Self {
        Predicate::Match(MatchExpr::target(Pattern::exact(target)))
    }

    /// Accept everything
    pub fn always() -> Self {
        Predicate::Match(MatchExpr::default())
    }

    pub fn evaluate(&self, sensor: &str, target: &str) -> bool {
        match self {
            Predicate::Match(expr) => expr.matches(sensor, target),
            Predicate::Func(f) => f(sensor, target),
        }
    }
}

impl From<MatchExpr> for Predicate {
    fn from(expr: MatchExpr) -> Self {
        Predicate::Match(expr)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Match(expr) => f.debug_tuple("Match").field(expr).finish(),
            Predicate::Func(_) => f.write_str("Func(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_forms() {
        assert!(Pattern::exact("sensor_test").matches("sensor_test"));
        assert!(!Pattern::exact("sensor_test").matches("sensor_test1"));
        assert!(Pattern::exact("*").matches("anything"));
        assert!(Pattern::exact("sensor_*").matches("sensor_test2"));
        assert!(!Pattern::exact("sensor_*").matches("other"));
        let list = Pattern::any_of(["a", "b*"]);
        assert!(list.matches("a"));
        assert!(list.matches("bee"));
        assert!(!list.matches("c"));
    }

    #[test]
    fn test_match_expr_combines_fields() {
        let expr = MatchExpr::sensor(Pattern::exact("s1")).and_target(Pattern::exact("system"));
        assert!(expr.matches("s1", "system"));
        assert!(!expr.matches("s1", "firefox"));
        assert!(!expr.matches("s2", "system"));
        assert!(MatchExpr::default().matches("x", "y"));
    }

    #[test]
    fn test_predicate_variants() {
        assert!(Predicate::sensor_is("s1").evaluate("s1", "t"));
        assert!(!Predicate::target_is("system").evaluate("s1", "t"));
        assert!(Predicate::always().evaluate("", ""));
        let custom = Predicate::from_fn(|sensor, target| sensor.len() == target.len());
        assert!(custom.evaluate("ab", "cd"));
        assert!(!custom.evaluate("ab", "c"));
        assert_eq!(format!("{:?}", custom), "Func(..)");
    }

    #[test]
    fn test_match_expr_deserializes_string_or_list() {
        let expr: MatchExpr =
            serde_json::from_str(r#"{"sensor": "s*", "target": ["system", "app"]}"#).unwrap();
        assert!(expr.matches("s9", "app"));
        assert!(!expr.matches("s9", "db"));
    }
}
