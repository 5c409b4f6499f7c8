//! HWPC report definitions
//!
//! A report is one observation of hardware performance counters taken by a
//! sensor for a target. Counters are grouped by event group, then by socket,
//! then by core. The set of groups, sockets, cores and events is dynamic and
//! varies from one report to the next.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Untyped document as retrieved from the store
pub type RawDocument = Value;

/// CPU socket number
pub type SocketId = u32;

/// CPU core number
pub type CoreId = u32;

/// Hardware counter reading
pub type CounterValue = u64;

/// Event name → counter value
pub type CoreCounters = BTreeMap<String, CounterValue>;

/// Core → events
pub type SocketCounters = BTreeMap<CoreId, CoreCounters>;

/// Socket → core → event → value
pub type GroupData = BTreeMap<SocketId, SocketCounters>;

/// Reserved target name meaning the whole machine
pub const SYSTEM_TARGET: &str = "system";

/// A validated hardware performance counter report.
///
/// Reports are built by [`crate::validate`] and handed to consumers behind an
/// `Arc`, so nothing downstream can modify them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwpcReport {
    /// Opaque identifier, unique within a source collection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// When the measurement was taken (untrusted, may go backwards)
    pub timestamp: DateTime<Utc>,

    /// Measuring agent
    pub sensor: String,

    /// Measured entity
    pub target: String,

    /// Event groups
    #[serde(default)]
    pub groups: BTreeMap<String, GroupData>,
}

impl HwpcReport {
    /// Create a report with no counter groups
    pub fn new(timestamp: DateTime<Utc>, sensor: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            timestamp,
            sensor: sensor.into(),
            target: target.into(),
            groups: BTreeMap::new(),
        }
    }

    /// Whether the report measures the whole machine
    pub fn is_system_target(&self) -> bool {
        self.target == SYSTEM_TARGET
    }

    /// Look up a single counter
    pub fn counter(
        &self,
        group: &str,
        socket: SocketId,
        core: CoreId,
        event: &str,
    ) -> Option<CounterValue> {
        self.groups
            .get(group)?
            .get(&socket)?
            .get(&core)?
            .get(event)
            .copied()
    }

    /// Number of counter readings across all groups
    pub fn counter_count(&self) -> usize {
        self.groups
            .values()
            .flat_map(|sockets| sockets.values())
            .flat_map(|cores| cores.values())
            .map(|events| events.len())
            .sum()
    }

    /// Key for downstream deduplication (`id` + `sensor`).
    ///
    /// Returns `None` when the report has no identifier.
    pub fn dedup_key(&self) -> Option<String> {
        self.id.as_ref().map(|id| format!("{}/{}", self.sensor, id))
    }

    /// Convert back into the store document shape.
    ///
    /// `validate(&report.to_document())` yields a report equal to `report`.
    pub fn to_document(&self) -> RawDocument {
        let mut doc = Map::new();
        if let Some(id) = &self.id {
            doc.insert("id".to_string(), Value::String(id.clone()));
        }
        doc.insert(
            "timestamp".to_string(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        doc.insert("sensor".to_string(), Value::String(self.sensor.clone()));
        doc.insert("target".to_string(), Value::String(self.target.clone()));

        let mut groups = Map::new();
        for (name, sockets) in &self.groups {
            let mut socket_map = Map::new();
            for (socket, cores) in sockets {
                let mut core_map = Map::new();
                for (core, events) in cores {
                    let event_map = events
                        .iter()
                        .map(|(event, value)| (event.clone(), Value::from(*value)))
                        .collect::<Map<_, _>>();
                    core_map.insert(core.to_string(), Value::Object(event_map));
                }
                socket_map.insert(socket.to_string(), Value::Object(core_map));
            }
            groups.insert(name.clone(), Value::Object(socket_map));
        }
        doc.insert("groups".to_string(), Value::Object(groups));

        Value::Object(doc)
    }
}

impl std::fmt::Display for HwpcReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let groups: Vec<&str> = self.groups.keys().map(String::as_str).collect();
        write!(
            f,
            "HwpcReport({}, {}, {}, {:?})",
            self.timestamp.to_rfc3339(),
            self.sensor,
            self.target,
            groups
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HwpcReport {
        let mut report = HwpcReport::new(
            DateTime::<Utc>::from_timestamp_millis(1_000).unwrap(),
            "sensor_test",
            SYSTEM_TARGET,
        );
        report.id = Some("42".to_string());
        let mut events = CoreCounters::new();
        events.insert("event1".to_string(), 100);
        events.insert("event2".to_string(), 200);
        let mut cores = SocketCounters::new();
        cores.insert(0, events);
        let mut group = GroupData::new();
        group.insert(0, cores);
        report.groups.insert("megagroup".to_string(), group);
        report
    }

    #[test]
    fn test_counter_lookup() {
        let report = sample();
        assert_eq!(report.counter("megagroup", 0, 0, "event1"), Some(100));
        assert_eq!(report.counter("megagroup", 0, 0, "event2"), Some(200));
        assert_eq!(report.counter("megagroup", 1, 0, "event1"), None);
        assert_eq!(report.counter("rapl", 0, 0, "event1"), None);
        assert_eq!(report.counter_count(), 2);
    }

    #[test]
    fn test_system_target_and_dedup_key() {
        let mut report = sample();
        assert!(report.is_system_target());
        assert_eq!(report.dedup_key().as_deref(), Some("sensor_test/42"));

        report.id = None;
        report.target = "cgroup/web".to_string();
        assert!(!report.is_system_target());
        assert_eq!(report.dedup_key(), None);
    }

    #[test]
    fn test_to_document_uses_string_keys() {
        let doc = sample().to_document();
        assert_eq!(doc["sensor"], "sensor_test");
        assert_eq!(doc["target"], "system");
        assert_eq!(doc["id"], "42");
        assert_eq!(doc["groups"]["megagroup"]["0"]["0"]["event1"], 100);
    }

    #[test]
    fn test_serde_json_roundtrip() {
        let report = sample();
        let json = serde_json::to_string(&report).unwrap();
        let back: HwpcReport = serde_json::from_str(&json).unwrap();
        assert_eq!(report, back);
    }

    #[test]
    fn test_display_lists_groups() {
        let text = sample().to_string();
        assert!(text.contains("sensor_test"));
        assert!(text.contains("megagroup"));
    }
}
