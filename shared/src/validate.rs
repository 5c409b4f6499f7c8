//! Report validation
//!
//! Turns an untyped store document into an [`HwpcReport`]. Validation is
//! pure: a rejected document will be rejected again on every retry, so
//! callers discard it instead of re-reading it.

use crate::types::report::{
    CoreCounters, CoreId, CounterValue, GroupData, HwpcReport, RawDocument, SocketCounters,
    SocketId,
};
use crate::utils::time::timestamp_from_value;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Why a document is not a well-formed HWPC report.
///
/// Paths use dotted notation from the document root, e.g.
/// `groups.rapl.0.1.RAPL_ENERGY_PKG`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("document is not an object (found {found})")]
    NotAnObject { found: &'static str },

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` must be {expected}, found {found}")]
    WrongType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("field `{0}` is empty")]
    EmptyField(&'static str),

    #[error("field `timestamp` is not a point in time: {0}")]
    InvalidTimestamp(String),

    #[error("key `{key}` under `{path}` is not a {expected} id")]
    InvalidKey {
        path: String,
        key: String,
        expected: &'static str,
    },

    #[error("malformed nesting at `{path}`: expected {expected}, found {found}")]
    MalformedNesting {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("counter `{path}` is negative ({value})")]
    NegativeCounter { path: String, value: String },

    #[error("counter `{path}` is not a number (found {found})")]
    NonNumericCounter { path: String, found: &'static str },

    #[error("counter `{path}` is not an integer ({value})")]
    FractionalCounter { path: String, value: String },

    #[error("counter `{path}` does not fit in 64 bits ({value})")]
    CounterOutOfRange { path: String, value: String },
}

/// Validate a raw document and build the typed report.
pub fn validate(document: &RawDocument) -> Result<HwpcReport, ValidationError> {
    let fields = document.as_object().ok_or(ValidationError::NotAnObject {
        found: type_name(document),
    })?;

    let sensor = required_string(fields, "sensor")?;
    let target = required_string(fields, "target")?;

    let raw_ts = fields
        .get("timestamp")
        .ok_or(ValidationError::MissingField("timestamp"))?;
    let timestamp = timestamp_from_value(raw_ts)
        .ok_or_else(|| ValidationError::InvalidTimestamp(raw_ts.to_string()))?;

    let id = fields
        .get("id")
        .or_else(|| fields.get("_id"))
        .and_then(identifier);

    let groups = match fields.get("groups") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(groups)) => parse_groups(groups)?,
        Some(other) => {
            return Err(ValidationError::WrongType {
                field: "groups".to_string(),
                expected: "an object",
                found: type_name(other),
            })
        }
    };

    Ok(HwpcReport {
        id,
        timestamp,
        sensor,
        target,
        groups,
    })
}

fn required_string(fields: &Map<String, Value>, name: &'static str) -> Result<String, ValidationError> {
    match fields.get(name) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(name)),
        Some(Value::String(s)) if s.trim().is_empty() => Err(ValidationError::EmptyField(name)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(ValidationError::WrongType {
            field: name.to_string(),
            expected: "a string",
            found: type_name(other),
        }),
    }
}

/// Accepts string, integer and `{"$oid": "..."}` identifiers.
fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("$oid").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn parse_groups(groups: &Map<String, Value>) -> Result<BTreeMap<String, GroupData>, ValidationError> {
    let mut out = BTreeMap::new();

    for (group_name, sockets) in groups {
        let group_path = format!("groups.{}", group_name);
        let sockets = expect_object(sockets, &group_path, "a socket mapping")?;

        let mut group = GroupData::new();
        for (socket_key, cores) in sockets {
            let socket: SocketId = parse_id(socket_key, &group_path, "socket")?;
            let socket_path = format!("{}.{}", group_path, socket_key);
            let cores = expect_object(cores, &socket_path, "a core mapping")?;

            let mut socket_counters = SocketCounters::new();
            for (core_key, events) in cores {
                let core: CoreId = parse_id(core_key, &socket_path, "core")?;
                let core_path = format!("{}.{}", socket_path, core_key);
                let events = expect_object(events, &core_path, "an event mapping")?;

                let mut counters = CoreCounters::new();
                for (event, value) in events {
                    let path = format!("{}.{}", core_path, event);
                    counters.insert(event.clone(), parse_counter(value, path)?);
                }
                socket_counters.insert(core, counters);
            }
            group.insert(socket, socket_counters);
        }
        out.insert(group_name.clone(), group);
    }

    Ok(out)
}

fn expect_object<'a>(
    value: &'a Value,
    path: &str,
    expected: &'static str,
) -> Result<&'a Map<String, Value>, ValidationError> {
    value.as_object().ok_or_else(|| ValidationError::MalformedNesting {
        path: path.to_string(),
        expected,
        found: type_name(value),
    })
}

/// Ids must be written canonically ("0", not "00", " 0" or "+0") so two
/// keys of one mapping can never name the same socket or core.
fn parse_id(key: &str, path: &str, expected: &'static str) -> Result<u32, ValidationError> {
    match key.parse::<u32>() {
        Ok(id) if id.to_string() == key => Ok(id),
        _ => Err(ValidationError::InvalidKey {
            path: path.to_string(),
            key: key.to_string(),
            expected,
        }),
    }
}

fn parse_counter(value: &Value, path: String) -> Result<CounterValue, ValidationError> {
    let n = match value {
        Value::Number(n) => n,
        Value::Object(_) | Value::Array(_) => {
            return Err(ValidationError::MalformedNesting {
                path,
                expected: "a counter value",
                found: type_name(value),
            })
        }
        other => {
            return Err(ValidationError::NonNumericCounter {
                path,
                found: type_name(other),
            })
        }
    };

    if let Some(v) = n.as_u64() {
        return Ok(v);
    }
    if let Some(v) = n.as_i64() {
        // as_u64 failed, so this is negative
        return Err(ValidationError::NegativeCounter {
            path,
            value: v.to_string(),
        });
    }

    let f = n.as_f64().unwrap_or(f64::NAN);
    if f < 0.0 {
        Err(ValidationError::NegativeCounter {
            path,
            value: n.to_string(),
        })
    } else if f.fract() != 0.0 {
        Err(ValidationError::FractionalCounter {
            path,
            value: n.to_string(),
        })
    } else if f < u64::MAX as f64 {
        // u64::MAX as f64 rounds up to 2^64, which does not fit.
        Ok(f as u64)
    } else {
        Err(ValidationError::CounterOutOfRange {
            path,
            value: n.to_string(),
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
