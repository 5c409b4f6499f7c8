//! Adapter for the legacy flat report shape.
//!
//! Older sensors wrote one row per (socket, cpu) with the event counters as
//! top-level fields:
//!
//! ```json
//! {"timestamp": 1000, "sensor": "s", "target": "system", "socket": 0, "cpu": 2, "INSTR": 10}
//! ```
//!
//! The row is folded into the nested `groups` shape under a caller-chosen
//! group name so that only one schema reaches the validator.

use crate::types::report::RawDocument;
use crate::validate::ValidationError;
use serde_json::{Map, Value};

/// Fields that describe the row itself rather than a counter
const ROW_FIELDS: &[&str] = &["_id", "id", "timestamp", "sensor", "target", "socket", "cpu"];

/// True when the document looks like a flat row (no `groups`, has `socket` and `cpu`).
pub fn is_flat_document(document: &RawDocument) -> bool {
    document.as_object().map_or(false, |fields| {
        !fields.contains_key("groups") && fields.contains_key("socket") && fields.contains_key("cpu")
    })
}

/// Fold a flat row into the nested shape under `group`.
///
/// Non-flat documents are returned unchanged. Counter values are copied as-is;
/// the validator rejects bad ones afterwards with full paths.
pub fn migrate_flat_document(group: &str, document: &RawDocument) -> Result<RawDocument, ValidationError> {
    if !is_flat_document(document) {
        return Ok(document.clone());
    }
    let fields = match document.as_object() {
        Some(fields) => fields,
        None => return Ok(document.clone()),
    };

    let socket = id_field(fields, "socket")?;
    let cpu = id_field(fields, "cpu")?;

    let mut events = Map::new();
    for (name, value) in fields {
        if !ROW_FIELDS.contains(&name.as_str()) {
            events.insert(name.clone(), value.clone());
        }
    }

    let mut cores = Map::new();
    cores.insert(cpu, Value::Object(events));
    let mut sockets = Map::new();
    sockets.insert(socket, Value::Object(cores));
    let mut groups = Map::new();
    groups.insert(group.to_string(), Value::Object(sockets));

    let mut nested = Map::new();
    for key in ["_id", "id", "timestamp", "sensor", "target"] {
        if let Some(value) = fields.get(key) {
            nested.insert(key.to_string(), value.clone());
        }
    }
    nested.insert("groups".to_string(), Value::Object(groups));

    Ok(Value::Object(nested))
}

/// Socket/cpu ids may be numbers or numeric strings (CSV rows).
fn id_field(fields: &Map<String, Value>, name: &'static str) -> Result<String, ValidationError> {
    let parsed = match fields.get(name) {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    match (parsed, fields.get(name)) {
        // Canonical form, so "01" and 1 land on the same key.
        (Some(id), _) => Ok(id.to_string()),
        (None, Some(other)) => Err(ValidationError::InvalidKey {
            path: name.to_string(),
            key: other.to_string(),
            expected: if name == "socket" { "socket" } else { "core" },
        }),
        (None, None) => Err(ValidationError::MissingField(name)),
    }
}
