//! Time-related utilities
//!
//! Report timestamps arrive in several encodings depending on which sensor
//! or store produced them.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Convert milliseconds since UNIX epoch into a UTC timestamp
pub fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
}

/// Parse an RFC 3339 timestamp string
pub fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Interpret a JSON value as a point in time.
///
/// Accepted encodings:
/// - integer milliseconds since UNIX epoch (sensor wire format)
/// - RFC 3339 string
/// - `{"$date": <millis | rfc3339>}` (store extended JSON)
pub fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(millis_to_datetime),
        Value::String(s) => parse_rfc3339(s),
        Value::Object(map) if map.len() == 1 => map.get("$date").and_then(timestamp_from_value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_millis_encoding() {
        let ts = timestamp_from_value(&json!(1_500_000_000_123i64)).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_500_000_000_123);
    }

    #[test]
    fn test_rfc3339_encoding() {
        let ts = timestamp_from_value(&json!("2019-01-01T00:00:01Z")).unwrap();
        assert_eq!(ts.timestamp(), 1_546_300_801);

        let offset = timestamp_from_value(&json!("2019-01-01T02:00:01+02:00")).unwrap();
        assert_eq!(offset, ts);
    }

    #[test]
    fn test_extended_json_date() {
        let ts = timestamp_from_value(&json!({"$date": 1_000})).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_000);

        let ts = timestamp_from_value(&json!({"$date": "1970-01-01T00:00:01Z"})).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_000);
    }

    #[test]
    fn test_rejects_other_shapes() {
        assert!(timestamp_from_value(&json!(null)).is_none());
        assert!(timestamp_from_value(&json!(true)).is_none());
        assert!(timestamp_from_value(&json!(1.5)).is_none());
        assert!(timestamp_from_value(&json!("yesterday")).is_none());
        assert!(timestamp_from_value(&json!({"when": 1})).is_none());
    }
}
