pub mod attachment;
pub mod change;
pub mod comment;
pub mod item;
pub mod search;

pub use attachment::*;
pub use change::*;
pub use comment::*;
pub use item::*;
pub use search::*;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Parses the timestamp formats trackers send back.
///
/// Handles RFC 3339, offsets without a colon (`+0000`), naive UTC
/// timestamps and the `{"__jsonclass__": ["datetime", ...]}` wrapper.
pub fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    let raw = match value {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => obj
            .get("__jsonclass__")
            .and_then(|c| c.get(1))
            .and_then(Value::as_str)?,
        _ => return None,
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y%m%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|dt| dt.and_utc())
}

pub(crate) fn string(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

pub(crate) fn id_of(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_parse_time_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

        assert_eq!(parse_time(&json!("2024-01-02T03:04:05Z")), Some(expected));
        assert_eq!(parse_time(&json!("2024-01-02T03:04:05.000+0000")), Some(expected));
        assert_eq!(parse_time(&json!("2024-01-02T03:04:05")), Some(expected));
        assert_eq!(
            parse_time(&json!({"__jsonclass__": ["datetime", "2024-01-02T03:04:05"]})),
            Some(expected)
        );
        assert_eq!(parse_time(&json!(null)), None);
        assert_eq!(parse_time(&json!("yesterday")), None);
    }
}
