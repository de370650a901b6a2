//! Repository utilities.

use chrono::{DateTime, SecondsFormat, Utc};
use diesel::result::DatabaseErrorInformation;

/// Error info wrapper for errors raised outside diesel.
#[derive(Debug)]
pub struct DbErrorInfo(pub String);

impl DatabaseErrorInformation for DbErrorInfo {
    fn message(&self) -> &str {
        &self.0
    }
    fn details(&self) -> Option<&str> {
        None
    }
    fn hint(&self) -> Option<&str> {
        None
    }
    fn table_name(&self) -> Option<&str> {
        None
    }
    fn column_name(&self) -> Option<&str> {
        None
    }
    fn constraint_name(&self) -> Option<&str> {
        None
    }
    fn statement_position(&self) -> Option<i32> {
        None
    }
}

/// Convert any displayable error to a diesel error, keeping the message.
pub fn to_diesel_error(e: impl std::fmt::Display) -> diesel::result::Error {
    diesel::result::Error::DatabaseError(
        diesel::result::DatabaseErrorKind::Unknown,
        Box::new(DbErrorInfo(e.to_string())),
    )
}

/// Timestamp text with a fixed width so stored values sort chronologically.
pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time as stored in text columns.
pub fn now_rfc3339() -> String {
    format_datetime(Utc::now())
}

/// Parse a stored timestamp, falling back to the Unix epoch.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Parse a stored status column, warning and using `fallback` when the
/// text is not a known status.
pub fn parse_status<T: Copy + std::fmt::Debug>(
    table: &str,
    id: impl std::fmt::Display,
    raw: &str,
    parse: impl FnOnce(&str) -> Option<T>,
    fallback: T,
) -> T {
    parse(raw).unwrap_or_else(|| {
        tracing::warn!(table, %id, status = raw, ?fallback, "Unknown status in database");
        fallback
    })
}

/// Parse an optional JSON text column. Malformed JSON is dropped.
pub fn parse_json_opt<T: serde::de::DeserializeOwned>(s: Option<&str>) -> Option<T> {
    s.and_then(|s| serde_json::from_str(s).ok())
}

/// Whether SQLite gave up waiting for a lock held by another connection.
pub fn is_busy(e: &diesel::result::Error) -> bool {
    match e {
        diesel::result::Error::DatabaseError(_, info) => {
            let message = info.message();
            message.contains("database is locked") || message.contains("database table is locked")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_datetime_fallback() {
        assert_eq!(parse_datetime("garbage"), DateTime::UNIX_EPOCH);
        let now = Utc::now();
        let parsed = parse_datetime(&now.to_rfc3339());
        assert_eq!(parsed.timestamp(), now.timestamp());
        assert!(parse_datetime_opt(Some("nope".into())).is_none());
        assert!(parse_datetime_opt(None).is_none());
    }

    #[test]
    fn test_formatted_timestamps_sort() {
        let a = "2026-01-01T00:00:05Z".parse::<DateTime<Utc>>().unwrap();
        let b = a + chrono::Duration::milliseconds(1);
        assert!(format_datetime(a) < format_datetime(b));
        assert_eq!(parse_datetime(&format_datetime(b)), b);
    }

    #[test]
    fn test_parse_json_opt() {
        let v: Option<serde_json::Value> = parse_json_opt(Some(r#"{"a":1}"#));
        assert_eq!(v.unwrap()["a"], 1);
        let bad: Option<serde_json::Value> = parse_json_opt(Some("{"));
        assert!(bad.is_none());
    }

    #[test]
    fn test_is_busy() {
        assert!(is_busy(&to_diesel_error("database is locked")));
        assert!(!is_busy(&to_diesel_error("no such table: jobs")));
        assert!(!is_busy(&diesel::result::Error::NotFound));
    }

    #[test]
    fn test_parse_status_fallback() {
        let parse = |s: &str| (s == "done").then_some(1);
        assert_eq!(parse_status("jobs", "a", "done", parse, 0), 1);
        assert_eq!(parse_status("jobs", "a", "bogus", parse, 0), 0);
    }
}
