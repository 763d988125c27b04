//! Timestamp formatting shared by the store and the CLI output.
//!
//! Every persisted timestamp is UTC, second precision, ISO 8601 with a `Z`
//! suffix (e.g. `2025-01-15T14:22:00Z`). The textual form sorts
//! lexicographically in timestamp order, which the store relies on for
//! eligibility comparisons.

use chrono::{DateTime, Timelike, Utc};
use serde::Serializer;

const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Drop sub-second precision from a datetime.
pub fn truncate_to_seconds(datetime: DateTime<Utc>) -> DateTime<Utc> {
    datetime.with_nanosecond(0).unwrap_or(datetime)
}

/// Render a datetime in the persisted wire format.
pub fn format_utc(datetime: &DateTime<Utc>) -> String {
    datetime.format(FORMAT).to_string()
}

/// Parse a datetime from the persisted wire format.
pub fn parse_utc(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

pub fn serialize_datetime<S>(datetime: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_utc(datetime))
}

pub fn serialize_optional_datetime<S>(
    datetime: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match datetime {
        Some(datetime) => serializer.serialize_str(&format_utc(datetime)),
        None => serializer.serialize_none(),
    }
}
