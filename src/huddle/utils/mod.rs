pub mod retry;

use chrono::{DateTime, SecondsFormat, Utc};

/// Formats a timestamp the way documents store it (RFC 3339, millisecond precision).
pub(crate) fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses a stored RFC 3339 timestamp, ignoring malformed values.
pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
