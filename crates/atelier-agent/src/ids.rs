//! Prefixed identifiers and wire timestamps.

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

/// Generate an id like `msg-7f3a…` from a short type prefix.
pub fn generate_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

/// Current UTC time as an RFC3339 string, the canonical wire/storage format.
pub fn utc_now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

/// Parse an RFC3339 timestamp; returns None on malformed input.
pub fn parse_iso(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).ok()
}

/// Milliseconds elapsed since an RFC3339 timestamp, when parseable.
pub fn millis_since(start_iso: &str) -> Option<i64> {
    let start = parse_iso(start_iso)?;
    let elapsed = OffsetDateTime::now_utc() - start;
    Some(elapsed.whole_milliseconds() as i64)
}
