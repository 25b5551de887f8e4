use chrono::{DateTime, NaiveDateTime, Utc};

/// Parse a stored timestamp. Rows written by this system carry RFC 3339;
/// rows filled in by SQLite's `CURRENT_TIMESTAMP` default use
/// `YYYY-MM-DD HH:MM:SS`. Both are UTC.
pub fn parse_utc(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
