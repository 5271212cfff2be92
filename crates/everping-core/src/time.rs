//! Timestamp encoding used for every TEXT time column.
//!
//! All columns store UTC with a fixed microsecond width and a `Z` suffix, so
//! lexicographic order in SQL equals chronological order. `to_rfc3339()` alone
//! would drop trailing zero fractions and break `ORDER BY` / `<=` comparisons.

use chrono::{DateTime, SecondsFormat, Utc};

/// Encode `dt` for storage.
pub fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp. Accepts any RFC 3339 string, not only our own
/// fixed-width form, so hand-edited rows still load.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
