//! The `OUT=` metric line protocol.
//!
//! A stdout line starting with `OUT=` carries tab-separated tokens, each either
//! `key=value` or a bare number (stored under the key `value`):
//!
//! ```text
//! OUT=cpu=42.5\tmem=1024
//! OUT=17
//! ```
//!
//! Tokens whose value is not a finite number are dropped; the line itself is
//! logged either way.

use chrono::{DateTime, Utc};
use everping_core::MetricSample;

pub const PREFIX: &str = "OUT=";
pub const BARE_KEY: &str = "value";

/// Parse one stdout line. `None` when the line is not a metric line at all.
pub fn parse_line(line: &str, ts: DateTime<Utc>) -> Option<Vec<MetricSample>> {
    let payload = line.strip_prefix(PREFIX)?;
    let samples = payload
        .split('\t')
        .filter_map(|token| parse_token(token.trim()))
        .map(|(key, value)| MetricSample { key, value, ts })
        .collect();
    Some(samples)
}

fn parse_token(token: &str) -> Option<(String, f64)> {
    if token.is_empty() {
        return None;
    }
    let (key, raw) = match token.split_once('=') {
        Some((key, raw)) => (key.trim(), raw.trim()),
        None => (BARE_KEY, token),
    };
    if key.is_empty() {
        return None;
    }
    let value: f64 = raw.parse().ok()?;
    value.is_finite().then(|| (key.to_string(), value))
}
