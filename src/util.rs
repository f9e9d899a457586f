/// Utility helpers shared across the collector.
///
/// This module contains:
/// - Time helpers
/// - Race id validation
/// - Small comparison helpers used by the HTTP layer
///
/// IMPORTANT:
/// - No provider-specific logic should live here.
/// - Everything in this module must stay pure and deterministic.
///
use chrono::{DateTime, SubsecRound, Utc};

/// Longest race id accepted from callers or upstream listings.
const MAX_RACE_ID_LEN: usize = 64;

/// Truncates a timestamp to whole seconds.
///
/// Used when a provider payload carries no odds timestamp and
/// the collection time becomes part of the snapshot natural key.
pub fn truncate_to_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(0)
}

/// Converts Unix milliseconds into a UTC timestamp.
///
/// Returns `None` for values chrono cannot represent.
pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

/// Checks that a race id is safe to embed in provider URLs and
/// storage keys.
///
/// Accepted: 1..=64 chars of ASCII alphanumerics, `-` and `_`.
pub fn is_valid_race_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_RACE_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Compares two secrets without short-circuiting on the first
/// mismatching byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
