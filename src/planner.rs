//! Collection window and cadence planning.
//!
//! Everything here is a pure function of `(now, race.start_time)`.
//! No I/O, no clocks, no hidden state: the runner passes `now` in.
//!
//! CADENCE BUCKETS (inclusive):
//! - 15..=60 min before start: every 5 minutes (minute divisible by 5)
//! - 6..=14 min before start:  every invocation
//! - 0..=5 min before start:   every invocation + a second pass

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::schema::RaceMetadata;

/// Outer edge of the collection window, in minutes.
pub const WINDOW_MINUTES: i64 = 60;

/// Derived polling decision for one race. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDecision {
    pub minutes_to_start: i64,
    pub should_collect: bool,
    pub needs_second_pass: bool,
}

impl CollectionDecision {
    pub fn for_minutes(minutes_to_start: i64) -> Self {
        Self {
            minutes_to_start,
            should_collect: should_collect_now(minutes_to_start),
            needs_second_pass: needs_second_pass(minutes_to_start),
        }
    }
}

/// Whole minutes until `start`, rounded to the nearest minute.
///
/// Rounding absorbs the few seconds of scheduler jitter so that a
/// trigger firing at 12:00:02 for a 12:10:00 start still lands on 10.
pub fn minutes_to_start(start: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (start - now).num_milliseconds() as f64;
    (millis / 60_000.0).round() as i64
}

/// Keeps races starting within the next hour, paired with their
/// minutes-to-start. Races without a usable start time are dropped.
pub fn get_upcoming_races_for_collection(
    races: &[RaceMetadata],
    now: DateTime<Utc>,
) -> Vec<(RaceMetadata, i64)> {
    races
        .iter()
        .filter_map(|race| {
            let start = race.start_time?;
            let minutes = minutes_to_start(start, now);
            (minutes > 0 && minutes <= WINDOW_MINUTES).then(|| (race.clone(), minutes))
        })
        .collect()
}

pub fn should_collect_now(minutes_to_start: i64) -> bool {
    match minutes_to_start {
        15..=60 => minutes_to_start % 5 == 0,
        6..=14 => true,
        0..=5 => true,
        _ => false,
    }
}

pub fn needs_second_pass(minutes_to_start: i64) -> bool {
    (0..=5).contains(&minutes_to_start)
}
