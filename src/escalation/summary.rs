use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::StoreError;
use crate::notifier::{Notification, Severity};
use crate::store::StateStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total_races: u64,
    pub successful_collections: u64,
    pub failed_collections: u64,
    pub pending_failures: u64,
}

impl DailySummary {
    /// "95.0%"; a day without races reports "0%".
    pub fn success_rate_text(&self) -> String {
        if self.total_races == 0 {
            return "0%".to_string();
        }
        let rate = self.successful_collections as f64 / self.total_races as f64 * 100.0;
        format!("{:.1}%", rate)
    }

    /// - good:    nothing failed, or every failure has since recovered
    /// - warning: more open failures than `warning_threshold`
    /// - info:    otherwise
    pub fn severity(&self, warning_threshold: usize) -> Severity {
        if self.failed_collections == 0 || self.pending_failures == 0 {
            Severity::Good
        } else if self.pending_failures > warning_threshold as u64 {
            Severity::Warning
        } else {
            Severity::Info
        }
    }

    pub fn to_notification(&self, warning_threshold: usize) -> Notification {
        Notification::new(
            self.severity(warning_threshold),
            format!("Daily odds collection summary ({})", self.date),
            format!(
                "{} of {} race collections succeeded",
                self.successful_collections, self.total_races
            ),
        )
        .field("Total races", self.total_races)
        .field("Successful", self.successful_collections)
        .field("Failed", self.failed_collections)
        .field("Pending failures", self.pending_failures)
        .field("Success rate", self.success_rate_text())
    }
}

// ------------------------------------------------------------
// Durable daily counters
// ------------------------------------------------------------

pub fn daily_key(date: NaiveDate, field: &str) -> String {
    format!("odds:daily:{}:{}", date.format("%Y-%m-%d"), field)
}

/// Per-day collection counters kept in the `StateStore`.
#[derive(Clone)]
pub struct DailyCounters {
    state: Arc<dyn StateStore>,
}

impl DailyCounters {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }

    /// Adds one pass (`races` attempted, `errors` failed).
    pub async fn record_pass(&self, date: NaiveDate, races: usize, errors: usize) -> Result<(), StoreError> {
        if races == 0 {
            return Ok(());
        }
        let successes = races.saturating_sub(errors);

        self.state.incr_by(&daily_key(date, "attempts"), races as i64).await?;
        if successes > 0 {
            self.state.incr_by(&daily_key(date, "successes"), successes as i64).await?;
        }
        if errors > 0 {
            self.state.incr_by(&daily_key(date, "failures"), errors as i64).await?;
        }
        Ok(())
    }

    /// Returns (attempts, successes, failures).
    pub async fn load(&self, date: NaiveDate) -> Result<(u64, u64, u64), StoreError> {
        let read = |field: &'static str| {
            let key = daily_key(date, field);
            let state = self.state.clone();
            async move { Ok::<u64, StoreError>(state.get(&key).await?.unwrap_or(0).max(0) as u64) }
        };

        Ok((read("attempts").await?, read("successes").await?, read("failures").await?))
    }
}
