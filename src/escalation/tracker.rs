use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use log::{info, warn};
use serde::Serialize;

use crate::error::StoreError;
use crate::notifier::{Notification, Notifier, Severity};
use crate::schema::{FailureStatus, IngestionFailure};
use crate::store::FailureStore;

use super::summary::{DailyCounters, DailySummary};

/// Job type recorded for odds collection failures.
pub const ODDS_COLLECTION_JOB: &str = "odds_collection";

/// Retry count from which failure notifications escalate to danger.
const DANGER_RETRY_COUNT: u32 = 3;

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub checked: usize,
    pub resolved: usize,
    pub retrying: usize,
    pub exhausted: usize,
}

/// Durable failure state machine plus notification dispatch.
///
/// TRANSITIONS:
/// - (none)   -> pending             first persistent failure of an entity
/// - pending  -> retrying            each reconciliation attempt
/// - retrying -> resolved            a later attempt succeeded
/// - retrying -> maxRetriesExceeded  retry_count reached max_retries
///
/// Terminal records are never reopened; a new failure of the same
/// entity starts a fresh record.
pub struct FailureEscalationTracker {
    store: Arc<dyn FailureStore>,
    notifier: Arc<dyn Notifier>,
    max_retries: u32,
}

impl FailureEscalationTracker {
    pub fn new(store: Arc<dyn FailureStore>, notifier: Arc<dyn Notifier>, max_retries: u32) -> Self {
        Self {
            store,
            notifier,
            max_retries,
        }
    }

    /// Records a persistent failure of `entity_id`.
    ///
    /// An already-open record only gets its error refreshed; retry
    /// accounting belongs to `reconcile`.
    pub async fn record_failure(
        &self,
        job_type: &str,
        entity_id: &str,
        error: &str,
    ) -> Result<IngestionFailure, StoreError> {
        let now = Utc::now();

        if let Some(mut open) = self.store.open_for(job_type, entity_id).await? {
            open.error = error.to_string();
            open.updated_at = now;
            self.store.upsert(&open).await?;
            return Ok(open);
        }

        let failure = IngestionFailure {
            id: format!("{}:{}:{}", job_type, entity_id, now.timestamp_millis()),
            job_type: job_type.to_string(),
            entity_id: entity_id.to_string(),
            error: error.to_string(),
            retry_count: 0,
            max_retries: self.max_retries,
            status: FailureStatus::Pending,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };
        self.store.upsert(&failure).await?;

        info!("ingestion failure recorded for {} ({})", entity_id, job_type);
        self.notify_ingestion_failure(&failure).await;
        Ok(failure)
    }

    /// Resolves the open record of `entity_id`, if there is one.
    pub async fn record_success(
        &self,
        job_type: &str,
        entity_id: &str,
    ) -> Result<Option<IngestionFailure>, StoreError> {
        let Some(open) = self.store.open_for(job_type, entity_id).await? else {
            return Ok(None);
        };
        let resolved = self.resolve(open).await?;
        Ok(Some(resolved))
    }

    /// Reconciliation pass: retries every open failure once.
    ///
    /// `retry` receives the entity id and performs the actual work
    /// (for odds: one race collection without tracker side effects).
    pub async fn reconcile<F, Fut, T, E>(&self, mut retry: F) -> Result<ReconcileReport, StoreError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut report = ReconcileReport::default();

        for mut failure in self.store.list_open().await? {
            report.checked += 1;

            if failure.retry_count >= failure.max_retries {
                self.exhaust(failure).await?;
                report.exhausted += 1;
                continue;
            }

            failure.status = FailureStatus::Retrying;
            failure.retry_count += 1;
            failure.updated_at = Utc::now();
            self.store.upsert(&failure).await?;

            match retry(failure.entity_id.clone()).await {
                Ok(_) => {
                    self.resolve(failure).await?;
                    report.resolved += 1;
                }
                Err(err) => {
                    failure.error = err.to_string();
                    failure.updated_at = Utc::now();

                    if failure.retry_count >= failure.max_retries {
                        self.exhaust(failure).await?;
                        report.exhausted += 1;
                    } else {
                        self.store.upsert(&failure).await?;
                        self.notify_ingestion_failure(&failure).await;
                        report.retrying += 1;
                    }
                }
            }
        }

        if report.checked > 0 {
            info!(
                "reconciled {} failure(s): {} resolved, {} retrying, {} exhausted",
                report.checked, report.resolved, report.retrying, report.exhausted
            );
        }
        Ok(report)
    }

    pub async fn pending_failures(&self) -> Result<usize, StoreError> {
        self.store.count_open().await
    }

    /// Builds the summary for `date` from the durable counters.
    pub async fn daily_summary(
        &self,
        date: NaiveDate,
        counters: &DailyCounters,
    ) -> Result<DailySummary, StoreError> {
        let (attempts, successes, failures) = counters.load(date).await?;
        Ok(DailySummary {
            date,
            total_races: attempts,
            successful_collections: successes,
            failed_collections: failures,
            pending_failures: self.pending_failures().await? as u64,
        })
    }

    /// Dispatches the daily summary and returns what was sent.
    pub async fn send_daily_summary(&self, summary: &DailySummary, warning_threshold: usize) -> Notification {
        let notification = summary.to_notification(warning_threshold);
        self.dispatch(&notification).await;
        notification
    }

    // --------------------------------------------------------
    // Transitions
    // --------------------------------------------------------

    async fn resolve(&self, mut failure: IngestionFailure) -> Result<IngestionFailure, StoreError> {
        let now = Utc::now();
        failure.status = FailureStatus::Resolved;
        failure.updated_at = now;
        failure.resolved_at = Some(now);
        self.store.upsert(&failure).await?;

        info!("ingestion recovered for {} after {} retries", failure.entity_id, failure.retry_count);
        self.notify_recovery(&failure).await;
        Ok(failure)
    }

    async fn exhaust(&self, mut failure: IngestionFailure) -> Result<(), StoreError> {
        failure.status = FailureStatus::MaxRetriesExceeded;
        failure.updated_at = Utc::now();
        self.store.upsert(&failure).await?;

        warn!("ingestion for {} exhausted {} retries", failure.entity_id, failure.max_retries);
        self.notify_max_retries_exceeded(&failure).await;
        Ok(())
    }

    // --------------------------------------------------------
    // Notifications
    // --------------------------------------------------------

    pub async fn notify_ingestion_failure(&self, failure: &IngestionFailure) {
        let severity = if failure.retry_count < DANGER_RETRY_COUNT {
            Severity::Warning
        } else {
            Severity::Danger
        };

        let notification = Notification::new(
            severity,
            "Odds ingestion failure",
            format!("{} failed for {}: {}", failure.job_type, failure.entity_id, failure.error),
        )
        .field("Entity", &failure.entity_id)
        .field("Retry", format!("{}/{}", failure.retry_count, failure.max_retries))
        .field("Status", format!("{:?}", failure.status));

        self.dispatch(&notification).await;
    }

    pub async fn notify_max_retries_exceeded(&self, failure: &IngestionFailure) {
        let notification = Notification::new(
            Severity::Danger,
            "Manual intervention required",
            format!(
                "{} for {} failed {} times: {}",
                failure.job_type, failure.entity_id, failure.retry_count, failure.error
            ),
        )
        .field("Entity", &failure.entity_id)
        .field("Failure id", &failure.id);

        self.dispatch(&notification).await;
    }

    pub async fn notify_recovery(&self, failure: &IngestionFailure) {
        let notification = Notification::new(
            Severity::Good,
            "Recovery complete",
            format!(
                "{} for {} recovered after {} retries",
                failure.job_type, failure.entity_id, failure.retry_count
            ),
        )
        .field("Entity", &failure.entity_id);

        self.dispatch(&notification).await;
    }

    async fn dispatch(&self, notification: &Notification) {
        if let Err(e) = self.notifier.notify(notification).await {
            warn!("notification '{}' not delivered: {:#}", notification.title, e);
        }
    }
}
