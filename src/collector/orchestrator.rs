use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use log::{debug, warn};
use serde::Serialize;
use tokio::time::{Instant, timeout_at};

use crate::error::{CollectError, ProviderError};
use crate::escalation::{FailureEscalationTracker, ODDS_COLLECTION_JOB};
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::providers::ProviderTable;
use crate::retry::RetryOverrides;
use crate::store::{RaceSource, SnapshotStore};
use crate::util;

/// Aggregate of one `poll_odds` batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollResult {
    /// Rows actually written (natural-key collisions excluded)
    pub snapshots: usize,
    /// Races attempted
    pub races: usize,
    /// Races that failed entirely
    pub errors: usize,
}

/// Polls odds for a list of races.
///
/// DESIGN:
/// - Provider selection is a table lookup by race type
/// - Races run concurrently (bounded); each yields its own result
///   and the batch counters are folded as races complete
/// - Every per-race error is caught at the race boundary
///
/// The second pass is NOT handled here: the runner calls
/// `poll_odds` again with the subset that needs it.
pub struct OddsCollectionOrchestrator {
    races: Arc<dyn RaceSource>,
    providers: ProviderTable,
    snapshots: Arc<dyn SnapshotStore>,
    tracker: Option<Arc<FailureEscalationTracker>>,
    concurrency: usize,
}

impl OddsCollectionOrchestrator {
    pub fn new(
        races: Arc<dyn RaceSource>,
        providers: ProviderTable,
        snapshots: Arc<dyn SnapshotStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            races,
            providers,
            snapshots,
            tracker: None,
            concurrency: concurrency.max(1),
        }
    }

    /// Persistent per-race failures are recorded with `tracker`, and
    /// later successes resolve them.
    pub fn with_tracker(mut self, tracker: Arc<FailureEscalationTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub async fn poll_odds(&self, race_ids: &[String]) -> PollResult {
        self.poll_odds_until(race_ids, None).await
    }

    /// Same as `poll_odds`, but stops waiting at `deadline`.
    ///
    /// Results are folded as each race completes, so whatever finished
    /// before the deadline is reported. Races still in flight (or not
    /// yet started) at the deadline are cancelled, counted as errors
    /// and escalated like any other transient failure.
    pub async fn poll_odds_until(&self, race_ids: &[String], deadline: Option<Instant>) -> PollResult {
        if race_ids.is_empty() {
            return PollResult::default();
        }

        let mut acc = PollResult {
            races: race_ids.len(),
            ..PollResult::default()
        };
        let mut finished = vec![false; race_ids.len()];

        {
            let mut results = pin!(
                stream::iter(0..race_ids.len())
                    .map(|idx| async move { (idx, self.poll_race(&race_ids[idx]).await) })
                    .buffer_unordered(self.concurrency)
            );

            loop {
                let next = match deadline {
                    Some(deadline) => match timeout_at(deadline, results.next()).await {
                        Ok(next) => next,
                        Err(_) => break,
                    },
                    None => results.next().await,
                };

                let Some((idx, outcome)) = next else { break };
                finished[idx] = true;
                match outcome {
                    Ok(written) => acc.snapshots += written,
                    Err(_) => acc.errors += 1,
                }
            }
        }

        let cut_off: Vec<&String> = race_ids
            .iter()
            .zip(&finished)
            .filter(|(_, done)| !**done)
            .map(|(id, _)| id)
            .collect();

        if !cut_off.is_empty() {
            warn!(
                "deadline reached with {} of {} race(s) unfinished",
                cut_off.len(),
                race_ids.len()
            );
            for id in cut_off {
                acc.errors += 1;
                RuntimeMetrics::incr(&METRICS.race_errors);
                self.escalate(id, "invocation deadline reached before collection finished")
                    .await;
            }
        }

        acc
    }

    /// Single-race convenience; returns the rows written.
    pub async fn poll_odds_for_race(&self, race_id: &str) -> usize {
        self.poll_odds(&[race_id.to_string()]).await.snapshots
    }

    /// One race, with failure tracking and metrics.
    async fn poll_race(&self, race_id: &str) -> Result<usize, CollectError> {
        RuntimeMetrics::incr(&METRICS.races_polled);
        let result = self.collect_race(race_id).await;

        match &result {
            Ok(written) => {
                RuntimeMetrics::add(&METRICS.snapshots_written, *written);
                if let Some(tracker) = &self.tracker {
                    if let Err(e) = tracker.record_success(ODDS_COLLECTION_JOB, race_id).await {
                        warn!("could not resolve failure record for {}: {}", race_id, e);
                    }
                }
            }
            Err(err) => {
                RuntimeMetrics::incr(&METRICS.race_errors);
                warn!("odds collection failed for race {}: {}", race_id, err);

                // Validation errors would fail the same way on every retry
                if !err.is_permanent() {
                    self.escalate(race_id, &err.to_string()).await;
                }
            }
        }
        result
    }

    async fn escalate(&self, race_id: &str, error: &str) {
        let Some(tracker) = &self.tracker else { return };
        if let Err(e) = tracker.record_failure(ODDS_COLLECTION_JOB, race_id, error).await {
            warn!("could not record failure for {}: {}", race_id, e);
        }
    }

    /// Fetch → map → store for one race, without side effects on the
    /// failure tracker. Reconciliation retries go through here.
    pub async fn collect_race(&self, race_id: &str) -> Result<usize, CollectError> {
        if !util::is_valid_race_id(race_id) {
            return Err(CollectError::InvalidRaceId(race_id.to_string()));
        }

        let race = self
            .races
            .race(race_id)
            .await?
            .ok_or_else(|| CollectError::UnknownRace(race_id.to_string()))?;

        let entry = self
            .providers
            .resolve(race.race_type)
            .ok_or_else(|| CollectError::UnsupportedRaceType(race.race_type.as_str().to_string()))?;

        let provider = entry.provider.clone();
        let timeout = entry.timeout;
        let id = race_id.to_string();

        let hook_id = id.clone();
        let overrides = RetryOverrides {
            on_retry: Some(Arc::new(move |attempt: u32, err: &anyhow::Error, delay: Duration| {
                RuntimeMetrics::incr(&METRICS.retries);
                debug!("race {} attempt {} failed ({}), retry in {:?}", hook_id, attempt, err, delay);
            })),
            ..RetryOverrides::default()
        };

        let outcome = entry
            .retry
            .run(
                || {
                    let provider = provider.clone();
                    let id = id.clone();
                    async move {
                        match tokio::time::timeout(timeout, provider.fetch_odds(&id)).await {
                            Ok(result) => result,
                            Err(_) => Err(ProviderError::Timeout(format!(
                                "no answer within {:?}",
                                timeout
                            ))),
                        }
                    }
                },
                overrides,
            )
            .await;

        let elapsed_ms = outcome.total_time_ms;
        let (raw, attempts) = outcome
            .into_result()
            .map_err(|(cause, attempts)| CollectError::Provider {
                provider: entry.provider.name(),
                attempts,
                cause,
            })?;

        let snapshots = entry
            .provider
            .map_snapshots(race_id, &raw, Utc::now())
            .map_err(CollectError::Mapping)?;

        let written = self.snapshots.insert_snapshots(&snapshots).await?;

        debug!(
            "race {} via {}: {} snapshot(s), {} new, {} attempt(s) in {}ms",
            race_id,
            entry.provider.name(),
            snapshots.len(),
            written,
            attempts,
            elapsed_ms
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{RetryOptions, create_retry_wrapper};
    use crate::schema::{FailureStatus, RaceType};
    use crate::store::{FailureStore, MemoryStore};
    use crate::testkit::{RecordingNotifier, ScriptedProvider, Step, odds_payload, race};
    use chrono::{Duration as ChronoDuration, TimeZone};

    const UPDATED: &str = "2026-10-17T05:40:00Z";

    fn table(provider: Arc<ScriptedProvider>) -> ProviderTable {
        let retry = create_retry_wrapper(RetryOptions {
            max_retries: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            jitter_ratio: 0.0,
            ..RetryOptions::default()
        });
        ProviderTable::new().register(RaceType::Horse, provider, retry, Duration::from_secs(2))
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<ScriptedProvider>, OddsCollectionOrchestrator) {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new());
        let start = chrono::Utc.with_ymd_and_hms(2026, 10, 17, 6, 0, 0).unwrap();

        for id in ["RA", "RB"] {
            store.put_race(race(id, RaceType::Horse, start)).await;
        }
        store
            .put_race(race("RBOAT", RaceType::Boat, start + ChronoDuration::minutes(5)))
            .await;

        let orchestrator =
            OddsCollectionOrchestrator::new(store.clone(), table(provider.clone()), store.clone(), 4);
        (store, provider, orchestrator)
    }

    #[tokio::test]
    async fn empty_batch_makes_no_calls() {
        let (_, provider, orchestrator) = setup().await;

        let result = orchestrator.poll_odds(&[]).await;
        assert_eq!(result, PollResult::default());
        assert!(provider.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_race_does_not_abort_the_batch() {
        let (store, provider, orchestrator) = setup().await;
        provider.script("RA", vec![Step::Status(503)]);
        provider.script("RB", vec![Step::Payload(odds_payload(UPDATED, &[(1, 2.4), (2, 6.1)]))]);

        let result = orchestrator
            .poll_odds(&["RA".to_string(), "RB".to_string()])
            .await;

        assert_eq!(
            result,
            PollResult {
                snapshots: 2,
                races: 2,
                errors: 1
            }
        );
        // 1 call + 2 retries for the failing race
        assert_eq!(provider.calls_for("RA"), 3);
        assert_eq!(store.snapshots_for("RB").await.len(), 2);
    }

    #[tokio::test]
    async fn repeated_poll_of_unchanged_payload_writes_nothing_new() {
        let (store, provider, orchestrator) = setup().await;
        provider.script("RB", vec![Step::Payload(odds_payload(UPDATED, &[(1, 2.4), (2, 6.1)]))]);

        assert_eq!(orchestrator.poll_odds_for_race("RB").await, 2);
        assert_eq!(orchestrator.poll_odds_for_race("RB").await, 0);
        assert_eq!(store.snapshot_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_transient_failure() {
        let (_, provider, orchestrator) = setup().await;
        provider.script(
            "RA",
            vec![
                Step::Status(429),
                Step::Payload(odds_payload(UPDATED, &[(3, 4.0)])),
            ],
        );

        assert_eq!(orchestrator.collect_race("RA").await.unwrap(), 1);
        assert_eq!(provider.calls_for("RA"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_is_cut_by_call_timeout() {
        let (_, provider, orchestrator) = setup().await;
        provider.script("RA", vec![Step::Hang]);

        let err = orchestrator.collect_race("RA").await.unwrap_err();
        match err {
            CollectError::Provider { attempts, cause, .. } => {
                assert_eq!(attempts, 3);
                assert!(cause.to_string().contains("no answer within"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_keeps_finished_races_and_escalates_the_rest() {
        let (store, provider, orchestrator) = setup().await;
        let notifier = Arc::new(RecordingNotifier::default());
        let tracker = Arc::new(FailureEscalationTracker::new(store.clone(), notifier, 5));
        let orchestrator = orchestrator.with_tracker(tracker);

        provider.script("RA", vec![Step::Hang]);
        provider.script("RB", vec![Step::Payload(odds_payload(UPDATED, &[(1, 2.4), (2, 6.1)]))]);

        let started = Instant::now();
        let result = orchestrator
            .poll_odds_until(
                &["RA".to_string(), "RB".to_string()],
                Some(started + Duration::from_secs(1)),
            )
            .await;

        assert!(started.elapsed() <= Duration::from_secs(1));
        assert_eq!(
            result,
            PollResult {
                snapshots: 2,
                races: 2,
                errors: 1
            }
        );

        let open = store.list_open().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].entity_id, "RA");
        assert!(open[0].error.contains("deadline"));
    }

    #[tokio::test]
    async fn validation_errors_fail_fast() {
        let (_, provider, orchestrator) = setup().await;

        let err = orchestrator.collect_race("../etc").await.unwrap_err();
        assert!(matches!(err, CollectError::InvalidRaceId(_)));

        // Boat has no provider in this table
        let err = orchestrator.collect_race("RBOAT").await.unwrap_err();
        assert!(matches!(err, CollectError::UnsupportedRaceType(ref t) if t == "boat"));

        let err = orchestrator.collect_race("NOPE").await.unwrap_err();
        assert!(matches!(err, CollectError::UnknownRace(_)));

        assert!(provider.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failures_are_tracked_and_resolved() {
        let (store, provider, orchestrator) = setup().await;
        let notifier = Arc::new(RecordingNotifier::default());
        let tracker = Arc::new(FailureEscalationTracker::new(store.clone(), notifier.clone(), 5));
        let orchestrator = orchestrator.with_tracker(tracker);

        provider.script(
            "RA",
            vec![
                Step::Status(503),
                Step::Status(503),
                Step::Status(503),
                Step::Payload(odds_payload(UPDATED, &[(1, 2.0)])),
            ],
        );

        let first = orchestrator
            .poll_odds(&["RA".to_string(), "../bad".to_string()])
            .await;
        assert_eq!(first.errors, 2);

        // Only the transient failure is escalated
        let open = store.list_open().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].entity_id, "RA");
        assert_eq!(open[0].status, FailureStatus::Pending);

        assert_eq!(orchestrator.poll_odds_for_race("RA").await, 1);
        assert!(store.list_open().await.unwrap().is_empty());
        assert_eq!(
            notifier.sent().await.last().unwrap().title,
            "Recovery complete"
        );
    }
}
