use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use tokio::time::{Instant, sleep};

use crate::error::PipelineError;
use crate::escalation::DailyCounters;
use crate::fallback::FallbackModeController;
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::planner::{self, CollectionDecision};
use crate::store::RaceSource;

use super::orchestrator::{OddsCollectionOrchestrator, PollResult};

/// Result of one triggered invocation, returned as the `data` of the
/// trigger response.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSummary {
    /// Scheduled races listed for the window's date(s)
    pub races_checked: usize,
    /// Of those, races inside the 60 minute window
    pub races_in_window: usize,
    /// Races polled in the first pass
    pub races_collected: usize,
    pub first_pass_snapshots: usize,
    pub second_pass_snapshots: usize,
    pub total_snapshots: usize,
    /// Failed races across both passes
    pub errors: usize,
    pub fallback_active: bool,
}

/// Runs one invocation of the collection pipeline.
///
/// FLOW:
/// 1. Fallback check (a throttled invocation does nothing)
/// 2. Scheduled races → window + cadence planning
/// 3. First pass over every race due now
/// 4. Health + daily counters
/// 5. After one bounded delay, a second pass scoped to the races in
///    their last 5 minutes
///
/// The whole invocation shares one deadline. Both passes stop at it
/// (unfinished races count as errors), and the second pass is skipped
/// when its delay alone would overrun it.
pub struct CollectionRunner {
    orchestrator: Arc<OddsCollectionOrchestrator>,
    races: Arc<dyn RaceSource>,
    fallback: FallbackModeController,
    counters: DailyCounters,
    second_pass_delay: Duration,
    budget: Duration,
}

impl CollectionRunner {
    pub fn new(
        orchestrator: Arc<OddsCollectionOrchestrator>,
        races: Arc<dyn RaceSource>,
        fallback: FallbackModeController,
        counters: DailyCounters,
        second_pass_delay: Duration,
        budget: Duration,
    ) -> Self {
        Self {
            orchestrator,
            races,
            fallback,
            counters,
            second_pass_delay,
            budget,
        }
    }

    pub fn fallback(&self) -> &FallbackModeController {
        &self.fallback
    }

    pub async fn run(&self) -> Result<CollectionSummary, PipelineError> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<CollectionSummary, PipelineError> {
        let deadline = Instant::now() + self.budget;
        RuntimeMetrics::incr(&METRICS.invocations);

        // ----------------------------------------------------
        // Fallback gate
        // ----------------------------------------------------
        let fallback = self
            .fallback
            .get_fallback_state(now)
            .await
            .map_err(PipelineError::State)?;

        if fallback.active {
            let throttled = self
                .fallback
                .should_throttle_fallback(now)
                .await
                .map_err(PipelineError::State)?;

            if throttled {
                RuntimeMetrics::incr(&METRICS.throttled_invocations);
                info!(
                    "fallback mode ({}): throttled, next collection after {:?}",
                    fallback.reason,
                    fallback
                        .last_collection_at
                        .map(|t| t + chrono::Duration::milliseconds(fallback.interval_ms))
                );
                return Ok(CollectionSummary {
                    fallback_active: true,
                    ..CollectionSummary::default()
                });
            }

            warn!(
                "fallback mode ({}): {:?} collection every {}ms",
                fallback.reason, fallback.source, fallback.interval_ms
            );
        }

        // ----------------------------------------------------
        // Planning
        //
        // NOTE:
        // - Near midnight the window reaches into the next date,
        //   whose races are listed under that date.
        // ----------------------------------------------------
        let today = now.date_naive();
        let horizon = (now + chrono::Duration::minutes(planner::WINDOW_MINUTES)).date_naive();

        let mut scheduled = self
            .races
            .scheduled_races(today)
            .await
            .map_err(PipelineError::RaceListing)?;
        if horizon != today {
            scheduled.extend(
                self.races
                    .scheduled_races(horizon)
                    .await
                    .map_err(PipelineError::RaceListing)?,
            );
        }

        let in_window = planner::get_upcoming_races_for_collection(&scheduled, now);

        let mut first_ids = Vec::new();
        let mut second_ids = Vec::new();
        for (race, minutes) in &in_window {
            let decision = CollectionDecision::for_minutes(*minutes);

            // In fallback the coarse interval already spaces collections,
            // so every race in the window is due.
            if fallback.active || decision.should_collect {
                first_ids.push(race.id.clone());
            }
            if !fallback.active && decision.needs_second_pass {
                second_ids.push(race.id.clone());
            }
        }

        // ----------------------------------------------------
        // First pass
        // ----------------------------------------------------
        let first = self
            .orchestrator
            .poll_odds_until(&first_ids, Some(deadline))
            .await;

        self.fallback
            .record_batch_health(first.races, first.errors)
            .await
            .map_err(PipelineError::State)?;
        self.counters
            .record_pass(today, first.races, first.errors)
            .await
            .map_err(PipelineError::State)?;

        // ----------------------------------------------------
        // Second pass
        // ----------------------------------------------------
        let second = self.second_pass(&second_ids, deadline).await;
        if second.races > 0 {
            self.counters
                .record_pass(today, second.races, second.errors)
                .await
                .map_err(PipelineError::State)?;
        }

        if fallback.active {
            self.fallback
                .mark_fallback_collection(now)
                .await
                .map_err(PipelineError::State)?;
        }

        let summary = CollectionSummary {
            races_checked: scheduled.len(),
            races_in_window: in_window.len(),
            races_collected: first_ids.len(),
            first_pass_snapshots: first.snapshots,
            second_pass_snapshots: second.snapshots,
            total_snapshots: first.snapshots + second.snapshots,
            errors: first.errors + second.errors,
            fallback_active: fallback.active,
        };

        info!(
            "collection done: checked={} window={} collected={} snapshots={}+{} errors={} fallback={}",
            summary.races_checked,
            summary.races_in_window,
            summary.races_collected,
            summary.first_pass_snapshots,
            summary.second_pass_snapshots,
            summary.errors,
            summary.fallback_active
        );
        Ok(summary)
    }

    /// The single bounded suspension of an invocation.
    async fn second_pass(&self, race_ids: &[String], deadline: Instant) -> PollResult {
        if race_ids.is_empty() {
            return PollResult::default();
        }

        if Instant::now() + self.second_pass_delay >= deadline {
            warn!(
                "second pass for {} race(s) skipped: delay {:?} exceeds remaining budget",
                race_ids.len(),
                self.second_pass_delay
            );
            return PollResult::default();
        }

        RuntimeMetrics::incr(&METRICS.second_passes);

        sleep(self.second_pass_delay).await;
        self.orchestrator
            .poll_odds_until(race_ids, Some(deadline))
            .await
    }
}
