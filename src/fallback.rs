//! Degraded-mode controller.
//!
//! When the primary collection path keeps failing, the pipeline
//! switches to a coarse, throttled cadence so that a once-per-minute
//! trigger stops hammering an upstream that is already down.
//!
//! All state lives in the `StateStore`; this type holds none.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;

use crate::config::FallbackConfig;
use crate::error::StoreError;
use crate::store::StateStore;

/// Consecutive batches in which every race failed.
pub const HEALTH_FAILURES_KEY: &str = "odds:health:consecutive_failed_batches";

/// Unix millis of the last collection that ran in fallback mode.
pub const LAST_COLLECTION_KEY: &str = "odds:fallback:last_collection_at";

const MAX_CAS_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionSource {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackState {
    pub active: bool,
    pub source: CollectionSource,
    pub reason: String,
    pub interval_ms: i64,
    pub last_collection_at: Option<DateTime<Utc>>,
}

pub struct FallbackModeController {
    state: Arc<dyn StateStore>,
    config: FallbackConfig,
}

impl FallbackModeController {
    pub fn new(state: Arc<dyn StateStore>, config: FallbackConfig) -> Self {
        Self { state, config }
    }

    pub async fn get_fallback_state(&self, now: DateTime<Utc>) -> Result<FallbackState, StoreError> {
        let failures = self.state.get(HEALTH_FAILURES_KEY).await?.unwrap_or(0);
        let last_ms = self.state.get(LAST_COLLECTION_KEY).await?;
        let last_collection_at = last_ms.and_then(DateTime::<Utc>::from_timestamp_millis);

        let active = failures >= self.config.failure_threshold;
        if !active {
            return Ok(FallbackState {
                active: false,
                source: CollectionSource::Primary,
                reason: "primary path healthy".into(),
                interval_ms: self.config.normal_interval_ms,
                last_collection_at,
            });
        }

        Ok(FallbackState {
            active: true,
            source: CollectionSource::Fallback,
            reason: format!("{} consecutive failed collection batches", failures),
            interval_ms: self.config.interval_ms,
            last_collection_at,
        })
    }

    pub async fn is_fallback_mode(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.get_fallback_state(now).await?.active)
    }

    /// True iff fallback is active and the last fallback collection
    /// happened less than `interval_ms` ago.
    pub async fn should_throttle_fallback(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let state = self.get_fallback_state(now).await?;
        if !state.active {
            return Ok(false);
        }
        Ok(match state.last_collection_at {
            Some(last) => (now - last).num_milliseconds() < state.interval_ms,
            None => false,
        })
    }

    /// Records that a fallback-mode collection ran at `now`.
    ///
    /// Only ever moves the timestamp forward, so an overlapping
    /// invocation finishing late cannot rewind it.
    pub async fn mark_fallback_collection(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let now_ms = now.timestamp_millis();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.state.get(LAST_COLLECTION_KEY).await?;
            if current.is_some_and(|c| c >= now_ms) {
                return Ok(());
            }
            if self
                .state
                .compare_and_set(LAST_COLLECTION_KEY, current, now_ms)
                .await?
            {
                return Ok(());
            }
        }

        warn!("gave up recording fallback collection time after {} CAS attempts", MAX_CAS_ATTEMPTS);
        Ok(())
    }

    /// Feeds one first-pass result into the health counter.
    pub async fn record_batch_health(&self, races: usize, errors: usize) -> Result<(), StoreError> {
        if races == 0 {
            return Ok(());
        }

        if errors >= races {
            let failures = self.state.incr_by(HEALTH_FAILURES_KEY, 1).await?;
            if failures == self.config.failure_threshold {
                warn!("entering fallback mode after {} failed batches", failures);
            }
        } else {
            let previous = self.state.get(HEALTH_FAILURES_KEY).await?;
            if previous.is_some_and(|p| p != 0) {
                // An overlapping invocation may have counted a failed
                // batch since the read; that increment must survive.
                if !self
                    .state
                    .compare_and_set(HEALTH_FAILURES_KEY, previous, 0)
                    .await?
                {
                    debug!("health counter changed concurrently, reset skipped");
                    return Ok(());
                }
                if previous.unwrap_or(0) >= self.config.failure_threshold {
                    info!("primary collection path recovered, leaving fallback mode");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap()
    }

    fn controller(store: Arc<MemoryStore>) -> FallbackModeController {
        FallbackModeController::new(store, FallbackConfig::default())
    }

    #[tokio::test]
    async fn healthy_path_is_not_fallback() {
        let store = Arc::new(MemoryStore::new());
        let ctl = controller(store);

        let state = ctl.get_fallback_state(t0()).await.unwrap();
        assert!(!state.active);
        assert_eq!(state.source, CollectionSource::Primary);
        assert!(!ctl.should_throttle_fallback(t0()).await.unwrap());
    }

    #[tokio::test]
    async fn threshold_of_failed_batches_activates_fallback() {
        let store = Arc::new(MemoryStore::new());
        let ctl = controller(store);

        for _ in 0..2 {
            ctl.record_batch_health(4, 4).await.unwrap();
        }
        assert!(!ctl.is_fallback_mode(t0()).await.unwrap());

        ctl.record_batch_health(4, 4).await.unwrap();
        let state = ctl.get_fallback_state(t0()).await.unwrap();
        assert!(state.active);
        assert_eq!(state.interval_ms, 300_000);
        assert!(state.interval_ms > FallbackConfig::default().normal_interval_ms);
    }

    #[tokio::test]
    async fn partial_success_resets_health() {
        let store = Arc::new(MemoryStore::new());
        let ctl = controller(store.clone());

        for _ in 0..3 {
            ctl.record_batch_health(2, 2).await.unwrap();
        }
        ctl.record_batch_health(2, 1).await.unwrap();

        assert!(!ctl.is_fallback_mode(t0()).await.unwrap());
        assert_eq!(store.get(HEALTH_FAILURES_KEY).await.unwrap(), Some(0));
    }

    /// Counts one more failed batch right after the health counter is
    /// first read, like an overlapping invocation would.
    struct OverlappingFailure {
        inner: MemoryStore,
        fired: AtomicBool,
    }

    #[async_trait::async_trait]
    impl StateStore for OverlappingFailure {
        async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
            let value = self.inner.get(key).await?;
            if key == HEALTH_FAILURES_KEY && !self.fired.swap(true, Ordering::SeqCst) {
                self.inner.incr_by(key, 1).await?;
            }
            Ok(value)
        }

        async fn set(&self, key: &str, value: i64) -> Result<(), StoreError> {
            self.inner.set(key, value).await
        }

        async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
            self.inner.incr_by(key, delta).await
        }

        async fn compare_and_set(
            &self,
            key: &str,
            expected: Option<i64>,
            new: i64,
        ) -> Result<bool, StoreError> {
            self.inner.compare_and_set(key, expected, new).await
        }
    }

    #[tokio::test]
    async fn reset_does_not_clobber_a_concurrent_failure() {
        let store = Arc::new(OverlappingFailure {
            inner: MemoryStore::new(),
            fired: AtomicBool::new(false),
        });
        store.inner.set(HEALTH_FAILURES_KEY, 3).await.unwrap();
        let ctl = FallbackModeController::new(store.clone(), FallbackConfig::default());

        ctl.record_batch_health(2, 1).await.unwrap();

        assert_eq!(store.inner.get(HEALTH_FAILURES_KEY).await.unwrap(), Some(4));
        assert!(ctl.is_fallback_mode(t0()).await.unwrap());
    }

    #[tokio::test]
    async fn empty_batch_does_not_touch_health() {
        let store = Arc::new(MemoryStore::new());
        let ctl = controller(store.clone());
        ctl.record_batch_health(0, 0).await.unwrap();
        assert_eq!(store.get(HEALTH_FAILURES_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn throttles_inside_interval_only() {
        let store = Arc::new(MemoryStore::new());
        store.set(HEALTH_FAILURES_KEY, 5).await.unwrap();
        let ctl = controller(store);

        // Never collected in fallback yet: run now.
        assert!(!ctl.should_throttle_fallback(t0()).await.unwrap());

        ctl.mark_fallback_collection(t0()).await.unwrap();
        assert!(ctl.should_throttle_fallback(t0() + Duration::seconds(10)).await.unwrap());
        assert!(ctl.should_throttle_fallback(t0() + Duration::seconds(299)).await.unwrap());
        assert!(!ctl.should_throttle_fallback(t0() + Duration::seconds(300)).await.unwrap());
    }

    #[tokio::test]
    async fn mark_never_moves_backwards() {
        let store = Arc::new(MemoryStore::new());
        let ctl = controller(store.clone());

        ctl.mark_fallback_collection(t0() + Duration::minutes(5)).await.unwrap();
        ctl.mark_fallback_collection(t0()).await.unwrap();

        assert_eq!(
            store.get(LAST_COLLECTION_KEY).await.unwrap(),
            Some((t0() + Duration::minutes(5)).timestamp_millis())
        );
    }
}
