//! Bounded retry with exponential backoff.
//!
//! Every upstream call goes through `with_retry`, usually via a
//! `RetryWrapper` that carries one provider's policy.
//!
//! BUDGET:
//! `max_retries × max_delay` of any policy must stay well below the
//! invocation budget. `Config::validate` enforces this at start-up.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::time::{Instant, sleep};

use crate::error::ProviderError;

/// Called before each backoff sleep with (attempt, error, delay).
pub type RetryHook = Arc<dyn Fn(u32, &anyhow::Error, Duration) + Send + Sync>;

/// Decides whether a failed attempt may be retried.
pub type RetryPredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

// ------------------------------------------------------------
// Options
// ------------------------------------------------------------

#[derive(Clone)]
pub struct RetryOptions {
    /// Retries after the first attempt. Total calls = max_retries + 1.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound of the random jitter, as a fraction of the
    /// computed delay. Zero disables jitter.
    pub jitter_ratio: f64,
    pub on_retry: Option<RetryHook>,
    pub is_retryable: RetryPredicate,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
            jitter_ratio: 0.1,
            on_retry: None,
            is_retryable: Arc::new(is_retryable_error),
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryOptions {
    /// Backoff before the retry that follows `attempt`.
    ///
    /// delay = min(initial × multiplier^(attempt-1) + jitter, max_delay)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);

        let jitter_ms = if self.jitter_ratio > 0.0 {
            base_ms * rand::random_range(0.0..self.jitter_ratio)
        } else {
            0.0
        };

        let capped = (base_ms + jitter_ms).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Worst-case time spent sleeping across all retries.
    pub fn worst_case_backoff(&self) -> Duration {
        self.max_delay.saturating_mul(self.max_retries)
    }

    /// Applies per-call overrides on top of these options.
    pub fn merged(&self, overrides: RetryOverrides) -> RetryOptions {
        RetryOptions {
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            initial_delay: overrides.initial_delay.unwrap_or(self.initial_delay),
            max_delay: overrides.max_delay.unwrap_or(self.max_delay),
            backoff_multiplier: overrides
                .backoff_multiplier
                .unwrap_or(self.backoff_multiplier),
            jitter_ratio: overrides.jitter_ratio.unwrap_or(self.jitter_ratio),
            on_retry: overrides.on_retry.or_else(|| self.on_retry.clone()),
            is_retryable: overrides
                .is_retryable
                .unwrap_or_else(|| self.is_retryable.clone()),
        }
    }
}

/// Per-call overrides. Unset fields fall back to the wrapper defaults.
#[derive(Clone, Default)]
pub struct RetryOverrides {
    pub max_retries: Option<u32>,
    pub initial_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub backoff_multiplier: Option<f64>,
    pub jitter_ratio: Option<f64>,
    pub on_retry: Option<RetryHook>,
    pub is_retryable: Option<RetryPredicate>,
}

// ------------------------------------------------------------
// Outcome
// ------------------------------------------------------------

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<anyhow::Error>,
    /// Calls made, always >= 1.
    pub attempts: u32,
    pub total_time_ms: u64,
}

impl<T> RetryOutcome<T> {
    /// Converts into a plain `Result`, keeping the attempt count.
    pub fn into_result(self) -> Result<(T, u32), (anyhow::Error, u32)> {
        match (self.data, self.error) {
            (Some(data), _) if self.success => Ok((data, self.attempts)),
            (_, Some(err)) => Err((err, self.attempts)),
            _ => Err((anyhow::anyhow!("retry outcome carried no data"), self.attempts)),
        }
    }
}

// ------------------------------------------------------------
// Executor
// ------------------------------------------------------------

/// Runs `operation` until it succeeds, fails with a non-retryable
/// error, or `max_retries` retries have been spent.
pub async fn with_retry<T, E, F, Fut>(mut operation: F, options: &RetryOptions) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<anyhow::Error>,
{
    let started = Instant::now();
    let mut attempt: u32 = 1;

    loop {
        match operation().await {
            Ok(data) => {
                return RetryOutcome {
                    success: true,
                    data: Some(data),
                    error: None,
                    attempts: attempt,
                    total_time_ms: started.elapsed().as_millis() as u64,
                };
            }
            Err(err) => {
                let err: anyhow::Error = err.into();

                if attempt > options.max_retries || !(options.is_retryable)(&err) {
                    return RetryOutcome {
                        success: false,
                        data: None,
                        error: Some(err),
                        attempts: attempt,
                        total_time_ms: started.elapsed().as_millis() as u64,
                    };
                }

                let delay = options.delay_for(attempt);
                if let Some(hook) = &options.on_retry {
                    hook(attempt, &err, delay);
                }
                debug!("attempt {} failed ({}), retrying in {:?}", attempt, err, delay);

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Retry executor bound to a default policy.
///
/// Each provider gets its own wrapper so call sites never repeat
/// the retry configuration.
#[derive(Clone, Debug, Default)]
pub struct RetryWrapper {
    defaults: RetryOptions,
}

pub fn create_retry_wrapper(defaults: RetryOptions) -> RetryWrapper {
    RetryWrapper { defaults }
}

impl RetryWrapper {
    pub fn options(&self) -> &RetryOptions {
        &self.defaults
    }

    pub async fn run<T, E, F, Fut>(&self, operation: F, overrides: RetryOverrides) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let options = self.defaults.merged(overrides);
        with_retry(operation, &options).await
    }
}

// ------------------------------------------------------------
// Default classification
// ------------------------------------------------------------

/// Substrings that mark an error as transient when no structured
/// status is available.
const RETRYABLE_MARKERS: [&str; 16] = [
    "429",
    "500",
    "502",
    "503",
    "504",
    "too many requests",
    "rate limit",
    "service unavailable",
    "bad gateway",
    "timeout",
    "timed out",
    "econnreset",
    "econnrefused",
    "etimedout",
    "network",
    "connection reset",
];

/// Default retryability check.
///
/// Looks for a structured status first (`ProviderError`,
/// `reqwest::Error`, elapsed timeouts) anywhere in the error chain,
/// then falls back to matching well-known status text in the message.
pub fn is_retryable_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(provider) = cause.downcast_ref::<ProviderError>() {
            return provider.is_retryable();
        }
        if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
            if http.is_timeout() || http.is_connect() {
                return true;
            }
            if let Some(status) = http.status() {
                return status.as_u16() == 429 || status.is_server_error();
            }
        }
        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return true;
        }
    }

    let message = format!("{:#}", err).to_lowercase();
    RETRYABLE_MARKERS.iter().any(|marker| message.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_options(max_retries: u32) -> RetryOptions {
        RetryOptions {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            backoff_multiplier: 2.0,
            jitter_ratio: 0.0,
            ..RetryOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_makes_max_retries_plus_one_calls() {
        let calls = AtomicU32::new(0);

        let outcome = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("HTTP 503 Service Unavailable")) }
            },
            &fast_options(4),
        )
        .await;

        assert!(!outcome.success);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(outcome.attempts, 5);
        assert!(outcome.error.unwrap().to_string().contains("503"));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeding_on_kth_call_reports_k_attempts() {
        let calls = AtomicU32::new(0);

        let outcome = with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(ProviderError::Network("connection reset".into()))
                    } else {
                        Ok(n)
                    }
                }
            },
            &fast_options(5),
        )
        .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.data, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_last_allowed_call() {
        let calls = AtomicU32::new(0);

        let outcome = with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= 2 {
                        Err(ProviderError::Timeout("slow".into()))
                    } else {
                        Ok(())
                    }
                }
            },
            &fast_options(2),
        )
        .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);

        let outcome = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(ProviderError::Http {
                        status: 404,
                        body: "no such race".into(),
                    })
                }
            },
            &fast_options(5),
        )
        .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recorded_delays_are_non_decreasing_and_capped() {
        let delays = Arc::new(Mutex::new(Vec::new()));
        let sink = delays.clone();

        let options = RetryOptions {
            on_retry: Some(Arc::new(move |_: u32, _: &anyhow::Error, delay: Duration| {
                sink.lock().unwrap().push(delay);
            })),
            ..fast_options(6)
        };

        let outcome = with_retry(
            || async { Err::<(), _>(ProviderError::Http { status: 502, body: String::new() }) },
            &options,
        )
        .await;

        let delays = delays.lock().unwrap().clone();
        assert_eq!(outcome.attempts, 7);
        assert_eq!(delays.len(), 6);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(1_000)));
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn total_time_spans_all_attempts() {
        let outcome = with_retry(
            || async { Err::<(), _>(anyhow::anyhow!("ETIMEDOUT")) },
            &fast_options(2),
        )
        .await;

        // 100ms + 200ms of backoff on the paused clock
        assert!(outcome.total_time_ms >= 300);
    }

    #[test]
    fn jitter_never_exceeds_max_delay() {
        let options = RetryOptions {
            jitter_ratio: 0.5,
            ..fast_options(10)
        };
        for attempt in 1..=10 {
            assert!(options.delay_for(attempt) <= options.max_delay);
        }
    }

    #[test]
    fn string_fallback_classification() {
        assert!(is_retryable_error(&anyhow::anyhow!("HTTP 429 Too Many Requests")));
        assert!(is_retryable_error(&anyhow::anyhow!("upstream said 503")));
        assert!(is_retryable_error(&anyhow::anyhow!("read ECONNRESET")));
        assert!(!is_retryable_error(&anyhow::anyhow!("invalid json at line 1")));
    }

    #[test]
    fn structured_status_wins_over_message_text() {
        // Message mentions 500 but the structured status says 400.
        let err = anyhow::Error::new(ProviderError::Http {
            status: 400,
            body: "field price=500 rejected".into(),
        });
        assert!(!is_retryable_error(&err));
    }

    #[tokio::test(start_paused = true)]
    async fn wrapper_merges_overrides_onto_defaults() {
        let wrapper = create_retry_wrapper(fast_options(5));
        let calls = AtomicU32::new(0);

        let outcome = wrapper
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(ProviderError::Network("down".into())) }
                },
                RetryOverrides {
                    max_retries: Some(1),
                    ..RetryOverrides::default()
                },
            )
            .await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(wrapper.options().max_retries, 5);
    }
}
