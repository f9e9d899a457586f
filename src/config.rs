use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::retry::RetryOptions;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Loaded from an optional JSON file (`config.json` or the path in
// `ODDS_CONFIG`), then overridden from the environment.
//
// Every field has a default, so the file may be absent entirely:
// a bare `REDIS_URL=... CRON_SECRET=...` deployment works.
//
// NOTE:
// - Secrets (trigger secret, webhook URL) should come from the
//   environment, not from the file.
//
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub server: ServerConfig,

    pub trigger: TriggerConfig,

    pub redis: RedisConfig,

    pub providers: ProvidersConfig,

    pub collection: CollectionConfig,

    pub fallback: FallbackConfig,

    pub escalation: EscalationConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".into(),
        }
    }
}

// ------------------------------------------------------------
// Trigger configuration
// ------------------------------------------------------------
//
// `secret = None` disables bearer authentication (local / dev).
//
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerConfig {
    pub secret: Option<String>,

    /// Wall-clock budget of one invocation
    pub max_duration_secs: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            secret: None,
            max_duration_secs: 60,
        }
    }
}

impl TriggerConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisConfig {
    /// `None` runs on the in-memory stores
    pub url: Option<String>,

    pub connect_retries: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            connect_retries: 3,
        }
    }
}

// ------------------------------------------------------------
// Provider configuration
// ------------------------------------------------------------
//
// Provider A serves horse racing; provider B serves cycle and
// boat racing. Each carries its own timeout and retry policy.
//
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    pub horse: ProviderConfig,

    pub cycle_boat: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            horse: ProviderConfig {
                base_url: "http://127.0.0.1:9101".into(),
                timeout_ms: 5_000,
                retry: RetryPolicyConfig {
                    max_retries: 3,
                    initial_delay_ms: 500,
                    max_delay_ms: 4_000,
                    backoff_multiplier: 2.0,
                },
            },
            cycle_boat: ProviderConfig {
                base_url: "http://127.0.0.1:9102".into(),
                timeout_ms: 5_000,
                retry: RetryPolicyConfig {
                    max_retries: 2,
                    initial_delay_ms: 1_000,
                    max_delay_ms: 4_000,
                    backoff_multiplier: 2.0,
                },
            },
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub base_url: String,

    /// Per-call timeout, applied to every attempt
    pub timeout_ms: u64,

    pub retry: RetryPolicyConfig,
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Upper bound of one race's provider time: every attempt
    /// timing out plus every backoff at its cap.
    pub fn worst_case(&self) -> Duration {
        let attempts = self.retry.max_retries.saturating_add(1);
        self.timeout()
            .saturating_mul(attempts)
            .saturating_add(self.retry.to_options().worst_case_backoff())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicyConfig {
    pub fn to_options(&self) -> RetryOptions {
        RetryOptions {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            ..RetryOptions::default()
        }
    }
}

// ------------------------------------------------------------
// Collection / fallback / escalation
// ------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectionConfig {
    /// Races polled concurrently within one pass
    pub concurrency: usize,

    /// Delay before the second pass for races in their last 5 minutes
    pub second_pass_delay_ms: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            second_pass_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct FallbackConfig {
    /// Consecutive fully-failed batches before fallback engages
    pub failure_threshold: i64,

    /// Throttled cadence while in fallback
    pub interval_ms: i64,

    /// Normal trigger cadence
    pub normal_interval_ms: i64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            interval_ms: 300_000,
            normal_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct EscalationConfig {
    /// Reconciliation retries before a failure needs a human
    pub max_retries: u32,

    /// Slack-compatible incoming webhook; `None` disables notifications
    pub webhook_url: Option<String>,

    /// Open failures above this count turn the daily summary into a warning
    pub pending_warning_threshold: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            webhook_url: None,
            pending_warning_threshold: 10,
        }
    }
}

// ------------------------------------------------------------
// Loading
// ------------------------------------------------------------

impl Config {
    /// Reads the JSON file if present, applies the process
    /// environment and validates the result.
    pub fn load(path: &str) -> anyhow::Result<Config> {
        let mut cfg = if Path::new(path).exists() {
            let data = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path))?;
            serde_json::from_str(&data)
                .with_context(|| format!("failed to parse config file {}", path))?
        } else {
            Config::default()
        };

        cfg.apply_env(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies environment overrides read through `lookup`.
    ///
    /// Empty values count as unset, so `CRON_SECRET=` disables auth
    /// the same way an absent variable does.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(secret) = get("CRON_SECRET") {
            self.trigger.secret = Some(secret);
        }
        if let Some(secs) = get("MAX_DURATION_SECS").and_then(|v| v.trim().parse().ok()) {
            self.trigger.max_duration_secs = secs;
        }
        if let Some(url) = get("NOTIFY_WEBHOOK_URL") {
            self.escalation.webhook_url = Some(url);
        }
        if let Some(url) = get("REDIS_URL") {
            self.redis.url = Some(url);
        }
        if let Some(addr) = get("BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Some(url) = get("HORSE_PROVIDER_URL") {
            self.providers.horse.base_url = url;
        }
        if let Some(url) = get("CYCLE_BOAT_PROVIDER_URL") {
            self.providers.cycle_boat.base_url = url;
        }

        // Normalise "configured but blank" from the file as well
        if self.trigger.secret.as_deref().is_some_and(|s| s.trim().is_empty()) {
            self.trigger.secret = None;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.collection.concurrency == 0 {
            bail!("collection.concurrency must be at least 1");
        }
        if self.trigger.max_duration_secs == 0 {
            bail!("trigger.maxDurationSecs must be positive");
        }

        let budget = self.trigger.max_duration();
        for (name, provider) in [
            ("horse", &self.providers.horse),
            ("cycleBoat", &self.providers.cycle_boat),
        ] {
            if provider.timeout_ms == 0 {
                bail!("providers.{}.timeoutMs must be positive", name);
            }
            if provider.worst_case() >= budget {
                bail!(
                    "providers.{}: worst case {:?} does not fit the {:?} invocation budget",
                    name,
                    provider.worst_case(),
                    budget
                );
            }
        }
        Ok(())
    }
}
