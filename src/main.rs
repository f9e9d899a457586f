// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:     Configuration structs loaded from JSON + environment
// - schema:     Race metadata, odds snapshots, failure records
// - util:       Shared helper utilities (time, race ids, auth)
// - error:      Error types per propagation layer
// - retry:      Bounded retry with exponential backoff
// - planner:    Collection window and cadence buckets
// - providers:  Odds provider adapters and the race-type table
// - store:      Durable stores (Redis) with an in-memory fallback
// - fallback:   Degraded-mode controller
// - escalation: Failure state machine, notifications, daily summary
// - notifier:   Outbound webhook notifications
// - collector:  Orchestrator (one batch) and runner (one invocation)
// - server:     HTTP trigger endpoints
//
mod config;
mod schema;
mod util;
mod error;
mod retry;
mod planner;
mod providers;
mod store;
mod fallback;
mod escalation;
mod notifier;
mod collector;
mod server;
mod metrics;
#[cfg(test)]
mod testkit;
// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use config::Config;
use collector::{CollectionRunner, OddsCollectionOrchestrator};
use escalation::{DailyCounters, FailureEscalationTracker};
use fallback::FallbackModeController;
use metrics::METRICS;
use notifier::WebhookNotifier;
use providers::ProviderTable;
use server::AppState;
use store::{FailureStore, MemoryStore, RaceSource, RedisStore, SnapshotStore, StateStore};

use anyhow::Context;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// The four store handles, all backed by one implementation.
struct Stores {
    state: Arc<dyn StateStore>,
    snapshots: Arc<dyn SnapshotStore>,
    races: Arc<dyn RaceSource>,
    failures: Arc<dyn FailureStore>,
}

impl Stores {
    fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: StateStore + SnapshotStore + RaceSource + FailureStore + 'static,
    {
        Self {
            state: backend.clone(),
            snapshots: backend.clone(),
            races: backend.clone(),
            failures: backend,
        }
    }
}

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// HTTP service for the race odds collector.
//
// Responsibilities:
// - Load configuration
// - Connect the durable stores (or fall back to memory)
// - Wire providers, tracker, orchestrator and runner
// - Serve the trigger endpoints until the process is stopped
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // --------------------------------------------------------
    // Load configuration
    //
    // NOTE:
    // - The file is optional; secrets come from the environment.
    // --------------------------------------------------------
    let config_path = std::env::var("ODDS_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let config = Config::load(&config_path)?;

    if config.trigger.secret.is_none() {
        warn!("CRON_SECRET not set: trigger authentication disabled");
    }

    // --------------------------------------------------------
    // Durable stores
    //
    // IMPORTANT:
    // The memory fallback keeps the service running, but state
    // no longer survives a restart or spans replicas.
    // --------------------------------------------------------
    let stores = match config.redis.url.as_deref() {
        Some(url) => match RedisStore::connect(url, config.redis.connect_retries).await {
            Ok(redis) => Stores::from_backend(Arc::new(redis)),
            Err(e) => {
                warn!("redis unreachable ({}), using in-memory stores", e);
                Stores::from_backend(Arc::new(MemoryStore::new()))
            }
        },
        None => {
            warn!("REDIS_URL not set, using in-memory stores");
            Stores::from_backend(Arc::new(MemoryStore::new()))
        }
    };

    // --------------------------------------------------------
    // Pipeline wiring
    // --------------------------------------------------------
    let http = reqwest::Client::builder()
        .user_agent(concat!("race-odds-collector/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let providers = ProviderTable::from_config(&config.providers, http.clone());

    let notifier = Arc::new(WebhookNotifier::new(
        http,
        config.escalation.webhook_url.clone(),
    ));
    if !notifier.is_configured() {
        info!("no notification webhook configured, alerts are logged only");
    }

    let tracker = Arc::new(FailureEscalationTracker::new(
        stores.failures.clone(),
        notifier,
        config.escalation.max_retries,
    ));

    let orchestrator = Arc::new(
        OddsCollectionOrchestrator::new(
            stores.races.clone(),
            providers,
            stores.snapshots.clone(),
            config.collection.concurrency,
        )
        .with_tracker(tracker.clone()),
    );

    let counters = DailyCounters::new(stores.state.clone());

    let runner = Arc::new(CollectionRunner::new(
        orchestrator.clone(),
        stores.races.clone(),
        FallbackModeController::new(stores.state.clone(), config.fallback.clone()),
        counters.clone(),
        Duration::from_millis(config.collection.second_pass_delay_ms),
        config.trigger.max_duration(),
    ));

    // --------------------------------------------------------
    // Start metrics reporter (periodic, low-noise)
    // --------------------------------------------------------
    tokio::spawn(async {
        loop {
            sleep(Duration::from_secs(60)).await;
            info!("[METRICS] {}", METRICS.report());
        }
    });

    // --------------------------------------------------------
    // Serve
    // --------------------------------------------------------
    let app = server::router(AppState {
        runner,
        orchestrator,
        tracker,
        counters,
        secret: config.trigger.secret.clone(),
        pending_warning_threshold: config.escalation.pending_warning_threshold,
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
    info!("listening on {}", config.server.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
