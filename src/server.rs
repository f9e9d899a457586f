//! HTTP trigger surface.
//!
//! Routes:
//! - `GET /health`                       liveness, unauthenticated
//! - `GET /api/cron/collect-odds`        one collection invocation
//! - `GET /api/cron/reconcile-failures`  failure reconciliation pass
//! - `GET /api/cron/daily-summary`       daily summary (`?date=YYYY-MM-DD`)
//!
//! Every `/api/cron/*` route requires `Authorization: Bearer <secret>`
//! unless no secret is configured.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{NaiveDate, SecondsFormat, Utc};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::collector::{CollectionRunner, OddsCollectionOrchestrator};
use crate::error::{PipelineError, StoreError};
use crate::escalation::{DailyCounters, FailureEscalationTracker};
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::util::constant_time_eq;

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<CollectionRunner>,
    pub orchestrator: Arc<OddsCollectionOrchestrator>,
    pub tracker: Arc<FailureEscalationTracker>,
    pub counters: DailyCounters,
    /// `None` disables bearer authentication
    pub secret: Option<String>,
    pub pending_warning_threshold: usize,
}

pub fn router(state: AppState) -> Router {
    let cron = Router::new()
        .route("/collect-odds", get(collect_odds))
        .route("/reconcile-failures", get(reconcile_failures))
        .route("/daily-summary", get(daily_summary))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health", get(health))
        .nest("/api/cron", cron)
        .with_state(state)
}

// ------------------------------------------------------------
// Envelopes
// ------------------------------------------------------------

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Serialize)]
struct Envelope<T> {
    success: bool,
    data: T,
    timestamp: String,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
        timestamp: timestamp(),
    })
}

/// Failure envelope: `{success: false, error: {code, message}, timestamp}`.
///
/// Messages are safe for clients: internal causes are logged, never
/// returned.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "success": false,
                "error": { "code": self.code, "message": self.message },
                "timestamp": timestamp(),
            })),
        )
            .into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        error!("collection invocation failed: {}", err);
        match err {
            PipelineError::RaceListing(_) => ApiError::internal("race metadata unavailable"),
            PipelineError::State(_) => ApiError::internal("state store unavailable"),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!("store failure: {}", err);
        ApiError::internal("store unavailable")
    }
}

// ------------------------------------------------------------
// Authentication
// ------------------------------------------------------------

async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(secret) = state.secret.as_deref() else {
        return Ok(next.run(request).await);
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| constant_time_eq(token.trim().as_bytes(), secret.as_bytes()));

    if !authorized {
        warn!("rejected unauthenticated trigger on {}", request.uri().path());
        return Err(ApiError::unauthorized("invalid or missing bearer token"));
    }
    Ok(next.run(request).await)
}

// ------------------------------------------------------------
// Handlers
// ------------------------------------------------------------

/// Liveness only: a store outage reports `fallbackActive: null`
/// instead of failing the health check.
async fn health(State(state): State<AppState>) -> Json<Envelope<Value>> {
    let fallback = state.runner.fallback().is_fallback_mode(Utc::now()).await.ok();
    ok(json!({ "status": "ok", "fallbackActive": fallback }))
}

async fn collect_odds(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let summary = state.runner.run().await?;
    Ok(ok(summary))
}

async fn reconcile_failures(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    RuntimeMetrics::incr(&METRICS.reconcile_runs);

    let orchestrator = state.orchestrator.clone();
    let report = state
        .tracker
        .reconcile(move |race_id| {
            let orchestrator = orchestrator.clone();
            async move { orchestrator.collect_race(&race_id).await }
        })
        .await?;

    Ok(ok(report))
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    date: Option<String>,
}

async fn daily_summary(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let date = match query.date.as_deref() {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| ApiError::bad_request(format!("invalid date '{}', expected YYYY-MM-DD", raw)))?,
        None => Utc::now().date_naive(),
    };

    let summary = state.tracker.daily_summary(date, &state.counters).await?;
    let notification = state
        .tracker
        .send_daily_summary(&summary, state.pending_warning_threshold)
        .await;

    Ok(ok(json!({
        "summary": summary,
        "successRate": summary.success_rate_text(),
        "severity": notification.severity,
    })))
}
