use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::ProviderError;
use crate::schema::OddsSnapshot;

/// Raw provider response, kept untyped until the provider's mapping
/// function turns it into snapshots.
pub type RawPayload = Value;

/// Longest slice of an error body kept in `ProviderError::Http`.
const MAX_ERROR_BODY: usize = 200;

/// OddsProvider is the boundary between:
/// - The generic collection orchestrator
/// - One upstream odds API
///
/// Each provider must:
/// - Fetch the raw odds payload for one race
/// - Map that payload into normalized `OddsSnapshot`s
///
/// DESIGN GOALS:
/// - Zero provider-specific logic outside provider modules
/// - Mapping stays pure so it can be tested against fixtures
/// - Retry policy lives in the provider table, not here
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - Provider instances are shared across concurrent race tasks
///
#[async_trait::async_trait]
pub trait OddsProvider: Send + Sync {

    /// Stable provider identifier used in logs and errors.
    fn name(&self) -> &'static str;

    /// Fetches the current odds payload for one race.
    ///
    /// ERRORS:
    /// - Transient failures (network, timeout, 5xx, 429) must be
    ///   reported with their structured variant so the retry
    ///   executor can classify them.
    ///
    async fn fetch_odds(&self, race_id: &str) -> Result<RawPayload, ProviderError>;

    /// Maps a raw payload into zero or more snapshots.
    ///
    /// IMPORTANT:
    /// - Must be pure: no I/O, no clock reads (`collected_at` is
    ///   passed in)
    /// - Must never panic on malformed input
    ///
    fn map_snapshots(
        &self,
        race_id: &str,
        raw: &RawPayload,
        collected_at: DateTime<Utc>,
    ) -> Result<Vec<OddsSnapshot>, ProviderError>;
}

/// Shared HTTP GET → JSON helper for providers.
///
/// Non-2xx responses become `ProviderError::Http` carrying the
/// status code and a truncated body.
pub async fn get_json(
    request: reqwest::RequestBuilder,
) -> Result<RawPayload, ProviderError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let mut body = body;
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        return Err(ProviderError::Http {
            status: status.as_u16(),
            body,
        });
    }

    serde_json::from_str(&body).map_err(|e| ProviderError::InvalidPayload(e.to_string()))
}
