use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{error::ProviderError, schema::OddsSnapshot, util};

use super::adapter::{OddsProvider, RawPayload, get_json};

/// Horse racing odds provider (provider A)
///
/// REST endpoint:
/// GET {base}/v1/races/{raceId}/odds
///
/// Payload (camelCase):
/// - updatedAt: odds timestamp (RFC 3339)
/// - pools:     { total, win, place }
/// - entries:   [{ horseNumber, win, placeMin, placeMax, popularity }]
///
/// DESIGN:
/// - Pure protocol translation
/// - No retry logic (handled by the provider table's policy)
/// - No storage logic
pub struct HorseOddsProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HorseOddsProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HorsePayload {
    updated_at: Option<String>,

    #[serde(default)]
    pools: Option<HorsePools>,

    #[serde(default)]
    entries: Vec<HorseEntry>,
}

#[derive(Debug, Deserialize)]
struct HorsePools {
    total: Option<i64>,
    win: Option<i64>,
    place: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HorseEntry {
    horse_number: u32,

    /// Missing for scratched horses
    win: Option<f64>,

    place_min: Option<f64>,

    popularity: Option<u32>,
}

#[async_trait::async_trait]
impl OddsProvider for HorseOddsProvider {

    fn name(&self) -> &'static str {
        "horse"
    }

    async fn fetch_odds(&self, race_id: &str) -> Result<RawPayload, ProviderError> {
        if !util::is_valid_race_id(race_id) {
            return Err(ProviderError::InvalidRaceId(race_id.to_string()));
        }

        let url = format!("{}/v1/races/{}/odds", self.base_url, race_id);
        get_json(self.client.get(url)).await
    }

    fn map_snapshots(
        &self,
        race_id: &str,
        raw: &RawPayload,
        collected_at: DateTime<Utc>,
    ) -> Result<Vec<OddsSnapshot>, ProviderError> {
        map_horse_payload(race_id, raw, collected_at)
    }
}

/// Maps a provider A payload into snapshots.
///
/// - Snapshot time: `updatedAt` when parseable, else the collection
///   time truncated to the second
/// - Scratched entries (no or non-positive win odds) are skipped
/// - `placeOdds` takes the lower bound of the place range
pub fn map_horse_payload(
    race_id: &str,
    raw: &RawPayload,
    collected_at: DateTime<Utc>,
) -> Result<Vec<OddsSnapshot>, ProviderError> {
    let payload: HorsePayload = serde_json::from_value(raw.clone())
        .map_err(|e| ProviderError::InvalidPayload(format!("horse payload: {}", e)))?;

    let time = payload
        .updated_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| util::truncate_to_second(collected_at));

    let (pool_total, pool_win, pool_place) = match &payload.pools {
        Some(p) => (p.total, p.win, p.place),
        None => (None, None, None),
    };

    Ok(payload
        .entries
        .iter()
        .filter_map(|entry| {
            let win = entry.win.filter(|w| *w > 0.0)?;
            Some(OddsSnapshot {
                race_id: race_id.to_string(),
                time,
                entry_no: entry.horse_number,
                win_odds: win,
                place_odds: entry.place_min,
                pool_total,
                pool_win,
                pool_place,
                popularity_rank: entry.popularity,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::get};
    use chrono::TimeZone;
    use serde_json::json;

    fn fixture() -> RawPayload {
        json!({
            "raceId": "202610170511",
            "updatedAt": "2026-10-17T05:40:00Z",
            "pools": { "total": 1_250_000_000i64, "win": 410_000_000i64, "place": 380_000_000i64 },
            "entries": [
                { "horseNumber": 1, "win": 3.4, "placeMin": 1.3, "placeMax": 1.8, "popularity": 2 },
                { "horseNumber": 2, "win": 12.7, "placeMin": 2.9, "placeMax": 4.4, "popularity": 5 },
                { "horseNumber": 3, "win": null, "popularity": null }
            ]
        })
    }

    fn collected() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 5, 41, 12).unwrap()
    }

    #[test]
    fn maps_entries_and_skips_scratched() {
        let snaps = map_horse_payload("202610170511", &fixture(), collected()).unwrap();

        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].entry_no, 1);
        assert_eq!(snaps[0].win_odds, 3.4);
        assert_eq!(snaps[0].place_odds, Some(1.3));
        assert_eq!(snaps[0].popularity_rank, Some(2));
        assert_eq!(snaps[0].pool_total, Some(1_250_000_000));
        assert_eq!(snaps[1].pool_place, Some(380_000_000));
        assert_eq!(
            snaps[0].time,
            Utc.with_ymd_and_hms(2026, 10, 17, 5, 40, 0).unwrap()
        );
    }

    #[test]
    fn falls_back_to_collection_time() {
        let raw = json!({ "entries": [{ "horseNumber": 4, "win": 8.0 }] });
        let snaps = map_horse_payload("R1", &raw, collected()).unwrap();
        assert_eq!(snaps[0].time, collected());
        assert_eq!(snaps[0].pool_win, None);
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let raw = json!({ "entries": "not-a-list" });
        let err = map_horse_payload("R1", &raw, collected()).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidPayload(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn empty_entries_map_to_nothing() {
        let raw = json!({ "updatedAt": "2026-10-17T05:40:00Z", "entries": [] });
        assert!(map_horse_payload("R1", &raw, collected()).unwrap().is_empty());
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn fetches_payload_over_http() {
        let app = Router::new().route(
            "/v1/races/{id}/odds",
            get(|| async { Json(fixture()) }),
        );
        let provider = HorseOddsProvider::new(reqwest::Client::new(), serve(app).await);

        let raw = provider.fetch_odds("202610170511").await.unwrap();
        let snaps = provider
            .map_snapshots("202610170511", &raw, collected())
            .unwrap();
        assert_eq!(snaps.len(), 2);
    }

    #[tokio::test]
    async fn upstream_5xx_is_structured_and_retryable() {
        let app = Router::new().route(
            "/v1/races/{id}/odds",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        );
        let provider = HorseOddsProvider::new(reqwest::Client::new(), serve(app).await);

        let err = provider.fetch_odds("R1").await.unwrap_err();
        match &err {
            ProviderError::Http { status, body } => {
                assert_eq!(*status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_race_id_fails_without_io() {
        let provider = HorseOddsProvider::new(reqwest::Client::new(), "http://127.0.0.1:1");
        let err = provider.fetch_odds("../admin").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRaceId(_)));
    }
}
