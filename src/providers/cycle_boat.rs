use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{error::ProviderError, schema::OddsSnapshot, util};

use super::adapter::{OddsProvider, RawPayload, get_json};

/// Cycle and boat racing odds provider (provider B)
///
/// REST endpoint:
/// GET {base}/odds?race={raceId}
///
/// The board API publishes every number as a string and marks
/// scratched entries with "-" (or an empty string).
///
/// Channels:
/// - odds[].win  → win odds
/// - odds[].show → place odds
pub struct CycleBoatOddsProvider {
    client: reqwest::Client,
    base_url: String,
}

impl CycleBoatOddsProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BoardPayload {
    /// Odds timestamp, Unix milliseconds
    ts: Option<i64>,

    totals: Option<BoardTotals>,

    #[serde(default)]
    odds: Vec<BoardEntry>,
}

#[derive(Debug, Deserialize)]
struct BoardTotals {
    all: Option<i64>,
    win: Option<i64>,
    show: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct BoardEntry {
    no: String,
    win: Option<String>,
    show: Option<String>,
    rank: Option<String>,
}

#[async_trait::async_trait]
impl OddsProvider for CycleBoatOddsProvider {

    fn name(&self) -> &'static str {
        "cycle_boat"
    }

    async fn fetch_odds(&self, race_id: &str) -> Result<RawPayload, ProviderError> {
        if !util::is_valid_race_id(race_id) {
            return Err(ProviderError::InvalidRaceId(race_id.to_string()));
        }

        let request = self
            .client
            .get(format!("{}/odds", self.base_url))
            .query(&[("race", race_id)]);
        get_json(request).await
    }

    fn map_snapshots(
        &self,
        race_id: &str,
        raw: &RawPayload,
        collected_at: DateTime<Utc>,
    ) -> Result<Vec<OddsSnapshot>, ProviderError> {
        map_board_payload(race_id, raw, collected_at)
    }
}

/// "-", "" and unparseable values all mean "no value".
fn board_number<T: std::str::FromStr>(raw: Option<&str>) -> Option<T> {
    let raw = raw?.trim();
    if raw.is_empty() || raw == "-" {
        return None;
    }
    raw.parse().ok()
}

/// Maps a provider B payload into snapshots.
///
/// - Snapshot time: `ts` when present, else the collection time
///   truncated to the second
/// - An entry number that is not numeric rejects the whole payload
pub fn map_board_payload(
    race_id: &str,
    raw: &RawPayload,
    collected_at: DateTime<Utc>,
) -> Result<Vec<OddsSnapshot>, ProviderError> {
    let payload: BoardPayload = serde_json::from_value(raw.clone())
        .map_err(|e| ProviderError::InvalidPayload(format!("board payload: {}", e)))?;

    let time = payload
        .ts
        .and_then(util::from_millis)
        .unwrap_or_else(|| util::truncate_to_second(collected_at));

    let (pool_total, pool_win, pool_place) = match &payload.totals {
        Some(t) => (t.all, t.win, t.show),
        None => (None, None, None),
    };

    let mut snapshots = Vec::with_capacity(payload.odds.len());
    for entry in &payload.odds {
        let entry_no: u32 = entry.no.trim().parse().map_err(|_| {
            ProviderError::InvalidPayload(format!("board entry number '{}'", entry.no))
        })?;

        let Some(win) = board_number::<f64>(entry.win.as_deref()).filter(|w| *w > 0.0) else {
            continue;
        };

        snapshots.push(OddsSnapshot {
            race_id: race_id.to_string(),
            time,
            entry_no,
            win_odds: win,
            place_odds: board_number(entry.show.as_deref()),
            pool_total,
            pool_win,
            pool_place,
            popularity_rank: board_number(entry.rank.as_deref()),
        });
    }

    Ok(snapshots)
}
