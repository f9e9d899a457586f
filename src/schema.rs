use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// ------------------------------------------------------------
// Race metadata
// ------------------------------------------------------------
//
// Read-only view of a race as published by the race-ingestion
// service. This collector never writes races; it only reads
// them to decide what to poll and which provider to use.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RaceMetadata {
    pub id: String,

    pub race_date: NaiveDate,

    /// Scheduled start time.
    ///
    /// NOTE:
    /// Upstream occasionally publishes empty or malformed start
    /// times. Those deserialize to `None` and the race is simply
    /// never selected for collection.
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub start_time: Option<DateTime<Utc>>,

    pub status: RaceStatus,

    pub race_type: RaceType,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RaceStatus {
    Scheduled,
    InProgress,
    Finished,
    Cancelled,
}

/// Race discipline. Selects the upstream odds provider.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RaceType {
    Horse,
    Cycle,
    Boat,
}

impl RaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaceType::Horse => "horse",
            RaceType::Cycle => "cycle",
            RaceType::Boat => "boat",
        }
    }
}

fn lenient_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| {
        DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }))
}

// ------------------------------------------------------------
// Odds snapshot
// ------------------------------------------------------------
//
// One timestamped recording of the market odds for one entry
// in one race.
//
// IMPORTANT:
// - Snapshots are append-only. Nothing in this service updates
//   or deletes them.
// - The natural key is (race_id, time, entry_no). A second write
//   with the same key is a no-op, never an error.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OddsSnapshot {
    pub race_id: String,

    /// Odds timestamp (upstream time when available, otherwise
    /// the collection time truncated to the second).
    pub time: DateTime<Utc>,

    /// Entry (post / car / boat) number within the race
    pub entry_no: u32,

    pub win_odds: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_odds: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_total: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_win: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_place: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub popularity_rank: Option<u32>,
}

/// Natural key of a snapshot: (race id, unix millis, entry number).
pub type SnapshotKey = (String, i64, u32);

impl OddsSnapshot {
    pub fn natural_key(&self) -> SnapshotKey {
        (self.race_id.clone(), self.time.timestamp_millis(), self.entry_no)
    }

    /// Flat storage key derived from the natural key.
    pub fn storage_key(&self) -> String {
        format!(
            "odds:snapshot:{}:{}:{}",
            self.race_id,
            self.time.timestamp_millis(),
            self.entry_no
        )
    }
}

// ------------------------------------------------------------
// Ingestion failure
// ------------------------------------------------------------
//
// Durable record of a race whose odds could not be collected.
//
// LIFECYCLE:
//   pending -> retrying -> resolved            (terminal)
//                       -> maxRetriesExceeded  (terminal)
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestionFailure {
    pub id: String,

    /// Pipeline that produced the failure (e.g. "odds_collection")
    pub job_type: String,

    /// Failing entity, a race id for odds collection
    pub entity_id: String,

    /// Last error message seen for this entity
    pub error: String,

    pub retry_count: u32,

    pub max_retries: u32,

    pub status: FailureStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FailureStatus {
    Pending,
    Retrying,
    Resolved,
    MaxRetriesExceeded,
}

impl FailureStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureStatus::Resolved | FailureStatus::MaxRetriesExceeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_start_time_deserializes_to_none() {
        let raw = r#"{
            "id": "R1",
            "raceDate": "2026-10-17",
            "startTime": "not-a-time",
            "status": "scheduled",
            "raceType": "horse"
        }"#;

        let race: RaceMetadata = serde_json::from_str(raw).unwrap();
        assert_eq!(race.start_time, None);
        assert_eq!(race.status, RaceStatus::Scheduled);
    }

    #[test]
    fn missing_start_time_deserializes_to_none() {
        let raw = r#"{
            "id": "R2",
            "raceDate": "2026-10-17",
            "status": "in_progress",
            "raceType": "boat"
        }"#;

        let race: RaceMetadata = serde_json::from_str(raw).unwrap();
        assert_eq!(race.start_time, None);
        assert_eq!(race.race_type, RaceType::Boat);
    }

    #[test]
    fn failure_status_wire_names() {
        let json = serde_json::to_string(&FailureStatus::MaxRetriesExceeded).unwrap();
        assert_eq!(json, "\"maxRetriesExceeded\"");
        assert!(FailureStatus::Resolved.is_terminal());
        assert!(!FailureStatus::Retrying.is_terminal());
    }

    #[test]
    fn storage_key_follows_natural_key() {
        let snap = OddsSnapshot {
            race_id: "R1".into(),
            time: DateTime::parse_from_rfc3339("2026-10-17T05:40:00Z")
                .unwrap()
                .with_timezone(&Utc),
            entry_no: 7,
            win_odds: 3.4,
            place_odds: None,
            pool_total: None,
            pool_win: None,
            pool_place: None,
            popularity_rank: None,
        };

        let (race, millis, entry) = snap.natural_key();
        assert_eq!(race, "R1");
        assert_eq!(entry, 7);
        assert_eq!(snap.storage_key(), format!("odds:snapshot:R1:{}:7", millis));
    }
}
