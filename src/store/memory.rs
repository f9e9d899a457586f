use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::schema::{IngestionFailure, OddsSnapshot, RaceMetadata, RaceStatus, SnapshotKey};

use super::{FailureStore, RaceSource, SnapshotStore, StateStore};

/// In-process implementation of every store trait.
///
/// Used when Redis is not configured or unreachable, and by tests.
///
/// LIMITATION:
/// - State lives only as long as the process. Two replicas using
///   memory stores do not see each other's fallback timestamps,
///   counters or snapshots.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, i64>>,
    snapshots: Mutex<BTreeMap<SnapshotKey, OddsSnapshot>>,
    races: Mutex<HashMap<String, RaceMetadata>>,
    failures: Mutex<HashMap<String, IngestionFailure>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds race metadata (the race-ingestion side of the contract).
    pub async fn put_race(&self, race: RaceMetadata) {
        self.races.lock().await.insert(race.id.clone(), race);
    }

    pub async fn snapshot_count(&self) -> usize {
        self.snapshots.lock().await.len()
    }

    pub async fn snapshots_for(&self, race_id: &str) -> Vec<OddsSnapshot> {
        self.snapshots
            .lock()
            .await
            .values()
            .filter(|s| s.race_id == race_id)
            .cloned()
            .collect()
    }

    pub async fn failure(&self, id: &str) -> Option<IngestionFailure> {
        self.failures.lock().await.get(id).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.values.lock().await.get(key).copied())
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut values = self.values.lock().await;
        let entry = values.entry(key.to_string()).or_insert(0);
        *entry += delta;
        Ok(*entry)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<i64>,
        new: i64,
    ) -> Result<bool, StoreError> {
        let mut values = self.values.lock().await;
        if values.get(key).copied() != expected {
            return Ok(false);
        }
        values.insert(key.to_string(), new);
        Ok(true)
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn insert_snapshots(&self, snapshots: &[OddsSnapshot]) -> Result<usize, StoreError> {
        let mut rows = self.snapshots.lock().await;
        let mut written = 0;
        for snapshot in snapshots {
            let key = snapshot.natural_key();
            if rows.contains_key(&key) {
                continue;
            }
            rows.insert(key, snapshot.clone());
            written += 1;
        }
        Ok(written)
    }
}

#[async_trait]
impl RaceSource for MemoryStore {
    async fn scheduled_races(&self, date: NaiveDate) -> Result<Vec<RaceMetadata>, StoreError> {
        let mut races: Vec<RaceMetadata> = self
            .races
            .lock()
            .await
            .values()
            .filter(|r| r.race_date == date && r.status == RaceStatus::Scheduled)
            .cloned()
            .collect();
        races.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(races)
    }

    async fn race(&self, id: &str) -> Result<Option<RaceMetadata>, StoreError> {
        Ok(self.races.lock().await.get(id).cloned())
    }
}

#[async_trait]
impl FailureStore for MemoryStore {
    async fn open_for(
        &self,
        job_type: &str,
        entity_id: &str,
    ) -> Result<Option<IngestionFailure>, StoreError> {
        Ok(self
            .failures
            .lock()
            .await
            .values()
            .find(|f| {
                f.job_type == job_type && f.entity_id == entity_id && !f.status.is_terminal()
            })
            .cloned())
    }

    async fn upsert(&self, failure: &IngestionFailure) -> Result<(), StoreError> {
        self.failures
            .lock()
            .await
            .insert(failure.id.clone(), failure.clone());
        Ok(())
    }

    async fn list_open(&self) -> Result<Vec<IngestionFailure>, StoreError> {
        let mut open: Vec<IngestionFailure> = self
            .failures
            .lock()
            .await
            .values()
            .filter(|f| !f.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|f| f.created_at);
        Ok(open)
    }

    async fn count_open(&self) -> Result<usize, StoreError> {
        Ok(self
            .failures
            .lock()
            .await
            .values()
            .filter(|f| !f.status.is_terminal())
            .count())
    }
}
