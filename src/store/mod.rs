//! Durable storage interfaces.
//!
//! The collector runs as short, stateless invocations. Anything that
//! must survive between two invocations goes through one of these
//! traits:
//!
//! - `StateStore`:    counters and timestamps (fallback, health, daily stats)
//! - `SnapshotStore`: append-only odds snapshots, idempotent by natural key
//! - `RaceSource`:    read-only race metadata owned by race ingestion
//! - `FailureStore`:  ingestion failure records
//!
//! Two backends implement all four: `RedisStore` (durable) and
//! `MemoryStore` (single-process fallback and tests).

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::StoreError;
use crate::schema::{IngestionFailure, OddsSnapshot, RaceMetadata};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;

    async fn set(&self, key: &str, value: i64) -> Result<(), StoreError>;

    /// Atomically adds `delta` and returns the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Writes `new` only if the current value equals `expected`
    /// (`None` = key absent). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<i64>,
        new: i64,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Inserts snapshots, skipping any whose natural key already
    /// exists. Returns the number of rows actually written.
    ///
    /// CONTRACT:
    /// - A natural-key collision is success, not an error.
    async fn insert_snapshots(&self, snapshots: &[OddsSnapshot]) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait RaceSource: Send + Sync {
    /// Races on `date` whose status is still `scheduled`.
    async fn scheduled_races(&self, date: NaiveDate) -> Result<Vec<RaceMetadata>, StoreError>;

    async fn race(&self, id: &str) -> Result<Option<RaceMetadata>, StoreError>;
}

#[async_trait]
pub trait FailureStore: Send + Sync {
    /// The non-terminal failure for an entity, if any.
    async fn open_for(
        &self,
        job_type: &str,
        entity_id: &str,
    ) -> Result<Option<IngestionFailure>, StoreError>;

    async fn upsert(&self, failure: &IngestionFailure) -> Result<(), StoreError>;

    async fn list_open(&self) -> Result<Vec<IngestionFailure>, StoreError>;

    async fn count_open(&self) -> Result<usize, StoreError>;
}

// ------------------------------------------------------------
// Key layout
// ------------------------------------------------------------

pub fn race_key(id: &str) -> String {
    format!("odds:race:{}", id)
}

pub fn races_by_date_key(date: NaiveDate) -> String {
    format!("odds:races:{}", date.format("%Y-%m-%d"))
}

pub fn snapshot_index_key(race_id: &str) -> String {
    format!("odds:snapshots:{}", race_id)
}

pub fn failure_key(id: &str) -> String {
    format!("odds:failure:{}", id)
}

pub fn failure_entity_key(job_type: &str, entity_id: &str) -> String {
    format!("odds:failures:entity:{}:{}", job_type, entity_id)
}

pub const OPEN_FAILURES_KEY: &str = "odds:failures:open";
