use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use log::{info, warn};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::error::StoreError;
use crate::retry::{RetryOptions, with_retry};
use crate::schema::{IngestionFailure, OddsSnapshot, RaceMetadata, RaceStatus};

use super::{
    FailureStore, OPEN_FAILURES_KEY, RaceSource, SnapshotStore, StateStore, failure_entity_key,
    failure_key, race_key, races_by_date_key, snapshot_index_key,
};

/// SET NX every snapshot key; index only the keys actually written.
///
/// KEYS[i]      = snapshot storage key
/// ARGV[2i - 1] = snapshot JSON
/// ARGV[2i]     = per-race index list key
const INSERT_SNAPSHOTS_LUA: &str = r#"
local written = 0
for i, key in ipairs(KEYS) do
  if redis.call('SET', key, ARGV[2 * i - 1], 'NX') then
    redis.call('RPUSH', ARGV[2 * i], key)
    written = written + 1
  end
end
return written
"#;

/// ARGV[1] = expected value ("" = absent), ARGV[2] = new value
const COMPARE_AND_SET_LUA: &str = r#"
local current = redis.call('GET', KEYS[1])
if (current == false and ARGV[1] == '') or current == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

/// Redis-backed implementation of every store trait.
///
/// A `ConnectionManager` reconnects transparently; it is cheap to
/// clone, so every call works on its own handle.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects with bounded exponential backoff.
    pub async fn connect(url: &str, max_retries: u32) -> Result<Self, StoreError> {
        let options = RetryOptions {
            max_retries,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            is_retryable: Arc::new(|_: &anyhow::Error| true),
            on_retry: Some(Arc::new(|attempt: u32, err: &anyhow::Error, delay: Duration| {
                warn!(
                    "Redis connection attempt {} failed: {} – retry in {:?}",
                    attempt, err, delay
                );
            })),
            ..RetryOptions::default()
        };

        let outcome = with_retry(
            || async move {
                let client = redis::Client::open(url)?;
                Ok::<_, redis::RedisError>(ConnectionManager::new(client).await?)
            },
            &options,
        )
        .await;

        match outcome.into_result() {
            Ok((conn, attempts)) => {
                info!("Connected to Redis after {} attempt(s)", attempts);
                Ok(Self { conn })
            }
            Err((err, attempts)) => Err(StoreError::Unavailable(format!(
                "redis unreachable after {} attempt(s): {}",
                attempts, err
            ))),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn load_json<T: serde::de::DeserializeOwned>(
        &self,
        keys: &[String],
    ) -> Result<Vec<T>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;

        let mut out = Vec::with_capacity(raw.len());
        for (key, value) in keys.iter().zip(raw) {
            let Some(json) = value else {
                continue;
            };
            match serde_json::from_str(&json) {
                Ok(item) => out.push(item),
                Err(e) => warn!("skipping unreadable record {}: {}", key, e),
            }
        }
        Ok(out)
    }
}

// ------------------------------------------------------------
// Counters / timestamps
// ------------------------------------------------------------

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        let value: i64 = conn.incr(key, delta).await?;
        Ok(value)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<i64>,
        new: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let expected = expected.map(|v| v.to_string()).unwrap_or_default();
        let swapped: i64 = redis::Script::new(COMPARE_AND_SET_LUA)
            .key(key)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}

// ------------------------------------------------------------
// Snapshots
// ------------------------------------------------------------

#[async_trait]
impl SnapshotStore for RedisStore {
    async fn insert_snapshots(&self, snapshots: &[OddsSnapshot]) -> Result<usize, StoreError> {
        if snapshots.is_empty() {
            return Ok(0);
        }

        let script = redis::Script::new(INSERT_SNAPSHOTS_LUA);
        let mut invocation = script.prepare_invoke();
        for snapshot in snapshots {
            invocation
                .key(snapshot.storage_key())
                .arg(serde_json::to_string(snapshot)?)
                .arg(snapshot_index_key(&snapshot.race_id));
        }

        let mut conn = self.conn();
        let written: usize = invocation.invoke_async(&mut conn).await?;
        Ok(written)
    }
}

// ------------------------------------------------------------
// Races
// ------------------------------------------------------------

#[async_trait]
impl RaceSource for RedisStore {
    async fn scheduled_races(&self, date: NaiveDate) -> Result<Vec<RaceMetadata>, StoreError> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.smembers(races_by_date_key(date)).await?;
        let keys: Vec<String> = ids.iter().map(|id| race_key(id)).collect();

        let mut races: Vec<RaceMetadata> = self
            .load_json::<RaceMetadata>(&keys)
            .await?
            .into_iter()
            .filter(|r| r.status == RaceStatus::Scheduled)
            .collect();
        races.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        Ok(races)
    }

    async fn race(&self, id: &str) -> Result<Option<RaceMetadata>, StoreError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(race_key(id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

// ------------------------------------------------------------
// Ingestion failures
// ------------------------------------------------------------

#[async_trait]
impl FailureStore for RedisStore {
    async fn open_for(
        &self,
        job_type: &str,
        entity_id: &str,
    ) -> Result<Option<IngestionFailure>, StoreError> {
        let mut conn = self.conn();
        let id: Option<String> = conn.get(failure_entity_key(job_type, entity_id)).await?;
        let Some(id) = id else {
            return Ok(None);
        };

        let raw: Option<String> = conn.get(failure_key(&id)).await?;
        let Some(json) = raw else {
            return Ok(None);
        };

        let failure: IngestionFailure = serde_json::from_str(&json)?;
        Ok((!failure.status.is_terminal()).then_some(failure))
    }

    async fn upsert(&self, failure: &IngestionFailure) -> Result<(), StoreError> {
        let json = serde_json::to_string(failure)?;
        let entity_key = failure_entity_key(&failure.job_type, &failure.entity_id);

        let mut pipe = redis::pipe();
        pipe.atomic().set(failure_key(&failure.id), json).ignore();

        if failure.status.is_terminal() {
            pipe.srem(OPEN_FAILURES_KEY, &failure.id)
                .ignore()
                .del(&entity_key)
                .ignore();
        } else {
            pipe.sadd(OPEN_FAILURES_KEY, &failure.id)
                .ignore()
                .set(&entity_key, &failure.id)
                .ignore();
        }

        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn list_open(&self) -> Result<Vec<IngestionFailure>, StoreError> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.smembers(OPEN_FAILURES_KEY).await?;
        let keys: Vec<String> = ids.iter().map(|id| failure_key(id)).collect();

        let mut open: Vec<IngestionFailure> = self
            .load_json::<IngestionFailure>(&keys)
            .await?
            .into_iter()
            .filter(|f| !f.status.is_terminal())
            .collect();
        open.sort_by_key(|f| f.created_at);
        Ok(open)
    }

    async fn count_open(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        let count: usize = conn.scard(OPEN_FAILURES_KEY).await?;
        Ok(count)
    }
}
