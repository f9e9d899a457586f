//! Shared test doubles.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::error::ProviderError;
use crate::notifier::{Notification, Notifier};
use crate::providers::adapter::{OddsProvider, RawPayload};
use crate::providers::horse::map_horse_payload;
use crate::schema::{OddsSnapshot, RaceMetadata, RaceStatus, RaceType};

/// One scripted answer of `ScriptedProvider`.
#[derive(Debug, Clone)]
pub enum Step {
    Payload(Value),
    Status(u16),
    /// Never answers within any sane timeout
    Hang,
}

/// Provider double answering from a per-race script.
///
/// The last step of a script repeats forever. Races without a
/// script answer HTTP 404. Payloads use the horse wire format.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, race_id: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(race_id.to_string(), steps);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, race_id: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == race_id).count()
    }

    fn next_step(&self, race_id: &str) -> Step {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(race_id) {
            Some(steps) if steps.len() > 1 => steps.remove(0),
            Some(steps) if steps.len() == 1 => steps[0].clone(),
            _ => Step::Status(404),
        }
    }
}

#[async_trait::async_trait]
impl OddsProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn fetch_odds(&self, race_id: &str) -> Result<RawPayload, ProviderError> {
        self.calls.lock().unwrap().push(race_id.to_string());

        match self.next_step(race_id) {
            Step::Payload(v) => Ok(v),
            Step::Status(status) => Err(ProviderError::Http {
                status,
                body: String::new(),
            }),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Err(ProviderError::Timeout("hang".into()))
            }
        }
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

/// Horse-format payload with one entry per `(number, win odds)`.
pub fn odds_payload(updated_at: &str, entries: &[(u32, f64)]) -> Value {
    let entries: Vec<Value> = entries
        .iter()
        .map(|(no, win)| json!({ "horseNumber": no, "win": win }))
        .collect();
    json!({ "updatedAt": updated_at, "entries": entries })
}

pub fn race(id: &str, race_type: RaceType, start: DateTime<Utc>) -> RaceMetadata {
    RaceMetadata {
        id: id.to_string(),
        race_date: start.date_naive(),
        start_time: Some(start),
        status: RaceStatus::Scheduled,
        race_type,
    }
}

/// Notifier double keeping every notification it receives.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: tokio::sync::Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    /// Records and then reports a delivery failure.
    pub fn failing() -> Self {
        Self {
            sent: Default::default(),
            fail: true,
        }
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sent.lock().await.push(notification.clone());
        if self.fail {
            anyhow::bail!("webhook returned HTTP 500");
        }
        Ok(())
    }
}
