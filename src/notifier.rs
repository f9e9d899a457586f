use std::time::Duration;

use anyhow::{Result, bail};
use log::debug;
use serde::Serialize;
use serde_json::{Value, json};

/// ============================================================
/// Notifications
/// ============================================================
///
/// Outbound alerting for the failure-escalation tracker.
///
/// Design constraints:
/// - A missing webhook URL is a valid configuration: every send
///   becomes a silent no-op
/// - A failing webhook must never fail the pipeline; callers log
///   and move on
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Good,
    Info,
    Warning,
    Danger,
}

impl Severity {
    /// Slack attachment colour.
    pub fn color(&self) -> &'static str {
        match self {
            Severity::Good => "good",
            Severity::Info => "#439FE0",
            Severity::Warning => "warning",
            Severity::Danger => "danger",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

impl Notification {
    pub fn new(severity: Severity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            message: message.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((name.into(), value.to_string()));
        self
    }

    pub fn field_value(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Slack-compatible incoming-webhook notifier.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: Option<String>) -> Self {
        Self { client, url }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }
}

/// Renders a notification as a Slack attachment message.
pub fn webhook_payload(notification: &Notification) -> Value {
    let fields: Vec<Value> = notification
        .fields
        .iter()
        .map(|(title, value)| json!({ "title": title, "value": value, "short": true }))
        .collect();

    json!({
        "attachments": [{
            "color": notification.severity.color(),
            "title": notification.title,
            "text": notification.message,
            "fields": fields,
            "ts": chrono::Utc::now().timestamp(),
        }]
    })
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let Some(url) = &self.url else {
            debug!("notification skipped (no webhook): {}", notification.title);
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .timeout(Duration::from_secs(5))
            .json(&webhook_payload(notification))
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("webhook returned HTTP {}", response.status());
        }
        Ok(())
    }
}
