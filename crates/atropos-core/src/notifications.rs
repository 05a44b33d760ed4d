//! Cut-event notifications.
//!
//! One event is dispatched per journal write. Delivery is best-effort: the
//! engine logs failures and never surfaces them to the alert sender. The
//! manager is configured from a JSON file named by
//! `ATROPOS_NOTIFICATIONS_CONFIG` and no-ops when disabled.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::history::CutRecord;

/// Environment variable naming the notification config file.
pub const NOTIFICATIONS_CONFIG_ENV: &str = "ATROPOS_NOTIFICATIONS_CONFIG";

const DEFAULT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub retries: u32,
}

/// What downstream consumers see about one cut.
#[derive(Debug, Clone, Serialize)]
pub struct CutEvent {
    pub id: String,
    pub node: String,
    pub action: String,
    pub success: bool,
    pub entropy: f64,
    pub latency_ms: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl CutEvent {
    pub fn from_record(record: &CutRecord) -> Self {
        Self {
            id: record.id.clone(),
            node: record.node.clone(),
            action: record.action.clone(),
            success: record.success,
            entropy: record.entropy,
            latency_ms: record.latency_ms,
            error: record.error.clone(),
            timestamp: record.timestamp,
            metadata: HashMap::new(),
        }
    }
}

/// A notification transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &CutEvent) -> Result<()>;
}

/// POSTs the event as JSON to a configured URL with bounded retries.
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("notification HTTP client")?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &CutEvent) -> Result<()> {
        if self.config.url.is_empty() {
            return Ok(());
        }

        let retries = if self.config.retries == 0 {
            DEFAULT_RETRIES
        } else {
            self.config.retries
        };

        let mut last_err = anyhow!("no attempt made");
        for attempt in 0..retries {
            let mut request = self
                .client
                .post(&self.config.url)
                .header("Content-Type", "application/json")
                .json(event);
            for (key, value) in &self.config.headers {
                request = request.header(key, value);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %self.config.url, node = %event.node, "cut notification delivered");
                    return Ok(());
                }
                Ok(response) => {
                    last_err = anyhow!("webhook returned status {}", response.status());
                }
                Err(e) => {
                    last_err = anyhow!(e);
                }
            }
            tokio::time::sleep(Duration::from_secs(u64::from(attempt) + 1)).await;
        }

        Err(anyhow!("webhook failed after {retries} retries: {last_err}"))
    }
}

/// Fans an event out to every transport, collecting failures.
#[derive(Default)]
pub struct CompositeNotifier {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl CompositeNotifier {
    pub fn new(notifiers: Vec<Box<dyn Notifier>>) -> Self {
        Self { notifiers }
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    async fn notify(&self, event: &CutEvent) -> Result<()> {
        let mut failures = Vec::new();
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(event).await {
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("notifications failed: {}", failures.join("; ")))
        }
    }
}

/// Gate in front of the transports: disabled config means every dispatch is
/// a no-op.
pub struct NotificationManager {
    config: NotificationConfig,
    notifier: CompositeNotifier,
}

impl NotificationManager {
    pub fn new(config: NotificationConfig) -> Result<Self> {
        let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();
        if config.enabled {
            if let Some(webhook) = config.webhook.clone() {
                notifiers.push(Box::new(WebhookNotifier::new(webhook)?));
            }
        }
        Ok(Self {
            config,
            notifier: CompositeNotifier::new(notifiers),
        })
    }

    /// Load the manager from a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read notification config {}", path.display()))?;
        let config: NotificationConfig =
            serde_json::from_str(&data).context("parse notification config")?;
        Self::new(config)
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Dispatch one event, stamping the originating service into metadata.
    pub async fn notify_cut(&self, mut event: CutEvent) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        event
            .metadata
            .insert("source".to_string(), "atropos".to_string());
        self.notifier.notify(&event).await
    }
}
