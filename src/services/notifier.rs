//! Webhook delivery of job events.

use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::WebhookConfig;
use crate::domain::events::JobEvent;

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .user_agent(concat!("ldapguard/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build webhook client")?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    /// Flat JSON body: the event's own fields plus `event` and `timestamp`.
    #[must_use]
    pub fn payload(event: &JobEvent) -> serde_json::Value {
        let mut body = serde_json::to_value(event).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(map) = body.as_object_mut() {
            map.insert(
                "timestamp".to_string(),
                serde_json::Value::String(Utc::now().to_rfc3339()),
            );
        }
        body
    }

    pub async fn deliver(&self, event: &JobEvent) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&Self::payload(event))
            .send()
            .await
            .context("Webhook request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Webhook endpoint answered {status}");
        }
        Ok(())
    }

    /// Consumes the event bus until it closes. Failures are logged only.
    pub async fn run(self, mut events: broadcast::Receiver<JobEvent>) {
        info!(url = %self.url, "Webhook notifier started");
        loop {
            match events.recv().await {
                Ok(JobEvent::ScheduleMissedRun { .. }) => {}
                Ok(event) => {
                    if let Err(e) = self.deliver(&event).await {
                        warn!(event = event.name(), error = %e, "Webhook delivery failed");
                    } else {
                        debug!(event = event.name(), "Webhook delivered");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Webhook notifier lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
