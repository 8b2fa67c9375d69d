//! Delivery for `notifications` queue jobs.

use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::config::SyncConfig;

/// Whether a message actually left the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// No endpoint configured for the channel; message only logged.
    Logged,
}

pub struct Notifier {
    http: reqwest::Client,
    slack_webhook_url: Option<String>,
    email_api_url: Option<String>,
    email_api_key: Option<String>,
    email_from: String,
}

impl Notifier {
    pub fn new(
        slack_webhook_url: Option<String>,
        email_api_url: Option<String>,
        email_api_key: Option<String>,
        email_from: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            slack_webhook_url,
            email_api_url,
            email_api_key,
            email_from: email_from.into(),
        })
    }

    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        Self::new(
            config.slack_webhook_url.clone(),
            config.email_api_url.clone(),
            config.email_api_key.clone(),
            config.email_from.clone(),
        )
    }

    async fn post(&self, channel: &str, url: &str, body: &JsonValue, bearer: Option<&str>) -> anyhow::Result<()> {
        let mut request = self.http.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(channel, status = %status, body = %body, "notification endpoint returned non-success");
            anyhow::bail!("{channel} endpoint returned {status}");
        }
        Ok(())
    }

    pub async fn send_email(&self, to: &str, subject: &str, text: &str) -> anyhow::Result<Delivery> {
        let Some(url) = self.email_api_url.as_deref() else {
            info!(to, subject, "email endpoint not configured, logging message");
            return Ok(Delivery::Logged);
        };
        let body = json!({
            "from": self.email_from,
            "to": to,
            "subject": subject,
            "text": text,
        });
        self.post("email", url, &body, self.email_api_key.as_deref()).await?;
        Ok(Delivery::Sent)
    }

    pub async fn send_slack(&self, text: &str) -> anyhow::Result<Delivery> {
        let Some(url) = self.slack_webhook_url.as_deref() else {
            info!(text, "slack webhook not configured, logging message");
            return Ok(Delivery::Logged);
        };
        self.post("slack", url, &json!({ "text": text, "unfurl_links": false }), None)
            .await?;
        Ok(Delivery::Sent)
    }

    pub async fn send_webhook(&self, url: &str, payload: &JsonValue) -> anyhow::Result<Delivery> {
        if url.trim().is_empty() {
            info!("webhook job without url, logging payload");
            return Ok(Delivery::Logged);
        }
        self.post("webhook", url, payload, None).await?;
        Ok(Delivery::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_channels_log_instead_of_sending() {
        let notifier = Notifier::new(None, None, None, "alerts@gpuwatch.local").unwrap();
        assert_eq!(notifier.send_slack("hello").await.unwrap(), Delivery::Logged);
        assert_eq!(
            notifier.send_email("a@b.c", "subject", "body").await.unwrap(),
            Delivery::Logged
        );
        assert_eq!(
            notifier.send_webhook(" ", &json!({"k": 1})).await.unwrap(),
            Delivery::Logged
        );
    }
}
