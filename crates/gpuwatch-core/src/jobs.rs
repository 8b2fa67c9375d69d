//! Job payloads exchanged over the durable queue.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    PricingFetch,
    Aggregates,
    Alerts,
    BrowserScrape,
    Notifications,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::PricingFetch,
        QueueName::Aggregates,
        QueueName::Alerts,
        QueueName::BrowserScrape,
        QueueName::Notifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PricingFetch => "pricing-fetch",
            Self::Aggregates => "aggregates",
            Self::Alerts => "alerts",
            Self::BrowserScrape => "browser-scrape",
            Self::Notifications => "notifications",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "queue",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitUntil {
    Load,
    #[serde(rename = "domcontentloaded")]
    DomContentLoaded,
    #[serde(rename = "networkidle0")]
    NetworkIdle0,
    #[serde(rename = "networkidle2")]
    NetworkIdle2,
}

impl WaitUntil {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::DomContentLoaded => "domcontentloaded",
            Self::NetworkIdle0 => "networkidle0",
            Self::NetworkIdle2 => "networkidle2",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserScrapeRequest {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<WaitUntil>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_html: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_resources: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl BrowserScrapeRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: None,
            wait_until: None,
            return_html: None,
            block_resources: None,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserScrapeResult {
    pub final_url: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

/// Every payload the workers understand, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobPayload {
    #[serde(rename_all = "camelCase")]
    PricingFetch { provider_slug: String },
    AlertMatch,
    Maintenance,
    BrowserScrape(BrowserScrapeRequest),
    Email {
        to: String,
        subject: String,
        text: String,
    },
    Slack {
        text: String,
    },
    Webhook {
        url: String,
        payload: JsonValue,
    },
}

impl JobPayload {
    /// Queue a payload is routed to.
    pub fn queue(&self) -> QueueName {
        match self {
            Self::PricingFetch { .. } => QueueName::PricingFetch,
            Self::AlertMatch => QueueName::Alerts,
            Self::Maintenance => QueueName::Aggregates,
            Self::BrowserScrape(_) => QueueName::BrowserScrape,
            Self::Email { .. } | Self::Slack { .. } | Self::Webhook { .. } => {
                QueueName::Notifications
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::PricingFetch { .. } => "pricing-fetch",
            Self::AlertMatch => "alert-match",
            Self::Maintenance => "maintenance",
            Self::BrowserScrape(_) => "browser-scrape",
            Self::Email { .. } => "email",
            Self::Slack { .. } => "slack",
            Self::Webhook { .. } => "webhook",
        }
    }
}
