use std::time::Duration;

use gpuwatch_core::jobs::{BrowserScrapeRequest, BrowserScrapeResult};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BrowserlessError {
    #[error("network error: {0}")]
    Network(String),
    #[error("browserless api error (status {status}): {message}")]
    Api { status: u16, message: String },
}

impl From<reqwest::Error> for BrowserlessError {
    fn from(err: reqwest::Error) -> Self {
        BrowserlessError::Network(err.to_string())
    }
}

const DEFAULT_RENDER_TIMEOUT_MS: u64 = 30_000;

/// HTTP client for a Browserless `/content` endpoint.
pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserlessClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self, BrowserlessError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        })
    }

    /// Render a page and return its final HTML and upstream status.
    pub async fn content(
        &self,
        request: &BrowserScrapeRequest,
    ) -> Result<BrowserScrapeResult, BrowserlessError> {
        let mut endpoint = format!("{}/content", self.base_url);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }

        let resp = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .json(&content_body(request))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let upstream_status = resp
            .headers()
            .get("x-response-code")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(status.as_u16());
        let final_url = resp
            .headers()
            .get("x-response-url")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| request.url.clone());
        let html = resp.text().await?;
        debug!(url = %request.url, upstream_status, bytes = html.len(), "browserless render complete");

        Ok(BrowserScrapeResult {
            final_url,
            status: upstream_status,
            html: request.return_html.unwrap_or(true).then_some(html),
        })
    }
}

fn content_body(request: &BrowserScrapeRequest) -> JsonValue {
    let mut body = json!({
        "url": request.url,
        "gotoOptions": {
            "timeout": request.timeout_ms.unwrap_or(DEFAULT_RENDER_TIMEOUT_MS),
            "waitUntil": request.wait_until.map(|w| w.as_str()).unwrap_or("networkidle2"),
        },
    });
    if request.block_resources.unwrap_or(false) {
        body["rejectResourceTypes"] = json!(["image", "media", "font", "stylesheet"]);
    }
    if let Some(user_agent) = &request.user_agent {
        body["userAgent"] = json!(user_agent);
    }
    body
}
