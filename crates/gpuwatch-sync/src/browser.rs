use gpuwatch_core::jobs::BrowserScrapeRequest;
use gpuwatch_storage::{BrowserlessClient, BrowserlessError};
use serde_json::Value as JsonValue;
use tracing::{info_span, Instrument};

/// Serves `browser-scrape` jobs by rendering through Browserless.
pub struct BrowserScrapeHandler {
    client: BrowserlessClient,
}

impl BrowserScrapeHandler {
    pub fn new(client: BrowserlessClient) -> Self {
        Self { client }
    }

    pub fn from_url(base_url: &str, token: Option<&str>) -> Result<Self, BrowserlessError> {
        Ok(Self::new(BrowserlessClient::new(base_url, token)?))
    }

    /// Returns the `{ finalUrl, status, html? }` result stored on the job.
    pub async fn render(&self, request: &BrowserScrapeRequest) -> anyhow::Result<JsonValue> {
        let span = info_span!("browser_scrape", url = %request.url);
        let result = self.client.content(request).instrument(span).await?;
        Ok(serde_json::to_value(result)?)
    }
}
