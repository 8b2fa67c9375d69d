use std::sync::Arc;
use std::time::Duration;

use gpuwatch_core::jobs::{BrowserScrapeRequest, BrowserScrapeResult, JobPayload};
use gpuwatch_storage::{wait_for_job, EnqueueOptions, HttpFetcher, JobQueue};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::AdapterError;

/// HTTP and browser-render access for adapters.
///
/// `browser_html` does not render in process: it enqueues a `browser-scrape`
/// job and waits for a browser worker to complete it.
pub struct ScrapeClient {
    http: Arc<HttpFetcher>,
    queue: Option<Arc<dyn JobQueue>>,
    browser_wait: Duration,
    poll_every: Duration,
}

impl ScrapeClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            queue: None,
            browser_wait: Duration::from_secs(90),
            poll_every: Duration::from_millis(500),
        }
    }

    pub fn with_browser_queue(mut self, queue: Arc<dyn JobQueue>, wait: Duration) -> Self {
        self.queue = Some(queue);
        self.browser_wait = wait;
        self
    }

    pub fn with_poll_interval(mut self, poll_every: Duration) -> Self {
        self.poll_every = poll_every;
        self
    }

    pub async fn fetch_text(
        &self,
        provider: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<String, AdapterError> {
        Ok(self.http.get_text(provider, url, headers).await?)
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        provider: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<T, AdapterError> {
        Ok(self.http.get_json(provider, url, headers).await?)
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        provider: &str,
        url: &str,
        headers: &[(&str, &str)],
        body: &JsonValue,
    ) -> Result<T, AdapterError> {
        Ok(self.http.post_json(provider, url, headers, body).await?)
    }

    /// Renders `request.url` on a browser worker and returns the page HTML.
    pub async fn browser_html(&self, request: BrowserScrapeRequest) -> Result<String, AdapterError> {
        let queue = self.queue.as_ref().ok_or_else(|| {
            AdapterError::Message("browser-scrape queue is not configured".to_string())
        })?;
        let url = request.url.clone();
        let job_id = queue
            .enqueue(
                &JobPayload::BrowserScrape(request),
                EnqueueOptions {
                    max_attempts: Some(1),
                    ..EnqueueOptions::default()
                },
            )
            .await?;
        debug!(%job_id, url, "waiting on browser render");
        let value = wait_for_job(queue.as_ref(), job_id, self.browser_wait, self.poll_every).await?;
        let result = validate_browser_result(value)?;
        if result.status == 401 || result.status == 403 {
            return Err(AdapterError::Unauthorized(format!(
                "browser render of {url} returned {}",
                result.status
            )));
        }
        if result.status == 429 || result.status >= 500 {
            return Err(AdapterError::Upstream {
                status: result.status,
            });
        }
        result.html.ok_or_else(|| {
            AdapterError::BrowserScrapeInvalidResult(format!("no html returned for {url}"))
        })
    }
}

/// Checks the worker's result payload has the `{ finalUrl, status, html? }` shape.
pub fn validate_browser_result(
    value: Option<JsonValue>,
) -> Result<BrowserScrapeResult, AdapterError> {
    let value = value.ok_or_else(|| {
        AdapterError::BrowserScrapeInvalidResult("job completed without a result".to_string())
    })?;
    serde_json::from_value::<BrowserScrapeResult>(value)
        .map_err(|err| AdapterError::BrowserScrapeInvalidResult(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuwatch_core::jobs::QueueName;
    use gpuwatch_storage::{HttpClientConfig, MemoryJobQueue};
    use serde_json::json;

    fn client(queue: Arc<MemoryJobQueue>) -> ScrapeClient {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        ScrapeClient::new(http)
            .with_browser_queue(queue, Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(10))
    }

    async fn complete_next_browser_job(queue: Arc<MemoryJobQueue>, result: JsonValue) {
        loop {
            if let Some(job) = queue.claim(QueueName::BrowserScrape).await.unwrap() {
                queue.complete(job.id, Some(result)).await.unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn browser_round_trip_returns_rendered_html() {
        let queue = Arc::new(MemoryJobQueue::default());
        let worker = tokio::spawn(complete_next_browser_job(
            queue.clone(),
            json!({"finalUrl": "https://x/pricing", "status": 200, "html": "<div>ok</div>"}),
        ));
        let html = client(queue)
            .browser_html(BrowserScrapeRequest::new("https://x/pricing"))
            .await
            .unwrap();
        worker.await.unwrap();
        assert_eq!(html, "<div>ok</div>");
    }

    #[tokio::test]
    async fn malformed_worker_result_is_a_typed_failure() {
        let queue = Arc::new(MemoryJobQueue::default());
        let worker = tokio::spawn(complete_next_browser_job(
            queue.clone(),
            json!({"html": 42}),
        ));
        let err = client(queue)
            .browser_html(BrowserScrapeRequest::new("https://x/pricing"))
            .await
            .unwrap_err();
        worker.await.unwrap();
        assert_eq!(err.code(), "browser_scrape_invalid_result");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_worker_times_out() {
        let queue = Arc::new(MemoryJobQueue::default());
        let err = client(queue)
            .browser_html(BrowserScrapeRequest::new("https://x/pricing"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "timeout");
    }

    #[test]
    fn result_without_html_is_accepted_by_shape_check() {
        let result =
            validate_browser_result(Some(json!({"finalUrl": "https://x", "status": 200}))).unwrap();
        assert!(result.html.is_none());
        assert!(validate_browser_result(None).is_err());
    }
}
