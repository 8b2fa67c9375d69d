//! Pipeline orchestration: fetch cycles, reconciliation, anomaly and alert
//! jobs, plus the worker pool and scheduler that drive them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gpuwatch_adapters::{AdapterRegistry, ScrapeClient};
use gpuwatch_storage::{CacheBackend, HttpFetcher, JobQueue, PipelineStore};

pub mod alerts;
pub mod anomaly;
pub mod breaker;
pub mod browser;
pub mod catalog;
pub mod config;
pub mod fetch_job;
pub mod maintenance;
pub mod notify;
pub mod reconcile;
pub mod scheduler;
pub mod worker;

pub use alerts::{AlertMatchReport, AlertMatcher};
pub use anomaly::{is_anomalous, AnomalyDetector, ANOMALY_THRESHOLD};
pub use breaker::{BreakerPolicy, BreakerState, CircuitBreaker, CircuitBreakerRegistry};
pub use browser::BrowserScrapeHandler;
pub use catalog::{Catalog, SeedReport};
pub use config::SyncConfig;
pub use fetch_job::{classify_failure, FetchJobError, FetchReport, PricingFetchJob, API_CACHE_PREFIX};
pub use maintenance::{MaintenanceJob, MaintenanceReport};
pub use notify::{Delivery, Notifier};
pub use reconcile::ReconciliationEngine;
pub use scheduler::PipelineScheduler;
pub use worker::{drain, process_next, JobHandler, PipelineHandler, WorkerPool};

pub const CRATE_NAME: &str = "gpuwatch-sync";

/// Scrape client whose browser renders go through `queue`.
pub fn scrape_client(config: &SyncConfig, queue: Arc<dyn JobQueue>) -> anyhow::Result<Arc<ScrapeClient>> {
    let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
    Ok(Arc::new(
        ScrapeClient::new(Arc::new(http))
            .with_browser_queue(queue, Duration::from_secs(config.browser_wait_secs)),
    ))
}

/// Wires every job component for a worker process. The breaker registry is
/// created here once and shared by all fetch jobs the process runs.
pub fn pipeline_handler(
    config: &SyncConfig,
    store: Arc<dyn PipelineStore>,
    queue: Arc<dyn JobQueue>,
    cache: Option<Arc<dyn CacheBackend>>,
) -> anyhow::Result<PipelineHandler> {
    let client = scrape_client(config, queue.clone())?;
    let mut fetch = PricingFetchJob::new(
        store.clone(),
        AdapterRegistry::with_default_adapters(),
        CircuitBreakerRegistry::new(),
        client,
        queue.clone(),
    )
    .with_adapter_timeout(config.adapter_timeout());
    if let Some(cache) = cache {
        fetch = fetch.with_cache(cache);
    }

    let browser = match config.browserless_url.as_deref() {
        Some(url) => Some(Arc::new(
            BrowserScrapeHandler::from_url(url, config.browserless_token.as_deref())
                .context("building browserless client")?,
        )),
        None => None,
    };

    Ok(PipelineHandler {
        fetch: Some(Arc::new(fetch)),
        alerts: Some(Arc::new(AlertMatcher::new(
            store.clone(),
            queue.clone(),
            &config.public_url,
        ))),
        maintenance: Some(Arc::new(MaintenanceJob::new(store, queue))),
        browser,
        notifier: Some(Arc::new(Notifier::from_config(config)?)),
    })
}
