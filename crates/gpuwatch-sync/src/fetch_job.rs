//! One provider's pricing-fetch cycle: scrape job bookkeeping, adapter call
//! through the breaker, reconciliation, anomaly detection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gpuwatch_adapters::{AdapterContext, AdapterError, AdapterRegistry, ScrapeClient};
use gpuwatch_core::jobs::JobPayload;
use gpuwatch_core::{PricingInstance, Provider, ReconcileCounts, ScrapeJobOutcome, ScrapeStatus};
use gpuwatch_storage::{CacheBackend, EnqueueOptions, JobQueue, PipelineStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{field, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::anomaly::{operator_summary, AnomalyDetector};
use crate::breaker::{BreakerError, CircuitBreakerRegistry};
use crate::reconcile::ReconciliationEngine;

/// Key prefix shared by every cached read API response.
pub const API_CACHE_PREFIX: &str = "api:";

#[derive(Debug, Error)]
pub enum FetchJobError {
    #[error("provider_not_found:{0}")]
    ProviderNotFound(String),
    #[error("adapter_not_found:{0}")]
    AdapterNotFound(String),
    #[error("circuit_open:{0}")]
    CircuitOpen(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("adapter timeout after {0:?}")]
    AdapterTimeout(Duration),
    #[error("empty_result: adapter returned no instances")]
    EmptyResult,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl FetchJobError {
    pub fn code(&self) -> String {
        match self {
            Self::ProviderNotFound(_) => "provider_not_found".to_string(),
            Self::AdapterNotFound(_) => "adapter_not_found".to_string(),
            Self::CircuitOpen(_) => "circuit_open".to_string(),
            Self::Adapter(err) => err.code(),
            Self::AdapterTimeout(_) => "timeout".to_string(),
            Self::EmptyResult => "empty_result".to_string(),
            Self::Store(_) => "store_error".to_string(),
        }
    }

    pub fn status(&self) -> ScrapeStatus {
        classify_failure(&self.code(), &self.to_string())
    }
}

/// Coarse scrape status for a failure, by inspecting its code and message.
pub fn classify_failure(code: &str, message: &str) -> ScrapeStatus {
    let text = format!("{code} {message}").to_ascii_lowercase();
    if text.contains("circuit_open") {
        ScrapeStatus::Failed
    } else if text.contains("timeout") || text.contains("etimedout") || text.contains("timed out") {
        ScrapeStatus::Timeout
    } else if text.contains("429") || text.contains("rate_limited") || text.contains("upstream_") {
        ScrapeStatus::RateLimited
    } else {
        ScrapeStatus::Failed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub provider_slug: String,
    pub scrape_job_id: Uuid,
    pub counts: ReconcileCounts,
    pub anomalies: usize,
}

pub struct PricingFetchJob {
    store: Arc<dyn PipelineStore>,
    adapters: AdapterRegistry,
    breakers: CircuitBreakerRegistry,
    client: Arc<ScrapeClient>,
    queue: Arc<dyn JobQueue>,
    cache: Option<Arc<dyn CacheBackend>>,
    adapter_timeout: Duration,
    reconciler: ReconciliationEngine,
    detector: AnomalyDetector,
}

impl PricingFetchJob {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        adapters: AdapterRegistry,
        breakers: CircuitBreakerRegistry,
        client: Arc<ScrapeClient>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            reconciler: ReconciliationEngine::new(store.clone()),
            detector: AnomalyDetector::new(store.clone()),
            store,
            adapters,
            breakers,
            client,
            queue,
            cache: None,
            adapter_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_adapter_timeout(mut self, timeout: Duration) -> Self {
        self.adapter_timeout = timeout;
        self
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub async fn run(&self, provider_slug: &str) -> Result<FetchReport, FetchJobError> {
        let span = info_span!("pricing_fetch", provider = provider_slug, scrape_job_id = field::Empty);
        self.run_inner(provider_slug).instrument(span).await
    }

    async fn run_inner(&self, provider_slug: &str) -> Result<FetchReport, FetchJobError> {
        let provider = self
            .store
            .provider_by_slug(provider_slug)
            .await?
            .ok_or_else(|| FetchJobError::ProviderNotFound(provider_slug.to_string()))?;

        let started_at = Utc::now();
        let job = self.store.open_scrape_job(provider.id, started_at).await?;
        tracing::Span::current().record("scrape_job_id", field::display(job.id));

        match self.execute(&provider, job.id, started_at).await {
            Ok((counts, anomalies)) => {
                self.finalize(job.id, ScrapeJobOutcome::completed(Utc::now(), counts))
                    .await?;
                info!(
                    seen = counts.seen,
                    created = counts.created,
                    updated = counts.updated,
                    deactivated = counts.deactivated,
                    anomalies,
                    "pricing fetch completed"
                );
                Ok(FetchReport {
                    provider_slug: provider.slug,
                    scrape_job_id: job.id,
                    counts,
                    anomalies,
                })
            }
            Err(err) => {
                let status = err.status();
                warn!(status = %status, code = %err.code(), error = %err, "pricing fetch failed");
                let outcome = ScrapeJobOutcome::failed(status, Utc::now(), err.code(), err.to_string());
                if let Err(finalize_err) = self.finalize(job.id, outcome).await {
                    warn!(error = %finalize_err, "could not record failed scrape job");
                }
                Err(err)
            }
        }
    }

    async fn finalize(&self, job_id: Uuid, outcome: ScrapeJobOutcome) -> Result<(), StoreError> {
        if !self.store.finalize_scrape_job(job_id, &outcome).await? {
            warn!(%job_id, "scrape job was already finalized");
        }
        Ok(())
    }

    async fn execute(
        &self,
        provider: &Provider,
        scrape_job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(ReconcileCounts, usize), FetchJobError> {
        let adapter = self
            .adapters
            .get(&provider.slug)
            .ok_or_else(|| FetchJobError::AdapterNotFound(provider.slug.clone()))?;
        let breaker = self
            .breakers
            .breaker_for(&provider.slug, provider.reliability_tier)
            .await;
        let ctx = AdapterContext::from_env(provider.clone(), now, self.client.clone());

        let items: Vec<PricingInstance> = breaker
            .call(|| async {
                match tokio::time::timeout(self.adapter_timeout, adapter.fetch_pricing(&ctx)).await {
                    Err(_) => Err(FetchJobError::AdapterTimeout(self.adapter_timeout)),
                    Ok(Err(err)) => Err(FetchJobError::Adapter(err)),
                    Ok(Ok(items)) if items.is_empty() => Err(FetchJobError::EmptyResult),
                    Ok(Ok(items)) => Ok(items),
                }
            })
            .await
            .map_err(|err| match err {
                BreakerError::Open { provider } => FetchJobError::CircuitOpen(provider),
                BreakerError::Inner(inner) => inner,
            })?;

        let counts = self
            .reconciler
            .reconcile(provider, scrape_job_id, &items, now)
            .await?;
        self.invalidate_read_cache().await;

        let anomalies = match self.detector.detect(provider.id, scrape_job_id, Utc::now()).await {
            Ok(found) => found,
            Err(err) => {
                warn!(error = %err, "anomaly detection failed");
                Vec::new()
            }
        };
        if !anomalies.is_empty() {
            self.notify_operators(&operator_summary(&provider.name, &anomalies))
                .await;
        }
        Ok((counts, anomalies.len()))
    }

    async fn invalidate_read_cache(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        match cache.delete_prefix(API_CACHE_PREFIX).await {
            Ok(removed) => info!(removed, "invalidated cached read responses"),
            Err(err) => warn!(error = %err, "cache invalidation failed"),
        }
    }

    async fn notify_operators(&self, text: &str) {
        let payload = JobPayload::Slack {
            text: text.to_string(),
        };
        if let Err(err) = self.queue.enqueue(&payload, EnqueueOptions::default()).await {
            warn!(error = %err, "could not enqueue operator notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use gpuwatch_adapters::{PricingAdapter, SourceKind};
    use gpuwatch_core::jobs::QueueName;
    use gpuwatch_core::{GpuModel, ReliabilityTier};
    use gpuwatch_storage::{
        CatalogStore, HttpClientConfig, HttpFetcher, MemoryCache, MemoryJobQueue, MemoryStore,
    };

    struct ScriptedAdapter {
        calls: AtomicU32,
        outcome: fn(u32) -> Result<Vec<PricingInstance>, AdapterError>,
    }

    #[async_trait]
    impl PricingAdapter for ScriptedAdapter {
        fn provider_slug(&self) -> &'static str {
            "acme"
        }

        fn source_kind(&self) -> SourceKind {
            SourceKind::RestApi
        }

        async fn fetch_pricing(
            &self,
            _ctx: &AdapterContext,
        ) -> Result<Vec<PricingInstance>, AdapterError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)(n)
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryJobQueue>,
        adapter: Arc<ScriptedAdapter>,
        job: PricingFetchJob,
    }

    async fn harness(
        tier: ReliabilityTier,
        outcome: fn(u32) -> Result<Vec<PricingInstance>, AdapterError>,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_gpu_model(&GpuModel {
                id: Uuid::new_v4(),
                slug: "h100-sxm".into(),
                name: "H100 SXM".into(),
                vram_gb: 80,
                architecture: Some("hopper".into()),
            })
            .await
            .unwrap();
        store
            .upsert_provider(&Provider {
                id: Uuid::new_v4(),
                slug: "acme".into(),
                name: "Acme Cloud".into(),
                reliability_tier: tier,
                pricing_url: None,
                api_base_url: None,
                has_public_api: true,
                supports_spot: false,
                supports_reserved: false,
                is_active: true,
            })
            .await
            .unwrap();
        let queue = Arc::new(MemoryJobQueue::default());
        let adapter = Arc::new(ScriptedAdapter {
            calls: AtomicU32::new(0),
            outcome,
        });
        let mut adapters = AdapterRegistry::new();
        adapters.register(adapter.clone());
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let job = PricingFetchJob::new(
            store.clone(),
            adapters,
            CircuitBreakerRegistry::new(),
            Arc::new(ScrapeClient::new(http)),
            queue.clone(),
        );
        Harness {
            store,
            queue,
            adapter,
            job,
        }
    }

    fn one_h100(_: u32) -> Result<Vec<PricingInstance>, AdapterError> {
        Ok(vec![PricingInstance::new("h100-1x", "h100-sxm", 1, 2.5)])
    }

    fn rate_limited(_: u32) -> Result<Vec<PricingInstance>, AdapterError> {
        Err(AdapterError::Upstream { status: 429 })
    }

    fn nothing(_: u32) -> Result<Vec<PricingInstance>, AdapterError> {
        Ok(Vec::new())
    }

    #[test]
    fn failures_classify_by_marker() {
        assert_eq!(classify_failure("circuit_open", "circuit_open:p"), ScrapeStatus::Failed);
        assert_eq!(classify_failure("timeout", "timeout: x"), ScrapeStatus::Timeout);
        assert_eq!(classify_failure("transport_error", "connect ETIMEDOUT"), ScrapeStatus::Timeout);
        assert_eq!(classify_failure("upstream_429", "upstream_429"), ScrapeStatus::RateLimited);
        assert_eq!(classify_failure("upstream_503", "upstream_503"), ScrapeStatus::RateLimited);
        assert_eq!(classify_failure("unauthorized", "unauthorized: no key"), ScrapeStatus::Failed);
        assert_eq!(FetchJobError::EmptyResult.status(), ScrapeStatus::Failed);
    }

    #[tokio::test]
    async fn successful_cycle_completes_scrape_job_and_invalidates_cache() {
        let h = harness(ReliabilityTier::Standard, one_h100).await;
        let cache = Arc::new(MemoryCache::default());
        cache
            .set_ex("api:/api/instances", "[]", Duration::from_secs(60))
            .await
            .unwrap();
        let job = h.job.with_cache(cache.clone());

        let report = job.run("acme").await.unwrap();
        assert_eq!(report.counts.created, 1);
        assert_eq!(report.anomalies, 0);
        assert!(cache.get("api:/api/instances").await.unwrap().is_none());

        let scrape = h.store.scrape_job(report.scrape_job_id).await.unwrap().unwrap();
        assert_eq!(scrape.status, ScrapeStatus::Completed);
        assert_eq!(scrape.instances_found, 1);
        assert_eq!(scrape.instances_created, 1);
    }

    #[tokio::test]
    async fn unknown_provider_fails_fast_without_scrape_job() {
        let h = harness(ReliabilityTier::Standard, one_h100).await;
        let err = h.job.run("nope").await.unwrap_err();
        assert_eq!(err.to_string(), "provider_not_found:nope");
        assert!(h.store.snapshot().await.scrape_jobs.is_empty());
    }

    #[tokio::test]
    async fn failures_are_recorded_then_breaker_short_circuits() {
        let h = harness(ReliabilityTier::Enterprise, rate_limited).await;
        for _ in 0..3 {
            let err = h.job.run("acme").await.unwrap_err();
            assert_eq!(err.code(), "upstream_429");
        }
        let err = h.job.run("acme").await.unwrap_err();
        assert_eq!(err.code(), "circuit_open");
        assert_eq!(h.adapter.calls.load(Ordering::SeqCst), 3);

        let jobs = h.store.snapshot().await.scrape_jobs;
        assert_eq!(jobs.len(), 4);
        assert!(jobs[..3].iter().all(|j| j.status == ScrapeStatus::RateLimited));
        assert_eq!(jobs[3].status, ScrapeStatus::Failed);
        assert_eq!(jobs[3].error_code.as_deref(), Some("circuit_open"));
    }

    #[tokio::test]
    async fn empty_batch_fails_instead_of_deactivating_everything() {
        let h = harness(ReliabilityTier::Community, nothing).await;
        let err = h.job.run("acme").await.unwrap_err();
        assert_eq!(err.code(), "empty_result");
        let state = h.store.snapshot().await;
        assert_eq!(state.scrape_jobs[0].status, ScrapeStatus::Failed);
        assert_eq!(state.scrape_jobs[0].error_code.as_deref(), Some("empty_result"));
        assert!(state.instances.is_empty());
        assert!(h.queue.jobs(QueueName::Notifications).await.is_empty());
    }
}
