//! Repeatable job registration. The scheduler never runs pipeline work itself;
//! it only enqueues deduplicated jobs for the worker pool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gpuwatch_adapters::AdapterRegistry;
use gpuwatch_core::jobs::JobPayload;
use gpuwatch_storage::{CatalogStore, EnqueueOptions, JobQueue};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::SyncConfig;

#[derive(Clone)]
pub struct PipelineScheduler {
    config: SyncConfig,
    catalog: Arc<dyn CatalogStore>,
    queue: Arc<dyn JobQueue>,
    adapters: AdapterRegistry,
}

impl PipelineScheduler {
    pub fn new(
        config: SyncConfig,
        catalog: Arc<dyn CatalogStore>,
        queue: Arc<dyn JobQueue>,
        adapters: AdapterRegistry,
    ) -> Self {
        Self {
            config,
            catalog,
            queue,
            adapters,
        }
    }

    /// Enqueues one fetch per active provider that has an adapter. Returns the count enqueued.
    pub async fn enqueue_fetch_cycle(&self) -> Result<usize> {
        let providers = self
            .catalog
            .active_providers()
            .await
            .context("loading active providers")?;
        let mut enqueued = 0;
        for provider in providers {
            if self.adapters.get(&provider.slug).is_none() {
                warn!(provider = %provider.slug, "no adapter registered, skipping fetch");
                continue;
            }
            let payload = JobPayload::PricingFetch {
                provider_slug: provider.slug.clone(),
            };
            let key = self.config.repeat_key(&format!("pricing-fetch:{}", provider.slug));
            self.queue
                .enqueue(&payload, EnqueueOptions::deduped(key))
                .await
                .with_context(|| format!("enqueueing fetch for {}", provider.slug))?;
            enqueued += 1;
        }
        info!(enqueued, "fetch cycle enqueued");
        Ok(enqueued)
    }

    pub async fn enqueue_alert_match(&self) -> Result<()> {
        self.queue
            .enqueue(
                &JobPayload::AlertMatch,
                EnqueueOptions::deduped(self.config.repeat_key("alert-match")),
            )
            .await
            .context("enqueueing alert match")?;
        Ok(())
    }

    pub async fn enqueue_maintenance(&self) -> Result<()> {
        self.queue
            .enqueue(
                &JobPayload::Maintenance,
                EnqueueOptions::deduped(self.config.repeat_key("maintenance")),
            )
            .await
            .context("enqueueing maintenance")?;
        Ok(())
    }

    /// Builds (but does not start) the cron scheduler.
    pub async fn build(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let this = self.clone();
        let fetch_every = Duration::from_secs(self.config.fetch_interval_secs.max(60));
        let fetch = Job::new_repeated_async(fetch_every, move |_uuid, _l| {
            let this = this.clone();
            Box::pin(async move {
                if let Err(err) = this.enqueue_fetch_cycle().await {
                    warn!(error = %format!("{err:#}"), "scheduled fetch cycle failed");
                }
            })
        })
        .context("creating fetch cycle job")?;
        sched.add(fetch).await.context("adding fetch cycle job")?;

        let this = self.clone();
        let alert_every = Duration::from_secs(self.config.alert_interval_secs.max(60));
        let alerts = Job::new_repeated_async(alert_every, move |_uuid, _l| {
            let this = this.clone();
            Box::pin(async move {
                if let Err(err) = this.enqueue_alert_match().await {
                    warn!(error = %format!("{err:#}"), "scheduled alert match failed");
                }
            })
        })
        .context("creating alert match job")?;
        sched.add(alerts).await.context("adding alert match job")?;

        let this = self.clone();
        let cron = self.config.maintenance_cron.clone();
        let maintenance = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let this = this.clone();
            Box::pin(async move {
                if let Err(err) = this.enqueue_maintenance().await {
                    warn!(error = %format!("{err:#}"), "scheduled maintenance failed");
                }
            })
        })
        .with_context(|| format!("creating maintenance job for cron {cron}"))?;
        sched.add(maintenance).await.context("adding maintenance job")?;

        info!(
            fetch_every_secs = fetch_every.as_secs(),
            alert_every_secs = alert_every.as_secs(),
            maintenance_cron = %self.config.maintenance_cron,
            "scheduler built"
        );
        Ok(sched)
    }

    /// Builds the scheduler only when `GPUWATCH_SCHEDULER_ENABLED` is set.
    pub async fn maybe_build(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        self.build().await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuwatch_core::jobs::QueueName;
    use gpuwatch_core::{Provider, ReliabilityTier};
    use gpuwatch_storage::{MemoryJobQueue, MemoryStore};
    use uuid::Uuid;

    async fn provider(store: &MemoryStore, slug: &str, is_active: bool) {
        store
            .upsert_provider(&Provider {
                id: Uuid::new_v4(),
                slug: slug.into(),
                name: slug.into(),
                reliability_tier: ReliabilityTier::Standard,
                pricing_url: None,
                api_base_url: None,
                has_public_api: true,
                supports_spot: false,
                supports_reserved: false,
                is_active,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fetch_cycle_dedupes_and_skips_unknown_or_inactive_providers() {
        let store = Arc::new(MemoryStore::new());
        provider(&store, "runpod", true).await;
        provider(&store, "coreweave", false).await;
        provider(&store, "homegrown", true).await;
        let queue = Arc::new(MemoryJobQueue::default());
        let scheduler = PipelineScheduler::new(
            SyncConfig::default(),
            store,
            queue.clone(),
            AdapterRegistry::with_default_adapters(),
        );

        assert_eq!(scheduler.enqueue_fetch_cycle().await.unwrap(), 1);
        assert_eq!(scheduler.enqueue_fetch_cycle().await.unwrap(), 1);
        let jobs = queue.jobs(QueueName::PricingFetch).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].dedupe_key.as_deref(), Some("gpuwatch:repeat:pricing-fetch:runpod"));

        scheduler.enqueue_alert_match().await.unwrap();
        scheduler.enqueue_alert_match().await.unwrap();
        assert_eq!(queue.jobs(QueueName::Alerts).await.len(), 1);
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let scheduler = PipelineScheduler::new(
            SyncConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryJobQueue::default()),
            AdapterRegistry::new(),
        );
        assert!(scheduler.maybe_build().await.unwrap().is_none());
    }
}
