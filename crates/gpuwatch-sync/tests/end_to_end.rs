use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use gpuwatch_adapters::{
    AdapterContext, AdapterError, AdapterRegistry, PricingAdapter, ScrapeClient, SourceKind,
};
use gpuwatch_core::jobs::{JobPayload, QueueName};
use gpuwatch_core::{
    normalize_gpu_slug, AlertSubscription, GpuModel, PricingInstance, Provider, ReliabilityTier,
    ScrapeStatus,
};
use gpuwatch_storage::{
    CatalogStore, EnqueueOptions, HttpClientConfig, HttpFetcher, JobQueue, JobState,
    MemoryJobQueue, MemoryStore,
};
use gpuwatch_sync::{
    drain, AlertMatcher, CircuitBreakerRegistry, PipelineHandler, PricingFetchJob,
};
use uuid::Uuid;

/// Reports a single "H100 SXM" offering at whatever price the test sets.
struct MarketAdapter {
    price: Mutex<f64>,
}

#[async_trait]
impl PricingAdapter for MarketAdapter {
    fn provider_slug(&self) -> &'static str {
        "provider-p"
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::RestApi
    }

    async fn fetch_pricing(&self, _ctx: &AdapterContext) -> Result<Vec<PricingInstance>, AdapterError> {
        let slug = normalize_gpu_slug("H100 SXM")
            .ok_or_else(|| AdapterError::Parse("unresolved gpu".to_string()))?;
        let price = *self.price.lock().unwrap();
        Ok(vec![PricingInstance::new("h100-sxm-1x", slug, 1, price)])
    }
}

struct World {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryJobQueue>,
    adapter: Arc<MarketAdapter>,
    handler: PipelineHandler,
    gpu: GpuModel,
}

async fn world() -> World {
    let store = Arc::new(MemoryStore::new());
    let gpu = store
        .upsert_gpu_model(&GpuModel {
            id: Uuid::new_v4(),
            slug: "h100-sxm".into(),
            name: "NVIDIA H100 SXM".into(),
            vram_gb: 80,
            architecture: Some("hopper".into()),
        })
        .await
        .unwrap();
    store
        .upsert_provider(&Provider {
            id: Uuid::new_v4(),
            slug: "provider-p".into(),
            name: "Provider P".into(),
            reliability_tier: ReliabilityTier::Standard,
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
    let adapter = Arc::new(MarketAdapter {
        price: Mutex::new(2.50),
    });
    let mut adapters = AdapterRegistry::new();
    adapters.register(adapter.clone());
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    let fetch = PricingFetchJob::new(
        store.clone(),
        adapters,
        CircuitBreakerRegistry::new(),
        Arc::new(ScrapeClient::new(http)),
        queue.clone(),
    );
    let handler = PipelineHandler {
        fetch: Some(Arc::new(fetch)),
        alerts: Some(Arc::new(AlertMatcher::new(
            store.clone(),
            queue.clone(),
            "https://gpuwatch.test",
        ))),
        ..PipelineHandler::default()
    };
    World {
        store,
        queue,
        adapter,
        handler,
        gpu,
    }
}

async fn run_fetch(w: &World) {
    let id = w
        .queue
        .enqueue(
            &JobPayload::PricingFetch {
                provider_slug: "provider-p".into(),
            },
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(drain(w.queue.as_ref(), QueueName::PricingFetch, &w.handler).await.unwrap(), 1);
    assert_eq!(w.queue.job(id).await.unwrap().unwrap().state, JobState::Completed);
}

async fn run_alerts(w: &World) -> usize {
    w.queue
        .enqueue(&JobPayload::AlertMatch, EnqueueOptions::default())
        .await
        .unwrap();
    drain(w.queue.as_ref(), QueueName::Alerts, &w.handler).await.unwrap();
    w.queue
        .jobs(QueueName::Notifications)
        .await
        .iter()
        .filter(|j| matches!(j.payload, JobPayload::Email { .. }))
        .count()
}

#[tokio::test]
async fn price_drop_flows_from_fetch_to_alert() {
    let w = world().await;
    w.store
        .insert_subscription(AlertSubscription {
            id: Uuid::new_v4(),
            email: "buyer@example.com".into(),
            gpu_model_id: w.gpu.id,
            provider_id: None,
            target_price_per_gpu_hour: 1.50,
            confirmation_token: "confirm".into(),
            unsubscribe_token: "unsub".into(),
            confirmed_at: Some(Utc::now()),
            last_notified_at: None,
            is_active: true,
            created_at: Utc::now(),
        })
        .await;

    // Cycle 1: $2.50/hr creates the instance and its first observation.
    run_fetch(&w).await;
    let state = w.store.snapshot().await;
    assert_eq!(state.instances.len(), 1);
    assert_eq!(state.instances[0].gpu_model_id, w.gpu.id);
    assert_eq!(state.price_history.len(), 1);
    assert!(state.anomalies.is_empty());
    assert_eq!(run_alerts(&w).await, 0);

    // Cycle 2: 60% drop.
    *w.adapter.price.lock().unwrap() = 1.00;
    run_fetch(&w).await;
    let state = w.store.snapshot().await;
    assert_eq!(state.instances.len(), 1);
    assert_eq!(state.price_history.len(), 2);
    assert_eq!(state.anomalies.len(), 1);
    let anomaly = &state.anomalies[0];
    assert_eq!(anomaly.old_price, 2.50);
    assert_eq!(anomaly.new_price, 1.00);
    assert!((anomaly.percent_change + 60.0).abs() < 1e-9);
    assert!(state
        .scrape_jobs
        .iter()
        .all(|j| j.status == ScrapeStatus::Completed));

    let slack = w
        .queue
        .jobs(QueueName::Notifications)
        .await
        .into_iter()
        .filter(|j| matches!(j.payload, JobPayload::Slack { .. }))
        .count();
    assert_eq!(slack, 1);

    // Subscriber at $1.50 is matched exactly once.
    assert_eq!(run_alerts(&w).await, 1);
    assert_eq!(run_alerts(&w).await, 1);
    let state = w.store.snapshot().await;
    assert!(state.subscriptions[0].last_notified_at.is_some());
}
