//! In-process implementation of every store trait, used by tests and dry runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpuwatch_core::listing::{sort_listings, HistoryListing, InstanceFilter, InstanceListing};
use gpuwatch_core::{
    AlertSubscription, AvailabilityStatus, GpuModel, Instance, NewAlertSubscription,
    NewPriceAnomaly, NewPriceHistory, PriceAnomaly, PriceHistoryPoint, PriceQuote, Provider,
    ScrapeJob, ScrapeJobOutcome, ScrapeStatus,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::store::{
    new_token, CatalogStore, PipelineStore, ReadStore, ReconcileTx, StoreError,
    SubscriptionOutcome,
};

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub providers: Vec<Provider>,
    pub gpu_models: Vec<GpuModel>,
    pub instances: Vec<Instance>,
    pub price_history: Vec<PriceHistoryPoint>,
    pub scrape_jobs: Vec<ScrapeJob>,
    pub anomalies: Vec<PriceAnomaly>,
    pub subscriptions: Vec<AlertSubscription>,
    next_history_id: i64,
    next_anomaly_id: i64,
}

impl MemoryState {
    fn provider(&self, id: Uuid) -> Option<&Provider> {
        self.providers.iter().find(|p| p.id == id)
    }

    fn gpu_model(&self, id: Uuid) -> Option<&GpuModel> {
        self.gpu_models.iter().find(|g| g.id == id)
    }

    fn instance(&self, id: Uuid) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    fn listing(&self, instance: &Instance) -> Option<InstanceListing> {
        let provider = self.provider(instance.provider_id)?;
        let gpu = self.gpu_model(instance.gpu_model_id)?;
        Some(InstanceListing {
            instance_id: instance.id,
            provider_slug: provider.slug.clone(),
            provider_name: provider.name.clone(),
            reliability_tier: provider.reliability_tier,
            gpu_slug: gpu.slug.clone(),
            gpu_name: gpu.name.clone(),
            instance_type: instance.instance_type.clone(),
            gpu_count: instance.gpu_count,
            price_per_hour: instance.price_per_hour,
            price_per_hour_spot: instance.price_per_hour_spot,
            price_per_gpu_hour: instance.price_per_gpu_hour(),
            vcpus: instance.vcpus,
            memory_gb: instance.memory_gb,
            regions: instance.regions.clone(),
            availability_status: instance.availability_status,
            last_scraped_at: instance.last_scraped_at,
        })
    }
}

/// Store backed by a single mutex-guarded [`MemoryState`].
///
/// A reconcile transaction holds the lock for its whole lifetime and works on a
/// staged copy, so readers observe either the previous state or the committed one.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    pub async fn insert_subscription(&self, subscription: AlertSubscription) {
        self.state.lock().await.subscriptions.push(subscription);
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn provider_by_slug(&self, slug: &str) -> Result<Option<Provider>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.providers.iter().find(|p| p.slug == slug).cloned())
    }

    async fn active_providers(&self) -> Result<Vec<Provider>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .providers
            .iter()
            .filter(|p| p.is_active)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(out)
    }

    async fn gpu_model_by_slug(&self, slug: &str) -> Result<Option<GpuModel>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.gpu_models.iter().find(|g| g.slug == slug).cloned())
    }

    async fn gpu_catalog(&self) -> Result<HashMap<String, Uuid>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .gpu_models
            .iter()
            .map(|g| (g.slug.clone(), g.id))
            .collect())
    }

    async fn upsert_provider(&self, provider: &Provider) -> Result<Provider, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.providers.iter_mut().find(|p| p.slug == provider.slug) {
            let id = existing.id;
            *existing = Provider {
                id,
                ..provider.clone()
            };
            return Ok(existing.clone());
        }
        state.providers.push(provider.clone());
        Ok(provider.clone())
    }

    async fn upsert_gpu_model(&self, model: &GpuModel) -> Result<GpuModel, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.gpu_models.iter_mut().find(|g| g.slug == model.slug) {
            let id = existing.id;
            *existing = GpuModel {
                id,
                ..model.clone()
            };
            return Ok(existing.clone());
        }
        state.gpu_models.push(model.clone());
        Ok(model.clone())
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn open_scrape_job(
        &self,
        provider_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<ScrapeJob, StoreError> {
        let job = ScrapeJob {
            id: Uuid::new_v4(),
            provider_id,
            status: ScrapeStatus::Running,
            started_at,
            finished_at: None,
            duration_ms: None,
            instances_found: 0,
            instances_created: 0,
            instances_updated: 0,
            instances_deactivated: 0,
            error_message: None,
            error_code: None,
        };
        self.state.lock().await.scrape_jobs.push(job.clone());
        Ok(job)
    }

    async fn finalize_scrape_job(
        &self,
        job_id: Uuid,
        outcome: &ScrapeJobOutcome,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state
            .scrape_jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == ScrapeStatus::Running)
        else {
            return Ok(false);
        };
        job.status = outcome.status;
        job.finished_at = Some(outcome.finished_at);
        job.duration_ms = Some((outcome.finished_at - job.started_at).num_milliseconds().max(0));
        job.instances_found = outcome.counts.seen;
        job.instances_created = outcome.counts.created;
        job.instances_updated = outcome.counts.updated;
        job.instances_deactivated = outcome.counts.deactivated;
        job.error_message = outcome.error_message.clone();
        job.error_code = outcome.error_code.clone();
        Ok(true)
    }

    async fn scrape_job(&self, job_id: Uuid) -> Result<Option<ScrapeJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.scrape_jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn begin_reconcile(&self) -> Result<Box<dyn ReconcileTx>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryReconcileTx {
            guard: Some(guard),
            staged,
        }))
    }

    async fn job_history_points(
        &self,
        provider_id: Uuid,
        scrape_job_id: Uuid,
    ) -> Result<Vec<PriceHistoryPoint>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .price_history
            .iter()
            .filter(|h| h.scrape_job_id == Some(scrape_job_id))
            .filter(|h| {
                state
                    .instance(h.instance_id)
                    .is_some_and(|i| i.provider_id == provider_id)
            })
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|h| h.id);
        Ok(out)
    }

    async fn previous_history_point(
        &self,
        point: &PriceHistoryPoint,
    ) -> Result<Option<PriceHistoryPoint>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .price_history
            .iter()
            .filter(|h| h.instance_id == point.instance_id)
            .filter(|h| (h.recorded_at, h.id) < (point.recorded_at, point.id))
            .max_by_key(|h| (h.recorded_at, h.id))
            .cloned())
    }

    async fn insert_anomaly(&self, anomaly: &NewPriceAnomaly) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state
            .anomalies
            .iter()
            .any(|a| a.price_history_id == anomaly.price_history_id)
        {
            return Ok(false);
        }
        state.next_anomaly_id += 1;
        let id = state.next_anomaly_id;
        state.anomalies.push(PriceAnomaly {
            id,
            instance_id: anomaly.instance_id,
            price_history_id: anomaly.price_history_id,
            previous_price_history_id: anomaly.previous_price_history_id,
            scrape_job_id: anomaly.scrape_job_id,
            old_price: anomaly.old_price,
            new_price: anomaly.new_price,
            percent_change: anomaly.percent_change,
            detected_at: anomaly.detected_at,
        });
        Ok(true)
    }

    async fn due_alert_subscriptions(
        &self,
        notified_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AlertSubscription>, StoreError> {
        let state = self.state.lock().await;
        let mut due = state
            .subscriptions
            .iter()
            .filter(|s| s.is_active && s.confirmed_at.is_some())
            .filter(|s| s.last_notified_at.map_or(true, |t| t < notified_before))
            .cloned()
            .collect::<Vec<_>>();
        due.sort_by_key(|s| (s.last_notified_at, s.created_at));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn min_active_price(
        &self,
        gpu_model_id: Uuid,
        provider_id: Option<Uuid>,
    ) -> Result<Option<PriceQuote>, StoreError> {
        let state = self.state.lock().await;
        let best = state
            .instances
            .iter()
            .filter(|i| i.is_active && i.gpu_model_id == gpu_model_id)
            .filter(|i| provider_id.map_or(true, |p| i.provider_id == p))
            .min_by(|a, b| a.price_per_gpu_hour().total_cmp(&b.price_per_gpu_hour()));
        Ok(best.and_then(|inst| {
            let provider = state.provider(inst.provider_id)?;
            Some(PriceQuote {
                instance_id: inst.id,
                provider_slug: provider.slug.clone(),
                provider_name: provider.name.clone(),
                instance_type: inst.instance_type.clone(),
                price_per_gpu_hour: inst.price_per_gpu_hour(),
            })
        }))
    }

    async fn mark_subscription_notified(
        &self,
        subscription_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(sub) = state
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription_id)
        {
            sub.last_notified_at = Some(at);
        }
        Ok(())
    }

    async fn expire_stale_scrape_jobs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut expired = 0;
        for job in state
            .scrape_jobs
            .iter_mut()
            .filter(|j| j.status == ScrapeStatus::Running && j.started_at < started_before)
        {
            job.status = ScrapeStatus::Timeout;
            job.finished_at = Some(now);
            job.duration_ms = Some((now - job.started_at).num_milliseconds().max(0));
            job.error_code = Some("stale_running".to_string());
            job.error_message = Some("scrape job never finalized".to_string());
            expired += 1;
        }
        Ok(expired)
    }
}

struct MemoryReconcileTx {
    guard: Option<OwnedMutexGuard<MemoryState>>,
    staged: MemoryState,
}

impl MemoryReconcileTx {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.guard.is_none() {
            return Err(StoreError::TransactionFinished);
        }
        Ok(())
    }
}

#[async_trait]
impl ReconcileTx for MemoryReconcileTx {
    async fn find_instance(
        &mut self,
        provider_id: Uuid,
        instance_type: &str,
    ) -> Result<Option<Instance>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .staged
            .instances
            .iter()
            .find(|i| i.provider_id == provider_id && i.instance_type == instance_type)
            .cloned())
    }

    async fn insert_instance(&mut self, instance: &Instance) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.staged.instances.iter().any(|i| {
            i.provider_id == instance.provider_id && i.instance_type == instance.instance_type
        }) {
            return Err(StoreError::Corrupt(format!(
                "duplicate instance {}",
                instance.instance_type
            )));
        }
        self.staged.instances.push(instance.clone());
        Ok(())
    }

    async fn update_instance(&mut self, instance: &Instance) -> Result<(), StoreError> {
        self.ensure_open()?;
        let Some(existing) = self.staged.instances.iter_mut().find(|i| i.id == instance.id)
        else {
            return Err(StoreError::Corrupt(format!("missing instance {}", instance.id)));
        };
        *existing = instance.clone();
        Ok(())
    }

    async fn append_price_history(&mut self, point: &NewPriceHistory) -> Result<i64, StoreError> {
        self.ensure_open()?;
        let latest = self
            .staged
            .price_history
            .iter()
            .filter(|h| h.instance_id == point.instance_id)
            .map(|h| h.recorded_at)
            .max();
        let recorded_at = latest.map_or(point.recorded_at, |l| l.max(point.recorded_at));
        self.staged.next_history_id += 1;
        let id = self.staged.next_history_id;
        self.staged.price_history.push(PriceHistoryPoint {
            id,
            instance_id: point.instance_id,
            scrape_job_id: Some(point.scrape_job_id),
            price_per_gpu_hour: point.price_per_gpu_hour,
            spot_price_per_gpu_hour: point.spot_price_per_gpu_hour,
            recorded_at,
        });
        Ok(id)
    }

    async fn deactivate_missing(
        &mut self,
        provider_id: Uuid,
        keep: &[String],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let mut count = 0;
        for inst in self.staged.instances.iter_mut().filter(|i| {
            i.provider_id == provider_id && i.is_active && !keep.contains(&i.instance_type)
        }) {
            inst.is_active = false;
            inst.availability_status = AvailabilityStatus::Unavailable;
            inst.updated_at = at;
            count += 1;
        }
        Ok(count)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let Some(mut guard) = self.guard.take() else {
            return Err(StoreError::TransactionFinished);
        };
        *guard = std::mem::take(&mut self.staged);
        Ok(())
    }
}

#[async_trait]
impl ReadStore for MemoryStore {
    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceListing>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .instances
            .iter()
            .filter(|i| i.is_active)
            .filter(|i| {
                !filter.available_only
                    || matches!(
                        i.availability_status,
                        AvailabilityStatus::Available | AvailabilityStatus::Limited
                    )
            })
            .filter_map(|i| state.listing(i))
            .filter(|l| filter.gpu_slug.as_ref().map_or(true, |g| &l.gpu_slug == g))
            .filter(|l| {
                filter
                    .provider_slug
                    .as_ref()
                    .map_or(true, |p| &l.provider_slug == p)
            })
            .collect::<Vec<_>>();
        sort_listings(&mut rows, filter.sort);
        rows.truncate(filter.limit);
        Ok(rows)
    }

    async fn price_history(
        &self,
        gpu_model_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistoryListing>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .price_history
            .iter()
            .filter(|h| h.recorded_at >= since)
            .filter_map(|h| {
                let inst = state.instance(h.instance_id)?;
                if inst.gpu_model_id != gpu_model_id {
                    return None;
                }
                let provider = state.provider(inst.provider_id)?;
                Some(HistoryListing {
                    provider_slug: provider.slug.clone(),
                    instance_type: inst.instance_type.clone(),
                    price_per_gpu_hour: h.price_per_gpu_hour,
                    spot_price_per_gpu_hour: h.spot_price_per_gpu_hour,
                    recorded_at: h.recorded_at,
                })
            })
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(rows)
    }

    async fn create_subscription(
        &self,
        subscription: &NewAlertSubscription,
    ) -> Result<SubscriptionOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let email = subscription.email.trim().to_ascii_lowercase();
        if let Some(existing) = state.subscriptions.iter_mut().find(|s| {
            s.is_active
                && s.email == email
                && s.gpu_model_id == subscription.gpu_model_id
                && s.provider_id == subscription.provider_id
        }) {
            existing.target_price_per_gpu_hour = subscription.target_price_per_gpu_hour;
            let sub = existing.clone();
            return Ok(if sub.confirmed_at.is_some() {
                SubscriptionOutcome::AlreadyConfirmed(sub)
            } else {
                SubscriptionOutcome::PendingConfirmation(sub)
            });
        }
        let sub = AlertSubscription {
            id: Uuid::new_v4(),
            email,
            gpu_model_id: subscription.gpu_model_id,
            provider_id: subscription.provider_id,
            target_price_per_gpu_hour: subscription.target_price_per_gpu_hour,
            confirmation_token: new_token(),
            unsubscribe_token: new_token(),
            confirmed_at: None,
            last_notified_at: None,
            is_active: true,
            created_at: Utc::now(),
        };
        state.subscriptions.push(sub.clone());
        Ok(SubscriptionOutcome::PendingConfirmation(sub))
    }

    async fn confirm_subscription(
        &self,
        token: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<AlertSubscription>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(sub) = state
            .subscriptions
            .iter_mut()
            .find(|s| s.is_active && s.confirmation_token == token)
        else {
            return Ok(None);
        };
        if sub.confirmed_at.is_none() {
            sub.confirmed_at = Some(at);
        }
        Ok(Some(sub.clone()))
    }

    async fn unsubscribe(&self, token: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(sub) = state
            .subscriptions
            .iter_mut()
            .find(|s| s.is_active && s.unsubscribe_token == token)
        else {
            return Ok(false);
        };
        sub.is_active = false;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use gpuwatch_core::ReliabilityTier;
    use serde_json::json;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
    }

    fn provider() -> Provider {
        Provider {
            id: Uuid::new_v4(),
            slug: "runpod".into(),
            name: "RunPod".into(),
            reliability_tier: ReliabilityTier::Standard,
            pricing_url: None,
            api_base_url: None,
            has_public_api: true,
            supports_spot: true,
            supports_reserved: false,
            is_active: true,
        }
    }

    fn instance(provider_id: Uuid, gpu_model_id: Uuid, instance_type: &str) -> Instance {
        Instance {
            id: Uuid::new_v4(),
            provider_id,
            gpu_model_id,
            instance_type: instance_type.into(),
            gpu_count: 1,
            price_per_hour: 2.0,
            price_per_hour_spot: None,
            vcpus: None,
            memory_gb: None,
            storage_gb: None,
            network_bandwidth_gbps: None,
            regions: vec![],
            availability_status: AvailabilityStatus::Available,
            is_active: true,
            last_scraped_at: ts(0),
            scrape_job_id: None,
            raw_data: json!({}),
            created_at: ts(0),
            updated_at: ts(0),
        }
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = MemoryStore::new();
        let p = store.upsert_provider(&provider()).await.unwrap();
        {
            let mut tx = store.begin_reconcile().await.unwrap();
            tx.insert_instance(&instance(p.id, Uuid::new_v4(), "a"))
                .await
                .unwrap();
        }
        assert!(store.snapshot().await.instances.is_empty());

        let mut tx = store.begin_reconcile().await.unwrap();
        tx.insert_instance(&instance(p.id, Uuid::new_v4(), "a"))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert!(tx.commit().await.is_err());
        assert_eq!(store.snapshot().await.instances.len(), 1);
    }

    #[tokio::test]
    async fn history_recorded_at_never_moves_backwards() {
        let store = MemoryStore::new();
        let job = Uuid::new_v4();
        let instance_id = Uuid::new_v4();
        let mut tx = store.begin_reconcile().await.unwrap();
        for at in [ts(5), ts(3)] {
            tx.append_price_history(&NewPriceHistory {
                instance_id,
                scrape_job_id: job,
                price_per_gpu_hour: 1.0,
                spot_price_per_gpu_hour: None,
                recorded_at: at,
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();
        let history = store.snapshot().await.price_history;
        assert_eq!(history[0].recorded_at, ts(5));
        assert_eq!(history[1].recorded_at, ts(5));
    }

    #[tokio::test]
    async fn scrape_job_finalizes_exactly_once() {
        let store = MemoryStore::new();
        let job = store.open_scrape_job(Uuid::new_v4(), ts(1)).await.unwrap();
        let outcome = ScrapeJobOutcome::completed(ts(2), Default::default());
        assert!(store.finalize_scrape_job(job.id, &outcome).await.unwrap());
        let second = ScrapeJobOutcome::failed(ScrapeStatus::Failed, ts(3), "x", "y");
        assert!(!store.finalize_scrape_job(job.id, &second).await.unwrap());
        let stored = store.scrape_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScrapeStatus::Completed);
        assert_eq!(stored.duration_ms, Some(3_600_000));
    }

    #[tokio::test]
    async fn subscriptions_dedupe_and_confirm() {
        let store = MemoryStore::new();
        let gpu = Uuid::new_v4();
        let new = NewAlertSubscription {
            email: "Ops@Example.com".into(),
            gpu_model_id: gpu,
            provider_id: None,
            target_price_per_gpu_hour: 1.5,
        };
        let SubscriptionOutcome::PendingConfirmation(first) =
            store.create_subscription(&new).await.unwrap()
        else {
            panic!("expected pending");
        };
        assert_eq!(first.email, "ops@example.com");
        store
            .confirm_subscription(&first.confirmation_token, ts(1))
            .await
            .unwrap()
            .unwrap();
        let again = store.create_subscription(&new).await.unwrap();
        assert!(matches!(again, SubscriptionOutcome::AlreadyConfirmed(ref s) if s.id == first.id));

        let due = store
            .due_alert_subscriptions(ts(1) + Duration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert!(store.unsubscribe(&first.unsubscribe_token).await.unwrap());
        assert!(store
            .due_alert_subscriptions(ts(2), 10)
            .await
            .unwrap()
            .is_empty());
    }
}
