//! Persistence seams shared by the pipeline and the read API.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpuwatch_core::listing::{HistoryListing, InstanceFilter, InstanceListing};
use gpuwatch_core::{
    AlertSubscription, GpuModel, Instance, NewAlertSubscription, NewPriceAnomaly,
    NewPriceHistory, PriceHistoryPoint, PriceQuote, Provider, ScrapeJob, ScrapeJobOutcome,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("transaction already finished")]
    TransactionFinished,
}

/// Reference data owned by the CMS.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn provider_by_slug(&self, slug: &str) -> Result<Option<Provider>, StoreError>;
    async fn active_providers(&self) -> Result<Vec<Provider>, StoreError>;
    async fn gpu_model_by_slug(&self, slug: &str) -> Result<Option<GpuModel>, StoreError>;
    /// slug -> gpu_model_id for every catalog entry.
    async fn gpu_catalog(&self) -> Result<HashMap<String, Uuid>, StoreError>;
    async fn upsert_provider(&self, provider: &Provider) -> Result<Provider, StoreError>;
    async fn upsert_gpu_model(&self, model: &GpuModel) -> Result<GpuModel, StoreError>;
}

/// Writes performed by fetch cycles, anomaly detection, alerts and maintenance.
#[async_trait]
pub trait PipelineStore: CatalogStore {
    async fn open_scrape_job(
        &self,
        provider_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<ScrapeJob, StoreError>;

    /// Finalizes a running job. Returns `false` when the job was already finalized.
    async fn finalize_scrape_job(
        &self,
        job_id: Uuid,
        outcome: &ScrapeJobOutcome,
    ) -> Result<bool, StoreError>;

    async fn scrape_job(&self, job_id: Uuid) -> Result<Option<ScrapeJob>, StoreError>;

    async fn begin_reconcile(&self) -> Result<Box<dyn ReconcileTx>, StoreError>;

    /// History rows written by one scrape job for one provider's instances.
    async fn job_history_points(
        &self,
        provider_id: Uuid,
        scrape_job_id: Uuid,
    ) -> Result<Vec<PriceHistoryPoint>, StoreError>;

    /// The observation immediately preceding `point` for the same instance.
    async fn previous_history_point(
        &self,
        point: &PriceHistoryPoint,
    ) -> Result<Option<PriceHistoryPoint>, StoreError>;

    /// Inserts unless an anomaly already exists for the triggering history row.
    async fn insert_anomaly(&self, anomaly: &NewPriceAnomaly) -> Result<bool, StoreError>;

    async fn due_alert_subscriptions(
        &self,
        notified_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AlertSubscription>, StoreError>;

    async fn min_active_price(
        &self,
        gpu_model_id: Uuid,
        provider_id: Option<Uuid>,
    ) -> Result<Option<PriceQuote>, StoreError>;

    async fn mark_subscription_notified(
        &self,
        subscription_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Marks jobs left `running` since before `started_before` as timed out.
    async fn expire_stale_scrape_jobs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// One provider's reconciliation unit of work. Dropping without `commit` rolls back.
#[async_trait]
pub trait ReconcileTx: Send {
    async fn find_instance(
        &mut self,
        provider_id: Uuid,
        instance_type: &str,
    ) -> Result<Option<Instance>, StoreError>;

    async fn insert_instance(&mut self, instance: &Instance) -> Result<(), StoreError>;

    async fn update_instance(&mut self, instance: &Instance) -> Result<(), StoreError>;

    /// Appends a history row; `recorded_at` never moves backwards per instance.
    async fn append_price_history(&mut self, point: &NewPriceHistory) -> Result<i64, StoreError>;

    /// Deactivates the provider's active instances whose type is not in `keep`.
    async fn deactivate_missing(
        &mut self,
        provider_id: Uuid,
        keep: &[String],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionOutcome {
    PendingConfirmation(AlertSubscription),
    AlreadyConfirmed(AlertSubscription),
}

/// Queries behind the comparison API.
#[async_trait]
pub trait ReadStore: CatalogStore {
    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceListing>, StoreError>;

    async fn price_history(
        &self,
        gpu_model_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistoryListing>, StoreError>;

    async fn create_subscription(
        &self,
        subscription: &NewAlertSubscription,
    ) -> Result<SubscriptionOutcome, StoreError>;

    async fn confirm_subscription(
        &self,
        token: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<AlertSubscription>, StoreError>;

    async fn unsubscribe(&self, token: &str) -> Result<bool, StoreError>;
}

pub fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}
