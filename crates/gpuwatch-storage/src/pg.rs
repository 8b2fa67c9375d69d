use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpuwatch_core::listing::{HistoryListing, InstanceFilter, InstanceListing, InstanceSort};
use gpuwatch_core::{
    AlertSubscription, GpuModel, Instance, NewAlertSubscription, NewPriceAnomaly,
    NewPriceHistory, PriceHistoryPoint, PriceQuote, Provider, ScrapeJob, ScrapeJobOutcome,
    ScrapeStatus,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::store::{
    new_token, CatalogStore, PipelineStore, ReadStore, ReconcileTx, StoreError,
    SubscriptionOutcome,
};

const PROVIDER_COLUMNS: &str = "id, slug, name, reliability_tier, pricing_url, api_base_url, \
     has_public_api, supports_spot, supports_reserved, is_active";

const INSTANCE_COLUMNS: &str = "id, provider_id, gpu_model_id, instance_type, gpu_count, \
     price_per_hour, price_per_hour_spot, vcpus, memory_gb, storage_gb, network_bandwidth_gbps, \
     regions, availability_status, is_active, last_scraped_at, scrape_job_id, raw_data, \
     created_at, updated_at";

const SCRAPE_JOB_COLUMNS: &str = "id, provider_id, status, started_at, finished_at, duration_ms, \
     instances_found, instances_created, instances_updated, instances_deactivated, \
     error_message, error_code";

const HISTORY_COLUMNS: &str =
    "id, instance_id, scrape_job_id, price_per_gpu_hour, spot_price_per_gpu_hour, recorded_at";

const SUBSCRIPTION_COLUMNS: &str = "id, email, gpu_model_id, provider_id, \
     target_price_per_gpu_hour, confirmation_token, unsubscribe_token, confirmed_at, \
     last_notified_at, is_active, created_at";

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|err: T::Err| StoreError::Corrupt(format!("{column}: {err}")))
}

fn provider_from_row(row: &PgRow) -> Result<Provider, StoreError> {
    Ok(Provider {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        reliability_tier: parse_column(row, "reliability_tier")?,
        pricing_url: row.try_get("pricing_url")?,
        api_base_url: row.try_get("api_base_url")?,
        has_public_api: row.try_get("has_public_api")?,
        supports_spot: row.try_get("supports_spot")?,
        supports_reserved: row.try_get("supports_reserved")?,
        is_active: row.try_get("is_active")?,
    })
}

fn gpu_model_from_row(row: &PgRow) -> Result<GpuModel, StoreError> {
    Ok(GpuModel {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        vram_gb: row.try_get("vram_gb")?,
        architecture: row.try_get("architecture")?,
    })
}

fn instance_from_row(row: &PgRow) -> Result<Instance, StoreError> {
    Ok(Instance {
        id: row.try_get("id")?,
        provider_id: row.try_get("provider_id")?,
        gpu_model_id: row.try_get("gpu_model_id")?,
        instance_type: row.try_get("instance_type")?,
        gpu_count: row.try_get("gpu_count")?,
        price_per_hour: row.try_get("price_per_hour")?,
        price_per_hour_spot: row.try_get("price_per_hour_spot")?,
        vcpus: row.try_get("vcpus")?,
        memory_gb: row.try_get("memory_gb")?,
        storage_gb: row.try_get("storage_gb")?,
        network_bandwidth_gbps: row.try_get("network_bandwidth_gbps")?,
        regions: row.try_get("regions")?,
        availability_status: parse_column(row, "availability_status")?,
        is_active: row.try_get("is_active")?,
        last_scraped_at: row.try_get("last_scraped_at")?,
        scrape_job_id: row.try_get("scrape_job_id")?,
        raw_data: row.try_get("raw_data")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn scrape_job_from_row(row: &PgRow) -> Result<ScrapeJob, StoreError> {
    Ok(ScrapeJob {
        id: row.try_get("id")?,
        provider_id: row.try_get("provider_id")?,
        status: parse_column::<ScrapeStatus>(row, "status")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_ms: row.try_get("duration_ms")?,
        instances_found: row.try_get("instances_found")?,
        instances_created: row.try_get("instances_created")?,
        instances_updated: row.try_get("instances_updated")?,
        instances_deactivated: row.try_get("instances_deactivated")?,
        error_message: row.try_get("error_message")?,
        error_code: row.try_get("error_code")?,
    })
}

fn history_from_row(row: &PgRow) -> Result<PriceHistoryPoint, StoreError> {
    Ok(PriceHistoryPoint {
        id: row.try_get("id")?,
        instance_id: row.try_get("instance_id")?,
        scrape_job_id: row.try_get("scrape_job_id")?,
        price_per_gpu_hour: row.try_get("price_per_gpu_hour")?,
        spot_price_per_gpu_hour: row.try_get("spot_price_per_gpu_hour")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<AlertSubscription, StoreError> {
    Ok(AlertSubscription {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        gpu_model_id: row.try_get("gpu_model_id")?,
        provider_id: row.try_get("provider_id")?,
        target_price_per_gpu_hour: row.try_get("target_price_per_gpu_hour")?,
        confirmation_token: row.try_get("confirmation_token")?,
        unsubscribe_token: row.try_get("unsubscribe_token")?,
        confirmed_at: row.try_get("confirmed_at")?,
        last_notified_at: row.try_get("last_notified_at")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Postgres-backed store for the pipeline and read API.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("running database migrations");
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn provider_by_slug(&self, slug: &str) -> Result<Option<Provider>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PROVIDER_COLUMNS} FROM providers WHERE slug = $1"
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(provider_from_row).transpose()
    }

    async fn active_providers(&self) -> Result<Vec<Provider>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROVIDER_COLUMNS} FROM providers WHERE is_active ORDER BY slug"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(provider_from_row).collect()
    }

    async fn gpu_model_by_slug(&self, slug: &str) -> Result<Option<GpuModel>, StoreError> {
        let row = sqlx::query(
            "SELECT id, slug, name, vram_gb, architecture FROM gpu_models WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(gpu_model_from_row).transpose()
    }

    async fn gpu_catalog(&self) -> Result<HashMap<String, Uuid>, StoreError> {
        let rows = sqlx::query("SELECT id, slug FROM gpu_models")
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("slug")?, row.try_get("id")?);
        }
        Ok(out)
    }

    async fn upsert_provider(&self, provider: &Provider) -> Result<Provider, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO providers ({PROVIDER_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (slug) DO UPDATE SET
              name = EXCLUDED.name,
              reliability_tier = EXCLUDED.reliability_tier,
              pricing_url = EXCLUDED.pricing_url,
              api_base_url = EXCLUDED.api_base_url,
              has_public_api = EXCLUDED.has_public_api,
              supports_spot = EXCLUDED.supports_spot,
              supports_reserved = EXCLUDED.supports_reserved,
              is_active = EXCLUDED.is_active,
              updated_at = now()
            RETURNING {PROVIDER_COLUMNS}
            "#
        ))
        .bind(provider.id)
        .bind(&provider.slug)
        .bind(&provider.name)
        .bind(provider.reliability_tier.as_str())
        .bind(&provider.pricing_url)
        .bind(&provider.api_base_url)
        .bind(provider.has_public_api)
        .bind(provider.supports_spot)
        .bind(provider.supports_reserved)
        .bind(provider.is_active)
        .fetch_one(&self.pool)
        .await?;
        provider_from_row(&row)
    }

    async fn upsert_gpu_model(&self, model: &GpuModel) -> Result<GpuModel, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO gpu_models (id, slug, name, vram_gb, architecture)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (slug) DO UPDATE SET
              name = EXCLUDED.name,
              vram_gb = EXCLUDED.vram_gb,
              architecture = EXCLUDED.architecture
            RETURNING id, slug, name, vram_gb, architecture
            "#,
        )
        .bind(model.id)
        .bind(&model.slug)
        .bind(&model.name)
        .bind(model.vram_gb)
        .bind(&model.architecture)
        .fetch_one(&self.pool)
        .await?;
        gpu_model_from_row(&row)
    }
}

#[async_trait]
impl PipelineStore for PgStore {
    async fn open_scrape_job(
        &self,
        provider_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<ScrapeJob, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO scrape_jobs (id, provider_id, status, started_at)
            VALUES ($1, $2, 'running', $3)
            RETURNING {SCRAPE_JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(provider_id)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await?;
        scrape_job_from_row(&row)
    }

    async fn finalize_scrape_job(
        &self,
        job_id: Uuid,
        outcome: &ScrapeJobOutcome,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_jobs SET
              status = $2,
              finished_at = $3,
              duration_ms = GREATEST(0, (EXTRACT(EPOCH FROM ($3::timestamptz - started_at)) * 1000)::bigint),
              instances_found = $4,
              instances_created = $5,
              instances_updated = $6,
              instances_deactivated = $7,
              error_message = $8,
              error_code = $9
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(outcome.status.as_str())
        .bind(outcome.finished_at)
        .bind(outcome.counts.seen)
        .bind(outcome.counts.created)
        .bind(outcome.counts.updated)
        .bind(outcome.counts.deactivated)
        .bind(&outcome.error_message)
        .bind(&outcome.error_code)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn scrape_job(&self, job_id: Uuid) -> Result<Option<ScrapeJob>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SCRAPE_JOB_COLUMNS} FROM scrape_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(scrape_job_from_row).transpose()
    }

    async fn begin_reconcile(&self) -> Result<Box<dyn ReconcileTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgReconcileTx { tx: Some(tx) }))
    }

    async fn job_history_points(
        &self,
        provider_id: Uuid,
        scrape_job_id: Uuid,
    ) -> Result<Vec<PriceHistoryPoint>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT h.id, h.instance_id, h.scrape_job_id, h.price_per_gpu_hour,
                   h.spot_price_per_gpu_hour, h.recorded_at
            FROM price_history h
            JOIN instances i ON i.id = h.instance_id
            WHERE h.scrape_job_id = $2 AND i.provider_id = $1
            ORDER BY h.id
            "#,
        )
        .bind(provider_id)
        .bind(scrape_job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn previous_history_point(
        &self,
        point: &PriceHistoryPoint,
    ) -> Result<Option<PriceHistoryPoint>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {HISTORY_COLUMNS} FROM price_history
            WHERE instance_id = $1 AND (recorded_at, id) < ($2, $3)
            ORDER BY recorded_at DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(point.instance_id)
        .bind(point.recorded_at)
        .bind(point.id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(history_from_row).transpose()
    }

    async fn insert_anomaly(&self, anomaly: &NewPriceAnomaly) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO price_anomalies (
              instance_id, price_history_id, previous_price_history_id, scrape_job_id,
              old_price, new_price, percent_change, detected_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (price_history_id) DO NOTHING
            "#,
        )
        .bind(anomaly.instance_id)
        .bind(anomaly.price_history_id)
        .bind(anomaly.previous_price_history_id)
        .bind(anomaly.scrape_job_id)
        .bind(anomaly.old_price)
        .bind(anomaly.new_price)
        .bind(anomaly.percent_change)
        .bind(anomaly.detected_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn due_alert_subscriptions(
        &self,
        notified_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AlertSubscription>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM price_alert_subscriptions
            WHERE is_active
              AND confirmed_at IS NOT NULL
              AND (last_notified_at IS NULL OR last_notified_at < $1)
            ORDER BY last_notified_at ASC NULLS FIRST, created_at ASC
            LIMIT $2
            "#
        ))
        .bind(notified_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn min_active_price(
        &self,
        gpu_model_id: Uuid,
        provider_id: Option<Uuid>,
    ) -> Result<Option<PriceQuote>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT i.id, p.slug, p.name, i.instance_type,
                   i.price_per_hour / GREATEST(i.gpu_count, 1) AS per_gpu
            FROM instances i
            JOIN providers p ON p.id = i.provider_id
            WHERE i.is_active
              AND i.gpu_model_id = $1
              AND ($2::uuid IS NULL OR i.provider_id = $2)
            ORDER BY per_gpu ASC
            LIMIT 1
            "#,
        )
        .bind(gpu_model_id)
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(PriceQuote {
            instance_id: row.try_get("id")?,
            provider_slug: row.try_get("slug")?,
            provider_name: row.try_get("name")?,
            instance_type: row.try_get("instance_type")?,
            price_per_gpu_hour: row.try_get("per_gpu")?,
        }))
    }

    async fn mark_subscription_notified(
        &self,
        subscription_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE price_alert_subscriptions SET last_notified_at = $2 WHERE id = $1")
            .bind(subscription_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn expire_stale_scrape_jobs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_jobs SET
              status = 'timeout',
              finished_at = $2,
              duration_ms = GREATEST(0, (EXTRACT(EPOCH FROM ($2::timestamptz - started_at)) * 1000)::bigint),
              error_code = 'stale_running',
              error_message = 'scrape job never finalized'
            WHERE status = 'running' AND started_at < $1
            "#,
        )
        .bind(started_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Reconciliation transaction; rolled back by sqlx when dropped uncommitted.
struct PgReconcileTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgReconcileTx {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::TransactionFinished)
    }
}

#[async_trait]
impl ReconcileTx for PgReconcileTx {
    async fn find_instance(
        &mut self,
        provider_id: Uuid,
        instance_type: &str,
    ) -> Result<Option<Instance>, StoreError> {
        let tx = self.tx()?;
        let row = sqlx::query(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS} FROM instances
            WHERE provider_id = $1 AND instance_type = $2
            FOR UPDATE
            "#
        ))
        .bind(provider_id)
        .bind(instance_type)
        .fetch_optional(&mut **tx)
        .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn insert_instance(&mut self, instance: &Instance) -> Result<(), StoreError> {
        let tx = self.tx()?;
        sqlx::query(&format!(
            r#"
            INSERT INTO instances ({INSTANCE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#
        ))
        .bind(instance.id)
        .bind(instance.provider_id)
        .bind(instance.gpu_model_id)
        .bind(&instance.instance_type)
        .bind(instance.gpu_count)
        .bind(instance.price_per_hour)
        .bind(instance.price_per_hour_spot)
        .bind(instance.vcpus)
        .bind(instance.memory_gb)
        .bind(instance.storage_gb)
        .bind(instance.network_bandwidth_gbps)
        .bind(&instance.regions)
        .bind(instance.availability_status.as_str())
        .bind(instance.is_active)
        .bind(instance.last_scraped_at)
        .bind(instance.scrape_job_id)
        .bind(&instance.raw_data)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn update_instance(&mut self, instance: &Instance) -> Result<(), StoreError> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            UPDATE instances SET
              gpu_model_id = $2,
              gpu_count = $3,
              price_per_hour = $4,
              price_per_hour_spot = $5,
              vcpus = $6,
              memory_gb = $7,
              storage_gb = $8,
              network_bandwidth_gbps = $9,
              regions = $10,
              availability_status = $11,
              is_active = $12,
              last_scraped_at = $13,
              scrape_job_id = $14,
              raw_data = $15,
              updated_at = $16
            WHERE id = $1
            "#,
        )
        .bind(instance.id)
        .bind(instance.gpu_model_id)
        .bind(instance.gpu_count)
        .bind(instance.price_per_hour)
        .bind(instance.price_per_hour_spot)
        .bind(instance.vcpus)
        .bind(instance.memory_gb)
        .bind(instance.storage_gb)
        .bind(instance.network_bandwidth_gbps)
        .bind(&instance.regions)
        .bind(instance.availability_status.as_str())
        .bind(instance.is_active)
        .bind(instance.last_scraped_at)
        .bind(instance.scrape_job_id)
        .bind(&instance.raw_data)
        .bind(instance.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn append_price_history(&mut self, point: &NewPriceHistory) -> Result<i64, StoreError> {
        let tx = self.tx()?;
        let row = sqlx::query(
            r#"
            INSERT INTO price_history (
              instance_id, scrape_job_id, price_per_gpu_hour, spot_price_per_gpu_hour, recorded_at
            )
            SELECT $1, $2, $3, $4, GREATEST(
              $5::timestamptz,
              COALESCE((SELECT MAX(recorded_at) FROM price_history WHERE instance_id = $1), $5::timestamptz)
            )
            RETURNING id
            "#,
        )
        .bind(point.instance_id)
        .bind(point.scrape_job_id)
        .bind(point.price_per_gpu_hour)
        .bind(point.spot_price_per_gpu_hour)
        .bind(point.recorded_at)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn deactivate_missing(
        &mut self,
        provider_id: Uuid,
        keep: &[String],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let tx = self.tx()?;
        let result = sqlx::query(
            r#"
            UPDATE instances SET
              is_active = false,
              availability_status = 'unavailable',
              updated_at = $3
            WHERE provider_id = $1 AND is_active AND NOT (instance_type = ANY($2))
            "#,
        )
        .bind(provider_id)
        .bind(keep.to_vec())
        .bind(at)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionFinished)?;
        tx.commit().await?;
        Ok(())
    }
}

fn order_clause(sort: InstanceSort) -> &'static str {
    match sort {
        InstanceSort::Price => "per_gpu ASC, p.slug ASC, i.instance_type ASC",
        InstanceSort::PriceDesc => "per_gpu DESC, p.slug DESC, i.instance_type DESC",
        InstanceSort::GpuCount => "i.gpu_count DESC, per_gpu ASC, p.slug ASC",
        InstanceSort::Provider => "p.slug ASC, per_gpu ASC, i.instance_type ASC",
    }
}

#[async_trait]
impl ReadStore for PgStore {
    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceListing>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT i.id, p.slug AS provider_slug, p.name AS provider_name, p.reliability_tier,
                   g.slug AS gpu_slug, g.name AS gpu_name, i.instance_type, i.gpu_count,
                   i.price_per_hour, i.price_per_hour_spot,
                   i.price_per_hour / GREATEST(i.gpu_count, 1) AS per_gpu,
                   i.vcpus, i.memory_gb, i.regions, i.availability_status, i.last_scraped_at
            FROM instances i
            JOIN providers p ON p.id = i.provider_id
            JOIN gpu_models g ON g.id = i.gpu_model_id
            WHERE i.is_active
              AND ($1::text IS NULL OR g.slug = $1)
              AND ($2::text IS NULL OR p.slug = $2)
              AND (NOT $3 OR i.availability_status IN ('available', 'limited'))
            ORDER BY {}
            LIMIT $4
            "#,
            order_clause(filter.sort)
        ))
        .bind(&filter.gpu_slug)
        .bind(&filter.provider_slug)
        .bind(filter.available_only)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok::<_, StoreError>(InstanceListing {
                    instance_id: row.try_get("id")?,
                    provider_slug: row.try_get("provider_slug")?,
                    provider_name: row.try_get("provider_name")?,
                    reliability_tier: parse_column(row, "reliability_tier")?,
                    gpu_slug: row.try_get("gpu_slug")?,
                    gpu_name: row.try_get("gpu_name")?,
                    instance_type: row.try_get("instance_type")?,
                    gpu_count: row.try_get("gpu_count")?,
                    price_per_hour: row.try_get("price_per_hour")?,
                    price_per_hour_spot: row.try_get("price_per_hour_spot")?,
                    price_per_gpu_hour: row.try_get("per_gpu")?,
                    vcpus: row.try_get("vcpus")?,
                    memory_gb: row.try_get("memory_gb")?,
                    regions: row.try_get("regions")?,
                    availability_status: parse_column(row, "availability_status")?,
                    last_scraped_at: row.try_get("last_scraped_at")?,
                })
            })
            .collect()
    }

    async fn price_history(
        &self,
        gpu_model_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistoryListing>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.slug AS provider_slug, i.instance_type, h.price_per_gpu_hour,
                   h.spot_price_per_gpu_hour, h.recorded_at
            FROM price_history h
            JOIN instances i ON i.id = h.instance_id
            JOIN providers p ON p.id = i.provider_id
            WHERE i.gpu_model_id = $1 AND h.recorded_at >= $2
            ORDER BY h.recorded_at ASC, h.id ASC
            "#,
        )
        .bind(gpu_model_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok::<_, StoreError>(HistoryListing {
                    provider_slug: row.try_get("provider_slug")?,
                    instance_type: row.try_get("instance_type")?,
                    price_per_gpu_hour: row.try_get("price_per_gpu_hour")?,
                    spot_price_per_gpu_hour: row.try_get("spot_price_per_gpu_hour")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }

    async fn create_subscription(
        &self,
        subscription: &NewAlertSubscription,
    ) -> Result<SubscriptionOutcome, StoreError> {
        let email = subscription.email.trim().to_ascii_lowercase();
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM price_alert_subscriptions
            WHERE is_active AND email = $1 AND gpu_model_id = $2
              AND provider_id IS NOT DISTINCT FROM $3
            FOR UPDATE
            "#
        ))
        .bind(&email)
        .bind(subscription.gpu_model_id)
        .bind(subscription.provider_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = if let Some(row) = existing {
            let mut sub = subscription_from_row(&row)?;
            sqlx::query(
                "UPDATE price_alert_subscriptions SET target_price_per_gpu_hour = $2 WHERE id = $1",
            )
            .bind(sub.id)
            .bind(subscription.target_price_per_gpu_hour)
            .execute(&mut *tx)
            .await?;
            sub.target_price_per_gpu_hour = subscription.target_price_per_gpu_hour;
            if sub.confirmed_at.is_some() {
                SubscriptionOutcome::AlreadyConfirmed(sub)
            } else {
                SubscriptionOutcome::PendingConfirmation(sub)
            }
        } else {
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO price_alert_subscriptions (
                  id, email, gpu_model_id, provider_id, target_price_per_gpu_hour,
                  confirmation_token, unsubscribe_token
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING {SUBSCRIPTION_COLUMNS}
                "#
            ))
            .bind(Uuid::new_v4())
            .bind(&email)
            .bind(subscription.gpu_model_id)
            .bind(subscription.provider_id)
            .bind(subscription.target_price_per_gpu_hour)
            .bind(new_token())
            .bind(new_token())
            .fetch_one(&mut *tx)
            .await?;
            SubscriptionOutcome::PendingConfirmation(subscription_from_row(&row)?)
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn confirm_subscription(
        &self,
        token: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<AlertSubscription>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE price_alert_subscriptions
            SET confirmed_at = COALESCE(confirmed_at, $2)
            WHERE confirmation_token = $1 AND is_active
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(token)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn unsubscribe(&self, token: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE price_alert_subscriptions SET is_active = false \
             WHERE unsubscribe_token = $1 AND is_active",
        )
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
