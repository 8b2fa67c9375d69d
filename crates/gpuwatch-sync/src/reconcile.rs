//! Merges one provider's fetched batch into the live instance table.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gpuwatch_core::{Instance, NewPriceHistory, PricingInstance, Provider, ReconcileCounts};
use gpuwatch_storage::{PipelineStore, ReconcileTx, StoreError};
use tracing::{debug, info};
use uuid::Uuid;

const PRICE_EPSILON: f64 = 1e-9;

fn price_moved(old: f64, new: f64) -> bool {
    (old - new).abs() > PRICE_EPSILON
}

fn spot_moved(old: Option<f64>, new: Option<f64>) -> bool {
    match (old, new) {
        (Some(a), Some(b)) => price_moved(a, b),
        (None, None) => false,
        _ => true,
    }
}

/// Copies every mutable field of a fetched record onto the live row.
fn apply_fetched(instance: &mut Instance, item: &PricingInstance, gpu_model_id: Uuid) {
    instance.gpu_model_id = gpu_model_id;
    instance.gpu_count = item.gpu_count;
    instance.price_per_hour = item.price_per_hour;
    instance.price_per_hour_spot = item.price_per_hour_spot;
    instance.vcpus = item.vcpus;
    instance.memory_gb = item.memory_gb;
    instance.storage_gb = item.storage_gb;
    instance.network_bandwidth_gbps = item.network_bandwidth_gbps;
    instance.regions = item.regions.clone();
    instance.availability_status = item.availability_status;
    instance.raw_data = item.raw_data.clone();
}

fn history_point(instance: &Instance, scrape_job_id: Uuid, at: DateTime<Utc>) -> NewPriceHistory {
    NewPriceHistory {
        instance_id: instance.id,
        scrape_job_id,
        price_per_gpu_hour: instance.price_per_gpu_hour(),
        spot_price_per_gpu_hour: instance.spot_price_per_gpu_hour(),
        recorded_at: at,
    }
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn PipelineStore>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    /// Upserts `items`, appends history for new or re-priced instances and
    /// deactivates whatever the provider stopped reporting, all in one transaction.
    pub async fn reconcile(
        &self,
        provider: &Provider,
        scrape_job_id: Uuid,
        items: &[PricingInstance],
        now: DateTime<Utc>,
    ) -> Result<ReconcileCounts, StoreError> {
        let catalog = self.store.gpu_catalog().await?;
        let mut tx = self.store.begin_reconcile().await?;

        let mut counts = ReconcileCounts {
            seen: items.len() as i32,
            ..ReconcileCounts::default()
        };
        let mut keep: Vec<String> = Vec::with_capacity(items.len());
        let mut batch_types: HashSet<&str> = HashSet::with_capacity(items.len());

        for item in items {
            if !batch_types.insert(item.instance_type.as_str()) {
                debug!(provider = %provider.slug, instance_type = %item.instance_type, "duplicate instance type in batch, keeping first");
                continue;
            }
            // Still advertised, so an existing row stays active even if unresolved.
            keep.push(item.instance_type.clone());
            let Some(&gpu_model_id) = catalog.get(&item.gpu_slug) else {
                debug!(provider = %provider.slug, gpu = %item.gpu_slug, "gpu slug not in catalog, skipping");
                continue;
            };

            match tx.find_instance(provider.id, &item.instance_type).await? {
                Some(mut existing) => {
                    let was_active = existing.is_active;
                    let old_price = existing.price_per_gpu_hour();
                    let old_spot = existing.spot_price_per_gpu_hour();
                    apply_fetched(&mut existing, item, gpu_model_id);
                    existing.is_active = true;
                    existing.last_scraped_at = now;
                    existing.scrape_job_id = Some(scrape_job_id);
                    existing.updated_at = now;
                    tx.update_instance(&existing).await?;
                    counts.updated += 1;

                    let repriced = price_moved(old_price, existing.price_per_gpu_hour())
                        || spot_moved(old_spot, existing.spot_price_per_gpu_hour());
                    if repriced || !was_active {
                        tx.append_price_history(&history_point(&existing, scrape_job_id, now))
                            .await?;
                    }
                }
                None => {
                    let mut instance = Instance {
                        id: Uuid::new_v4(),
                        provider_id: provider.id,
                        gpu_model_id,
                        instance_type: item.instance_type.clone(),
                        gpu_count: item.gpu_count,
                        price_per_hour: item.price_per_hour,
                        price_per_hour_spot: None,
                        vcpus: None,
                        memory_gb: None,
                        storage_gb: None,
                        network_bandwidth_gbps: None,
                        regions: Vec::new(),
                        availability_status: item.availability_status,
                        is_active: true,
                        last_scraped_at: now,
                        scrape_job_id: Some(scrape_job_id),
                        raw_data: serde_json::Value::Null,
                        created_at: now,
                        updated_at: now,
                    };
                    apply_fetched(&mut instance, item, gpu_model_id);
                    tx.insert_instance(&instance).await?;
                    tx.append_price_history(&history_point(&instance, scrape_job_id, now))
                        .await?;
                    counts.created += 1;
                }
            }
        }

        counts.deactivated = deactivate_and_commit(tx, provider.id, &keep, now).await? as i32;
        info!(
            provider = %provider.slug,
            seen = counts.seen,
            created = counts.created,
            updated = counts.updated,
            deactivated = counts.deactivated,
            "reconciled pricing batch"
        );
        Ok(counts)
    }
}

async fn deactivate_and_commit(
    mut tx: Box<dyn ReconcileTx>,
    provider_id: Uuid,
    keep: &[String],
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let deactivated = tx.deactivate_missing(provider_id, keep, now).await?;
    tx.commit().await?;
    Ok(deactivated)
}
