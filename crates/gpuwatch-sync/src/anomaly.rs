//! Flags large moves between consecutive price observations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gpuwatch_core::NewPriceAnomaly;
use gpuwatch_storage::{PipelineStore, StoreError};
use tracing::info;
use uuid::Uuid;

/// Relative change magnitude at or above which a move is anomalous.
pub const ANOMALY_THRESHOLD: f64 = 0.5;

// Absorbs float noise from per-GPU division so an exact 50% move still trips.
const THRESHOLD_TOLERANCE: f64 = 1e-9;

/// Signed relative change, `None` when the old price cannot be compared against.
pub fn relative_change(old: f64, new: f64) -> Option<f64> {
    if !old.is_finite() || !new.is_finite() || old <= 0.0 {
        return None;
    }
    Some((new - old) / old)
}

pub fn is_anomalous(old: f64, new: f64) -> bool {
    relative_change(old, new)
        .is_some_and(|change| change.abs() + THRESHOLD_TOLERANCE >= ANOMALY_THRESHOLD)
}

#[derive(Clone)]
pub struct AnomalyDetector {
    store: Arc<dyn PipelineStore>,
}

impl AnomalyDetector {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    /// Compares each history row written by `scrape_job_id` for `provider_id`
    /// against its predecessor. Returns the anomalies newly inserted.
    pub async fn detect(
        &self,
        provider_id: Uuid,
        scrape_job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<NewPriceAnomaly>, StoreError> {
        let mut found = Vec::new();
        for point in self
            .store
            .job_history_points(provider_id, scrape_job_id)
            .await?
        {
            let Some(previous) = self.store.previous_history_point(&point).await? else {
                continue;
            };
            let old = previous.price_per_gpu_hour;
            let new = point.price_per_gpu_hour;
            let Some(change) = relative_change(old, new).filter(|_| is_anomalous(old, new)) else {
                continue;
            };
            let anomaly = NewPriceAnomaly {
                instance_id: point.instance_id,
                price_history_id: point.id,
                previous_price_history_id: previous.id,
                scrape_job_id: Some(scrape_job_id),
                old_price: old,
                new_price: new,
                percent_change: change * 100.0,
                detected_at: now,
            };
            if self.store.insert_anomaly(&anomaly).await? {
                info!(
                    instance_id = %anomaly.instance_id,
                    old_price = old,
                    new_price = new,
                    percent_change = anomaly.percent_change,
                    "price anomaly detected"
                );
                found.push(anomaly);
            }
        }
        Ok(found)
    }
}

/// One-line operator message for a provider's anomalies.
pub fn operator_summary(provider_name: &str, anomalies: &[NewPriceAnomaly]) -> String {
    let largest = anomalies
        .iter()
        .map(|a| a.percent_change)
        .max_by(|a, b| a.abs().total_cmp(&b.abs()))
        .unwrap_or_default();
    format!(
        "[gpuwatch] {} price anomal{} on {provider_name} (largest move {largest:+.1}%)",
        anomalies.len(),
        if anomalies.len() == 1 { "y" } else { "ies" },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::ReconciliationEngine;
    use gpuwatch_core::{GpuModel, PricingInstance, Provider, ReliabilityTier};
    use gpuwatch_storage::{CatalogStore, MemoryStore};

    async fn provider(store: &MemoryStore, slug: &str) -> Provider {
        store
            .upsert_provider(&Provider {
                id: Uuid::new_v4(),
                slug: slug.to_string(),
                name: slug.to_uppercase(),
                reliability_tier: ReliabilityTier::Standard,
                pricing_url: None,
                api_base_url: None,
                has_public_api: true,
                supports_spot: false,
                supports_reserved: false,
                is_active: true,
            })
            .await
            .unwrap()
    }

    async fn store_with_h100() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_gpu_model(&GpuModel {
                id: Uuid::new_v4(),
                slug: "h100-sxm".into(),
                name: "H100 SXM".into(),
                vram_gb: 80,
                architecture: None,
            })
            .await
            .unwrap();
        store
    }

    /// Reconciles one H100 offer at `price` under a fresh scrape job id.
    async fn observe(
        engine: &ReconciliationEngine,
        provider: &Provider,
        price: f64,
        at: DateTime<Utc>,
    ) -> Uuid {
        let job_id = Uuid::new_v4();
        engine
            .reconcile(
                provider,
                job_id,
                &[PricingInstance::new("h100-1x", "h100-sxm", 1, price)],
                at,
            )
            .await
            .unwrap();
        job_id
    }

    #[tokio::test]
    async fn repeated_detection_for_one_job_inserts_once() {
        let store = store_with_h100().await;
        let p = provider(&store, "p").await;
        let engine = ReconciliationEngine::new(store.clone());
        let detector = AnomalyDetector::new(store.clone());
        let t0 = Utc::now();

        let first_job = observe(&engine, &p, 2.0, t0).await;
        assert!(detector.detect(p.id, first_job, t0).await.unwrap().is_empty());

        let t1 = t0 + chrono::Duration::minutes(15);
        let second_job = observe(&engine, &p, 1.0, t1).await;
        let found = detector.detect(p.id, second_job, t1).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!((found[0].old_price, found[0].new_price), (2.0, 1.0));
        assert!((found[0].percent_change + 50.0).abs() < 1e-9);

        let again = detector.detect(p.id, second_job, t1).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(store.snapshot().await.anomalies.len(), 1);
    }

    #[tokio::test]
    async fn detection_only_sees_the_given_job_and_provider() {
        let store = store_with_h100().await;
        let p = provider(&store, "p").await;
        let q = provider(&store, "q").await;
        let engine = ReconciliationEngine::new(store.clone());
        let detector = AnomalyDetector::new(store.clone());
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::minutes(15);

        let p_first = observe(&engine, &p, 2.0, t0).await;
        let p_second = observe(&engine, &p, 1.0, t1).await;
        let q_first = observe(&engine, &q, 2.0, t0).await;
        let q_second = observe(&engine, &q, 4.0, t1).await;

        // first observations have no predecessor
        assert!(detector.detect(p.id, p_first, t1).await.unwrap().is_empty());
        assert!(detector.detect(q.id, q_first, t1).await.unwrap().is_empty());
        // jobs belonging to the other provider
        assert!(detector.detect(p.id, q_second, t1).await.unwrap().is_empty());
        assert!(detector.detect(q.id, p_second, t1).await.unwrap().is_empty());
        assert!(store.snapshot().await.anomalies.is_empty());

        let found = detector.detect(p.id, p_second, t1).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].scrape_job_id, Some(p_second));
        let state = store.snapshot().await;
        let p_instance = state.instances.iter().find(|i| i.provider_id == p.id).unwrap();
        assert_eq!(state.anomalies.len(), 1);
        assert_eq!(state.anomalies[0].instance_id, p_instance.id);
    }

    #[test]
    fn threshold_is_inclusive_at_fifty_percent() {
        assert!(is_anomalous(2.00, 3.00));
        assert!(!is_anomalous(2.00, 2.99));
        assert!(is_anomalous(2.50, 1.00));
        assert!(!is_anomalous(2.00, 1.01));
        assert!(is_anomalous(2.00, 1.00));
    }

    #[test]
    fn zero_or_invalid_previous_price_is_never_anomalous() {
        assert_eq!(relative_change(0.0, 1.0), None);
        assert!(!is_anomalous(0.0, 5.0));
        assert!(!is_anomalous(f64::NAN, 5.0));
    }

    #[test]
    fn summary_reports_count_and_largest_move() {
        let base = NewPriceAnomaly {
            instance_id: Uuid::new_v4(),
            price_history_id: 2,
            previous_price_history_id: 1,
            scrape_job_id: None,
            old_price: 2.5,
            new_price: 1.0,
            percent_change: -60.0,
            detected_at: Utc::now(),
        };
        let mut up = base.clone();
        up.percent_change = 55.0;
        assert_eq!(
            operator_summary("Lambda Labs", &[up, base.clone()]),
            "[gpuwatch] 2 price anomalies on Lambda Labs (largest move -60.0%)"
        );
        assert_eq!(
            operator_summary("P", &[base]),
            "[gpuwatch] 1 price anomaly on P (largest move -60.0%)"
        );
    }
}
