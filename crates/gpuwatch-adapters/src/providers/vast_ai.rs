//! Vast.ai marketplace offers, aggregated to the cheapest offer per
//! `(gpu, gpu count)` so the marketplace's churn does not flood reconciliation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use gpuwatch_core::{normalize_gpu_slug, AvailabilityStatus, PricingInstance};
use serde::Deserialize;
use serde_json::json;

use crate::{accept_price, retain_priced, AdapterContext, AdapterError, PricingAdapter, SourceKind};

const DEFAULT_OFFERS_URL: &str = "https://console.vast.ai/api/v0/bundles/?q=%7B%22rentable%22%3A%7B%22eq%22%3Atrue%7D%2C%22type%22%3A%22on-demand%22%7D";

#[derive(Debug, Deserialize)]
struct OffersResponse {
    offers: Vec<Offer>,
}

#[derive(Debug, Clone, Deserialize)]
struct Offer {
    id: i64,
    gpu_name: String,
    num_gpus: i32,
    dph_total: f64,
    #[serde(default)]
    min_bid: Option<f64>,
    #[serde(default)]
    cpu_cores_effective: Option<f64>,
    /// MB
    #[serde(default)]
    cpu_ram: Option<f64>,
    #[serde(default)]
    disk_space: Option<f64>,
    /// Mbps
    #[serde(default)]
    inet_down: Option<f64>,
    #[serde(default)]
    geolocation: Option<String>,
    #[serde(default = "default_rentable")]
    rentable: bool,
}

fn default_rentable() -> bool {
    true
}

#[derive(Default)]
struct OfferGroup {
    cheapest: Option<Offer>,
    min_bid: Option<f64>,
    regions: Vec<String>,
    offer_count: usize,
    any_rentable: bool,
}

/// Converts a bundles response into one record per `(gpu, count)` group.
pub fn parse_offers(body: &str) -> Result<Vec<PricingInstance>, AdapterError> {
    let response: OffersResponse = serde_json::from_str(body)?;
    let mut groups: BTreeMap<(&'static str, i32), OfferGroup> = BTreeMap::new();

    for offer in response.offers {
        let Some(slug) = normalize_gpu_slug(&offer.gpu_name) else {
            continue;
        };
        if offer.num_gpus <= 0 || accept_price(offer.dph_total).is_none() {
            continue;
        }
        let group = groups.entry((slug, offer.num_gpus)).or_default();
        group.offer_count += 1;
        group.any_rentable |= offer.rentable;
        if let Some(bid) = offer.min_bid.and_then(accept_price) {
            group.min_bid = Some(group.min_bid.map_or(bid, |b| b.min(bid)));
        }
        if let Some(region) = offer.geolocation.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            if !group.regions.iter().any(|r| r == region) {
                group.regions.push(region.to_string());
            }
        }
        let cheaper = group
            .cheapest
            .as_ref()
            .map_or(true, |c| offer.dph_total < c.dph_total);
        if cheaper {
            group.cheapest = Some(offer);
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for ((slug, count), mut group) in groups {
        let Some(offer) = group.cheapest else {
            continue;
        };
        group.regions.sort();
        let mut item = PricingInstance::new(format!("{slug}-{count}x"), slug, count, offer.dph_total);
        item.price_per_hour_spot = group.min_bid;
        item.vcpus = offer.cpu_cores_effective.map(|c| c.round() as i32);
        item.memory_gb = offer.cpu_ram.map(|mb| (mb / 1024.0).round());
        item.storage_gb = offer.disk_space;
        item.network_bandwidth_gbps = offer.inet_down.map(|mbps| mbps / 1000.0);
        item.availability_status = match (group.any_rentable, group.offer_count) {
            (false, _) => AvailabilityStatus::Unavailable,
            (true, 1) => AvailabilityStatus::Limited,
            (true, _) => AvailabilityStatus::Available,
        };
        item.raw_data = json!({
            "cheapest_offer_id": offer.id,
            "gpu_name": offer.gpu_name,
            "offer_count": group.offer_count,
        });
        item.regions = group.regions;
        out.push(item);
    }
    Ok(retain_priced(out))
}

pub struct VastAiAdapter;

#[async_trait]
impl PricingAdapter for VastAiAdapter {
    fn provider_slug(&self) -> &'static str {
        "vast-ai"
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::RestApi
    }

    async fn fetch_pricing(
        &self,
        ctx: &AdapterContext,
    ) -> Result<Vec<PricingInstance>, AdapterError> {
        let url = ctx
            .provider
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_OFFERS_URL);
        let auth = ctx.api_key.as_ref().map(|key| format!("Bearer {key}"));
        let mut headers = vec![("Accept", "application/json")];
        if let Some(auth) = auth.as_deref() {
            headers.push(("Authorization", auth));
        }
        let body = ctx
            .client
            .fetch_text(self.provider_slug(), url, &headers)
            .await?;
        parse_offers(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offers_collapse_to_cheapest_per_gpu_and_count() {
        let body = r#"{"offers": [
            {"id": 1, "gpu_name": "RTX 4090", "num_gpus": 1, "dph_total": 0.45, "min_bid": 0.25,
             "cpu_cores_effective": 16, "cpu_ram": 65536, "inet_down": 800, "geolocation": "US"},
            {"id": 2, "gpu_name": "RTX 4090", "num_gpus": 1, "dph_total": 0.38, "min_bid": 0.3,
             "geolocation": "Sweden"},
            {"id": 3, "gpu_name": "RTX 4090", "num_gpus": 2, "dph_total": 0.9, "geolocation": "US"},
            {"id": 4, "gpu_name": "Quadro K2200", "num_gpus": 1, "dph_total": 0.05}
        ]}"#;
        let items = parse_offers(body).unwrap();
        assert_eq!(items.len(), 2);
        let single = &items[0];
        assert_eq!(single.instance_type, "rtx-4090-1x");
        assert_eq!(single.price_per_hour, 0.38);
        assert_eq!(single.price_per_hour_spot, Some(0.25));
        assert_eq!(single.regions, vec!["Sweden", "US"]);
        assert_eq!(single.availability_status, AvailabilityStatus::Available);
        assert_eq!(single.raw_data["cheapest_offer_id"], 2);
        let double = &items[1];
        assert_eq!(double.instance_type, "rtx-4090-2x");
        assert_eq!(double.price_per_gpu_hour(), 0.45);
        assert_eq!(double.availability_status, AvailabilityStatus::Limited);
    }
}
