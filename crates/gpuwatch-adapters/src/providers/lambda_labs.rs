//! Lambda Labs public cloud REST API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use gpuwatch_core::{normalize_gpu_slug, AvailabilityStatus, PricingInstance};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{retain_priced, AdapterContext, AdapterError, PricingAdapter, SourceKind};

const DEFAULT_API_BASE: &str = "https://cloud.lambdalabs.com/api/v1";

#[derive(Debug, Deserialize)]
struct InstanceTypesResponse {
    data: BTreeMap<String, InstanceTypeEntry>,
}

#[derive(Debug, Deserialize)]
struct InstanceTypeEntry {
    instance_type: InstanceType,
    #[serde(default)]
    regions_with_capacity_available: Vec<Region>,
}

#[derive(Debug, Deserialize)]
struct InstanceType {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    gpu_description: Option<String>,
    price_cents_per_hour: f64,
    specs: Specs,
}

#[derive(Debug, Deserialize)]
struct Specs {
    #[serde(default)]
    vcpus: Option<i32>,
    #[serde(default)]
    memory_gib: Option<f64>,
    #[serde(default)]
    storage_gib: Option<f64>,
    gpus: i32,
}

#[derive(Debug, Deserialize)]
struct Region {
    name: String,
}

/// Converts an `/instance-types` response body into pricing records.
pub fn parse_instance_types(body: &str) -> Result<Vec<PricingInstance>, AdapterError> {
    let response: InstanceTypesResponse = serde_json::from_str(body)?;
    let mut out = Vec::with_capacity(response.data.len());
    for entry in response.data.into_values() {
        let it = entry.instance_type;
        let gpu_name = it
            .gpu_description
            .as_deref()
            .or(it.description.as_deref())
            .unwrap_or(&it.name)
            .to_string();
        let Some(slug) = normalize_gpu_slug(&gpu_name) else {
            debug!(instance_type = %it.name, %gpu_name, "dropping unresolved gpu");
            continue;
        };
        let regions = entry
            .regions_with_capacity_available
            .into_iter()
            .map(|r| r.name)
            .collect::<Vec<_>>();

        let mut item = PricingInstance::new(
            &it.name,
            slug,
            it.specs.gpus,
            it.price_cents_per_hour / 100.0,
        );
        item.vcpus = it.specs.vcpus;
        item.memory_gb = it.specs.memory_gib;
        item.storage_gb = it.specs.storage_gib;
        item.availability_status = if regions.is_empty() {
            AvailabilityStatus::Unavailable
        } else {
            AvailabilityStatus::Available
        };
        item.raw_data = json!({
            "name": it.name,
            "gpu_description": gpu_name,
            "price_cents_per_hour": it.price_cents_per_hour,
            "regions": regions,
        });
        item.regions = regions;
        out.push(item);
    }
    Ok(retain_priced(out))
}

pub struct LambdaLabsAdapter;

#[async_trait]
impl PricingAdapter for LambdaLabsAdapter {
    fn provider_slug(&self) -> &'static str {
        "lambda-labs"
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::RestApi
    }

    async fn fetch_pricing(
        &self,
        ctx: &AdapterContext,
    ) -> Result<Vec<PricingInstance>, AdapterError> {
        let api_key = ctx.api_key.as_deref().ok_or_else(|| {
            AdapterError::Unauthorized("lambda-labs requires an API key".to_string())
        })?;
        let base = ctx
            .provider
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/');
        let url = format!("{base}/instance-types");
        let auth = format!("Bearer {api_key}");
        let body = ctx
            .client
            .fetch_text(
                self.provider_slug(),
                &url,
                &[("Authorization", auth.as_str()), ("Accept", "application/json")],
            )
            .await?;
        parse_instance_types(&body)
    }
}
