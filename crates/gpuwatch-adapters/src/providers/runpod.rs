//! RunPod GraphQL `gpuTypes` query. Each GPU type yields a secure-cloud and a
//! community-cloud offering when the provider prices them.

use async_trait::async_trait;
use gpuwatch_core::{normalize_gpu_slug, AvailabilityStatus, PricingInstance};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{retain_priced, slugify, AdapterContext, AdapterError, PricingAdapter, SourceKind};

const DEFAULT_GRAPHQL_URL: &str = "https://api.runpod.io/graphql";

const GPU_TYPES_QUERY: &str = "query GpuTypes { gpuTypes { id displayName memoryInGb \
     secureCloud communityCloud securePrice communityPrice secureSpotPrice communitySpotPrice \
     lowestPrice(input: { gpuCount: 1 }) { stockStatus } } }";

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<GpuTypesData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GpuTypesData {
    gpu_types: Vec<GpuType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GpuType {
    id: String,
    display_name: String,
    #[serde(default)]
    memory_in_gb: Option<f64>,
    #[serde(default)]
    secure_cloud: bool,
    #[serde(default)]
    community_cloud: bool,
    #[serde(default)]
    secure_price: Option<f64>,
    #[serde(default)]
    community_price: Option<f64>,
    #[serde(default)]
    secure_spot_price: Option<f64>,
    #[serde(default)]
    community_spot_price: Option<f64>,
    #[serde(default)]
    lowest_price: Option<LowestPrice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LowestPrice {
    #[serde(default)]
    stock_status: Option<String>,
}

fn stock_to_availability(stock: Option<&str>) -> AvailabilityStatus {
    match stock.map(str::to_ascii_lowercase).as_deref() {
        Some("high") | Some("medium") => AvailabilityStatus::Available,
        Some("low") => AvailabilityStatus::Limited,
        Some("none") | Some("unavailable") => AvailabilityStatus::Unavailable,
        _ => AvailabilityStatus::Unknown,
    }
}

/// Converts a `gpuTypes` GraphQL response into pricing records.
pub fn parse_gpu_types(body: &JsonValue) -> Result<Vec<PricingInstance>, AdapterError> {
    let response: GraphQlResponse = serde_json::from_value(body.clone())?;
    if let Some(first) = response.errors.first() {
        return Err(AdapterError::Parse(format!("graphql error: {}", first.message)));
    }
    let data = response
        .data
        .ok_or_else(|| AdapterError::Parse("graphql response without data".to_string()))?;

    let mut out = Vec::new();
    for gpu in data.gpu_types {
        let Some(slug) = normalize_gpu_slug(&gpu.display_name).or_else(|| normalize_gpu_slug(&gpu.id))
        else {
            debug!(gpu = %gpu.display_name, "dropping unresolved gpu");
            continue;
        };
        let availability = stock_to_availability(
            gpu.lowest_price
                .as_ref()
                .and_then(|p| p.stock_status.as_deref()),
        );
        let base = slugify(&gpu.id);
        let variants = [
            ("secure", gpu.secure_cloud, gpu.secure_price, gpu.secure_spot_price),
            (
                "community",
                gpu.community_cloud,
                gpu.community_price,
                gpu.community_spot_price,
            ),
        ];
        for (cloud, offered, price, spot) in variants {
            let Some(price) = price.filter(|_| offered) else {
                continue;
            };
            let mut item = PricingInstance::new(format!("{base}-{cloud}"), slug, 1, price);
            item.price_per_hour_spot = spot;
            item.availability_status = availability;
            item.raw_data = json!({
                "id": gpu.id,
                "displayName": gpu.display_name,
                "memoryInGb": gpu.memory_in_gb,
                "cloud": cloud,
                "price": price,
                "spotPrice": spot,
            });
            out.push(item);
        }
    }
    Ok(retain_priced(out))
}

pub struct RunpodAdapter;

#[async_trait]
impl PricingAdapter for RunpodAdapter {
    fn provider_slug(&self) -> &'static str {
        "runpod"
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::GraphQl
    }

    async fn fetch_pricing(
        &self,
        ctx: &AdapterContext,
    ) -> Result<Vec<PricingInstance>, AdapterError> {
        let url = ctx
            .provider
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_GRAPHQL_URL);
        let auth = ctx.api_key.as_ref().map(|key| format!("Bearer {key}"));
        let mut headers = vec![("Content-Type", "application/json")];
        if let Some(auth) = auth.as_deref() {
            headers.push(("Authorization", auth));
        }
        let body: JsonValue = ctx
            .client
            .post_json(
                self.provider_slug(),
                url,
                &headers,
                &json!({ "query": GPU_TYPES_QUERY }),
            )
            .await?;
        parse_gpu_types(&body)
    }
}
