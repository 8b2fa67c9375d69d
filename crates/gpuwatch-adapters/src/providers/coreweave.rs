//! CoreWeave static pricing page. Rows of the GPU pricing table are
//! `model | gpus | vcpus | memory | on-demand price`.

use async_trait::async_trait;
use gpuwatch_core::{normalize_gpu_slug, AvailabilityStatus, PricingInstance};
use scraper::Html;
use serde_json::json;
use tracing::debug;

use crate::html::{element_text, first_number, selector};
use crate::{retain_priced, slugify, AdapterContext, AdapterError, PricingAdapter, SourceKind};

const DEFAULT_PRICING_URL: &str = "https://www.coreweave.com/pricing";

pub fn parse_pricing_table(html: &str) -> Result<Vec<PricingInstance>, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector("table.pricing-table tbody tr")?;
    let cell_sel = selector("td")?;

    let mut out = Vec::new();
    for row in document.select(&row_sel) {
        let cells = row
            .select(&cell_sel)
            .map(|c| element_text(c).unwrap_or_default())
            .collect::<Vec<_>>();
        if cells.len() < 5 {
            continue;
        }
        let model = &cells[0];
        let Some(slug) = normalize_gpu_slug(model) else {
            debug!(model = %model, "dropping unresolved gpu");
            continue;
        };
        let gpu_count = first_number(&cells[1]).map(|n| n as i32).unwrap_or(1);
        let Some(price) = first_number(&cells[4]) else {
            continue;
        };
        let mut item = PricingInstance::new(
            format!("{}-{gpu_count}x", slugify(model)),
            slug,
            gpu_count,
            price,
        );
        item.vcpus = first_number(&cells[2]).map(|n| n as i32);
        item.memory_gb = first_number(&cells[3]);
        item.availability_status = AvailabilityStatus::Available;
        item.raw_data = json!({ "cells": cells });
        out.push(item);
    }

    if out.is_empty() && document.select(&row_sel).next().is_none() {
        return Err(AdapterError::Parse(
            "pricing table not found on page".to_string(),
        ));
    }
    Ok(retain_priced(out))
}

pub struct CoreweaveAdapter;

#[async_trait]
impl PricingAdapter for CoreweaveAdapter {
    fn provider_slug(&self) -> &'static str {
        "coreweave"
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::Html
    }

    async fn fetch_pricing(
        &self,
        ctx: &AdapterContext,
    ) -> Result<Vec<PricingInstance>, AdapterError> {
        let url = ctx
            .provider
            .pricing_url
            .as_deref()
            .unwrap_or(DEFAULT_PRICING_URL);
        let html = ctx
            .client
            .fetch_text(self.provider_slug(), url, &[("Accept", "text/html")])
            .await?;
        parse_pricing_table(&html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_rows_become_instances() {
        let html = r#"<table class="pricing-table"><tbody>
            <tr><td>NVIDIA HGX H100</td><td>8</td><td>128</td><td>2,048 GB</td><td>$49.24/hr</td></tr>
            <tr><td>NVIDIA L40S</td><td>8</td><td>128</td><td>1,024 GB</td><td>$18.00/hr</td></tr>
            <tr><td>CPU Only</td><td>0</td><td>32</td><td>128 GB</td><td>$1.20/hr</td></tr>
            <tr><td>NVIDIA A40</td><td>1</td><td>8</td><td>64 GB</td><td>Contact us</td></tr>
        </tbody></table>"#;
        let items = parse_pricing_table(html).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].instance_type, "nvidia-hgx-h100-8x");
        assert_eq!(items[0].gpu_slug, "h100-sxm");
        assert_eq!(items[0].memory_gb, Some(2048.0));
        assert_eq!(items[0].price_per_gpu_hour(), 6.155);
        assert_eq!(items[1].gpu_slug, "l40s");
    }

    #[test]
    fn missing_table_is_a_parse_error() {
        let err = parse_pricing_table("<html><body>maintenance</body></html>").unwrap_err();
        assert_eq!(err.code(), "parse_error");
    }
}
