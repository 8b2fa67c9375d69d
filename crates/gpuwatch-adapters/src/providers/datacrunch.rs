//! DataCrunch pricing is rendered client-side, so the page goes through the
//! browser-scrape round trip before the GPU cards are parsed.

use async_trait::async_trait;
use gpuwatch_core::jobs::{BrowserScrapeRequest, WaitUntil};
use gpuwatch_core::{normalize_gpu_slug, AvailabilityStatus, PricingInstance};
use scraper::Html;
use serde_json::json;

use crate::html::{first_number, first_text, selector};
use crate::{retain_priced, slugify, AdapterContext, AdapterError, PricingAdapter, SourceKind};

const DEFAULT_PRICING_URL: &str = "https://datacrunch.io/products";

fn availability_from_label(label: Option<&str>) -> AvailabilityStatus {
    let Some(label) = label.map(str::to_ascii_lowercase) else {
        return AvailabilityStatus::Unknown;
    };
    if label.contains("sold out") || label.contains("unavailable") {
        AvailabilityStatus::Unavailable
    } else if label.contains("limited") || label.contains("low") {
        AvailabilityStatus::Limited
    } else if label.contains("available") || label.contains("in stock") {
        AvailabilityStatus::Available
    } else {
        AvailabilityStatus::Unknown
    }
}

pub fn parse_gpu_cards(html: &str) -> Result<Vec<PricingInstance>, AdapterError> {
    let document = Html::parse_document(html);
    let card_sel = selector("div.gpu-card")?;
    let name_sel = selector(".gpu-name")?;
    let count_sel = selector(".gpu-count")?;
    let price_sel = selector(".price-on-demand")?;
    let spot_sel = selector(".price-spot")?;
    let avail_sel = selector(".availability")?;
    let location_sel = selector(".location")?;

    let cards = document.select(&card_sel).collect::<Vec<_>>();
    if cards.is_empty() {
        return Err(AdapterError::Parse("no gpu cards in rendered page".to_string()));
    }

    let mut out = Vec::new();
    for card in cards {
        let Some(name) = first_text(card, &name_sel) else {
            continue;
        };
        let Some(slug) = normalize_gpu_slug(&name) else {
            continue;
        };
        let gpu_count = first_text(card, &count_sel)
            .as_deref()
            .and_then(first_number)
            .map(|n| n as i32)
            .unwrap_or(1);
        let Some(price) = first_text(card, &price_sel).as_deref().and_then(first_number) else {
            continue;
        };
        let availability_label = first_text(card, &avail_sel);

        let mut item = PricingInstance::new(
            format!("{}-{gpu_count}x", slugify(&name)),
            slug,
            gpu_count,
            price,
        );
        item.price_per_hour_spot = first_text(card, &spot_sel).as_deref().and_then(first_number);
        item.availability_status = availability_from_label(availability_label.as_deref());
        item.regions = card
            .select(&location_sel)
            .filter_map(crate::html::element_text)
            .collect();
        item.raw_data = json!({
            "name": name,
            "availability": availability_label,
        });
        out.push(item);
    }
    Ok(retain_priced(out))
}

pub struct DatacrunchAdapter;

#[async_trait]
impl PricingAdapter for DatacrunchAdapter {
    fn provider_slug(&self) -> &'static str {
        "datacrunch"
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::BrowserRendered
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
        let mut request = BrowserScrapeRequest::new(url);
        request.timeout_ms = Some(30_000);
        request.wait_until = Some(WaitUntil::NetworkIdle2);
        request.block_resources = Some(true);
        let html = ctx.client.browser_html(request).await?;
        parse_gpu_cards(&html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_cards_are_parsed() {
        let html = r#"<div class="grid">
          <div class="gpu-card"><h3 class="gpu-name">H100 SXM5 80GB</h3>
            <span class="gpu-count">8x</span><span class="price-on-demand">$19.92/h</span>
            <span class="price-spot">$9.12/h</span><span class="availability">Available</span>
            <ul><li class="location">FIN-01</li><li class="location">ICE-01</li></ul></div>
          <div class="gpu-card"><h3 class="gpu-name">A100 SXM4 40GB</h3>
            <span class="gpu-count">1x</span><span class="price-on-demand">$1.29/h</span>
            <span class="availability">Sold out</span></div>
          <div class="gpu-card"><h3 class="gpu-name">Mystery Accelerator</h3>
            <span class="price-on-demand">$0.10/h</span></div>
        </div>"#;
        let items = parse_gpu_cards(html).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].instance_type, "h100-sxm5-80gb-8x");
        assert_eq!(items[0].gpu_slug, "h100-sxm");
        assert_eq!(items[0].price_per_gpu_hour(), 2.49);
        assert_eq!(items[0].spot_price_per_gpu_hour(), Some(1.14));
        assert_eq!(items[0].regions, vec!["FIN-01", "ICE-01"]);
        assert_eq!(items[1].gpu_slug, "a100-40gb");
        assert_eq!(items[1].availability_status, AvailabilityStatus::Unavailable);
    }

    #[test]
    fn page_without_cards_is_rejected() {
        assert!(parse_gpu_cards("<div>loading…</div>").is_err());
    }
}
