//! Read-model rows served by the comparison API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AvailabilityStatus, GpuModel, ReliabilityTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceSort {
    #[default]
    Price,
    PriceDesc,
    GpuCount,
    Provider,
}

impl InstanceSort {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "price" => Some(Self::Price),
            "price_desc" => Some(Self::PriceDesc),
            "gpu_count" => Some(Self::GpuCount),
            "provider" => Some(Self::Provider),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceFilter {
    pub gpu_slug: Option<String>,
    pub provider_slug: Option<String>,
    pub available_only: bool,
    pub sort: InstanceSort,
    pub limit: usize,
}

impl Default for InstanceFilter {
    fn default() -> Self {
        Self {
            gpu_slug: None,
            provider_slug: None,
            available_only: false,
            sort: InstanceSort::Price,
            limit: 500,
        }
    }
}

/// One active instance joined with its provider and GPU model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceListing {
    pub instance_id: Uuid,
    pub provider_slug: String,
    pub provider_name: String,
    pub reliability_tier: ReliabilityTier,
    pub gpu_slug: String,
    pub gpu_name: String,
    pub instance_type: String,
    pub gpu_count: i32,
    pub price_per_hour: f64,
    pub price_per_hour_spot: Option<f64>,
    pub price_per_gpu_hour: f64,
    pub vcpus: Option<i32>,
    pub memory_gb: Option<f64>,
    pub regions: Vec<String>,
    pub availability_status: AvailabilityStatus,
    pub last_scraped_at: DateTime<Utc>,
}

/// Sorts listings in place according to `sort`, cheapest-per-GPU first for ties.
pub fn sort_listings(rows: &mut [InstanceListing], sort: InstanceSort) {
    let by_price = |a: &InstanceListing, b: &InstanceListing| {
        a.price_per_gpu_hour
            .total_cmp(&b.price_per_gpu_hour)
            .then_with(|| a.provider_slug.cmp(&b.provider_slug))
            .then_with(|| a.instance_type.cmp(&b.instance_type))
    };
    match sort {
        InstanceSort::Price => rows.sort_by(by_price),
        InstanceSort::PriceDesc => rows.sort_by(|a, b| by_price(b, a)),
        InstanceSort::GpuCount => {
            rows.sort_by(|a, b| b.gpu_count.cmp(&a.gpu_count).then_with(|| by_price(a, b)))
        }
        InstanceSort::Provider => rows.sort_by(|a, b| {
            a.provider_slug
                .cmp(&b.provider_slug)
                .then_with(|| by_price(a, b))
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceStats {
    pub count: usize,
    pub min: f64,
    pub median: f64,
    pub max: f64,
}

impl PriceStats {
    /// Summary over per-GPU hourly prices; `None` for an empty set.
    pub fn from_prices(prices: &[f64]) -> Option<Self> {
        let mut sorted = prices
            .iter()
            .copied()
            .filter(|p| p.is_finite())
            .collect::<Vec<_>>();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        };
        Some(Self {
            count: n,
            min: sorted[0],
            median,
            max: sorted[n - 1],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuComparison {
    pub gpu: GpuModel,
    pub stats: PriceStats,
    pub providers: Vec<InstanceListing>,
}

impl GpuComparison {
    /// Builds the comparison from every active listing for one GPU.
    pub fn build(gpu: GpuModel, listings: Vec<InstanceListing>) -> Option<Self> {
        let prices = listings.iter().map(|l| l.price_per_gpu_hour).collect::<Vec<_>>();
        let stats = PriceStats::from_prices(&prices)?;
        let mut sorted = listings;
        sort_listings(&mut sorted, InstanceSort::Price);
        let mut providers: Vec<InstanceListing> = Vec::new();
        for row in sorted {
            if !providers.iter().any(|p| p.provider_slug == row.provider_slug) {
                providers.push(row);
            }
        }
        Some(Self {
            gpu,
            stats,
            providers,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryListing {
    pub provider_slug: String,
    pub instance_type: String,
    pub price_per_gpu_hour: f64,
    pub spot_price_per_gpu_hour: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn listing(provider: &str, instance_type: &str, per_gpu: f64) -> InstanceListing {
        InstanceListing {
            instance_id: Uuid::new_v4(),
            provider_slug: provider.into(),
            provider_name: provider.into(),
            reliability_tier: ReliabilityTier::Standard,
            gpu_slug: "h100-sxm".into(),
            gpu_name: "H100 SXM".into(),
            instance_type: instance_type.into(),
            gpu_count: 1,
            price_per_hour: per_gpu,
            price_per_hour_spot: None,
            price_per_gpu_hour: per_gpu,
            vcpus: None,
            memory_gb: None,
            regions: vec![],
            availability_status: AvailabilityStatus::Available,
            last_scraped_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn median_handles_odd_and_even_sets() {
        let odd = PriceStats::from_prices(&[3.0, 1.0, 2.0]).unwrap();
        assert_eq!((odd.min, odd.median, odd.max), (1.0, 2.0, 3.0));
        let even = PriceStats::from_prices(&[4.0, 1.0, 2.0, 3.0]).unwrap();
        assert_eq!(even.median, 2.5);
        assert!(PriceStats::from_prices(&[]).is_none());
    }

    #[test]
    fn comparison_keeps_cheapest_row_per_provider() {
        let gpu = GpuModel {
            id: Uuid::new_v4(),
            slug: "h100-sxm".into(),
            name: "H100 SXM".into(),
            vram_gb: 80,
            architecture: Some("hopper".into()),
        };
        let cmp = GpuComparison::build(
            gpu,
            vec![
                listing("runpod", "secure", 2.99),
                listing("lambda-labs", "1x", 2.49),
                listing("runpod", "community", 2.69),
            ],
        )
        .unwrap();
        assert_eq!(cmp.stats.count, 3);
        assert_eq!(cmp.stats.median, 2.69);
        let picked = cmp
            .providers
            .iter()
            .map(|p| (p.provider_slug.as_str(), p.instance_type.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(picked, vec![("lambda-labs", "1x"), ("runpod", "community")]);
    }
}
