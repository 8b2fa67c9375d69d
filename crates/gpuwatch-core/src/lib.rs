//! Core domain model for the gpuwatch pricing pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod gpu;
pub mod jobs;
pub mod listing;

pub use gpu::{known_gpu_slugs, normalize_gpu_slug};

pub const CRATE_NAME: &str = "gpuwatch-core";

#[derive(Debug, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Provider reliability tier. Drives breaker tuning and alert framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityTier {
    Enterprise,
    Standard,
    Community,
}

impl ReliabilityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enterprise => "enterprise",
            Self::Standard => "standard",
            Self::Community => "community",
        }
    }
}

impl fmt::Display for ReliabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReliabilityTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enterprise" => Ok(Self::Enterprise),
            "standard" => Ok(Self::Standard),
            "community" => Ok(Self::Community),
            other => Err(ParseEnumError {
                kind: "reliability tier",
                value: other.to_string(),
            }),
        }
    }
}

/// CMS-owned provider metadata. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub reliability_tier: ReliabilityTier,
    pub pricing_url: Option<String>,
    pub api_base_url: Option<String>,
    pub has_public_api: bool,
    pub supports_spot: bool,
    pub supports_reserved: bool,
    pub is_active: bool,
}

/// Canonical catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuModel {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub vram_gb: i32,
    pub architecture: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityStatus {
    Available,
    Limited,
    Unavailable,
    #[default]
    Unknown,
}

impl AvailabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Limited => "limited",
            Self::Unavailable => "unavailable",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for AvailabilityStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "limited" => Ok(Self::Limited),
            "unavailable" => Ok(Self::Unavailable),
            "unknown" => Ok(Self::Unknown),
            other => Err(ParseEnumError {
                kind: "availability status",
                value: other.to_string(),
            }),
        }
    }
}

/// Normalized handoff contract from adapters into the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingInstance {
    pub instance_type: String,
    pub gpu_slug: String,
    pub gpu_count: i32,
    pub price_per_hour: f64,
    pub price_per_hour_spot: Option<f64>,
    pub vcpus: Option<i32>,
    pub memory_gb: Option<f64>,
    pub storage_gb: Option<f64>,
    pub network_bandwidth_gbps: Option<f64>,
    pub regions: Vec<String>,
    pub availability_status: AvailabilityStatus,
    pub raw_data: JsonValue,
}

impl PricingInstance {
    pub fn new(
        instance_type: impl Into<String>,
        gpu_slug: impl Into<String>,
        gpu_count: i32,
        price_per_hour: f64,
    ) -> Self {
        Self {
            instance_type: instance_type.into(),
            gpu_slug: gpu_slug.into(),
            gpu_count,
            price_per_hour,
            price_per_hour_spot: None,
            vcpus: None,
            memory_gb: None,
            storage_gb: None,
            network_bandwidth_gbps: None,
            regions: Vec::new(),
            availability_status: AvailabilityStatus::Unknown,
            raw_data: JsonValue::Null,
        }
    }

    pub fn price_per_gpu_hour(&self) -> f64 {
        per_gpu(self.price_per_hour, self.gpu_count)
    }

    pub fn spot_price_per_gpu_hour(&self) -> Option<f64> {
        self.price_per_hour_spot.map(|p| per_gpu(p, self.gpu_count))
    }
}

/// Current state of one offering, keyed by `(provider_id, instance_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub gpu_model_id: Uuid,
    pub instance_type: String,
    pub gpu_count: i32,
    pub price_per_hour: f64,
    pub price_per_hour_spot: Option<f64>,
    pub vcpus: Option<i32>,
    pub memory_gb: Option<f64>,
    pub storage_gb: Option<f64>,
    pub network_bandwidth_gbps: Option<f64>,
    pub regions: Vec<String>,
    pub availability_status: AvailabilityStatus,
    pub is_active: bool,
    pub last_scraped_at: DateTime<Utc>,
    pub scrape_job_id: Option<Uuid>,
    pub raw_data: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn price_per_gpu_hour(&self) -> f64 {
        per_gpu(self.price_per_hour, self.gpu_count)
    }

    pub fn spot_price_per_gpu_hour(&self) -> Option<f64> {
        self.price_per_hour_spot.map(|p| per_gpu(p, self.gpu_count))
    }
}

fn per_gpu(price: f64, gpu_count: i32) -> f64 {
    price / f64::from(gpu_count.max(1))
}

/// Append-only observation of an instance's price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryPoint {
    pub id: i64,
    pub instance_id: Uuid,
    pub scrape_job_id: Option<Uuid>,
    pub price_per_gpu_hour: f64,
    pub spot_price_per_gpu_hour: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPriceHistory {
    pub instance_id: Uuid,
    pub scrape_job_id: Uuid,
    pub price_per_gpu_hour: f64,
    pub spot_price_per_gpu_hour: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    Running,
    Completed,
    Failed,
    Timeout,
    RateLimited,
}

impl ScrapeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScrapeStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "rate_limited" => Ok(Self::RateLimited),
            other => Err(ParseEnumError {
                kind: "scrape status",
                value: other.to_string(),
            }),
        }
    }
}

/// Audit record of one provider fetch cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub status: ScrapeStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub instances_found: i32,
    pub instances_created: i32,
    pub instances_updated: i32,
    pub instances_deactivated: i32,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
}

/// Final state written onto a `ScrapeJob` exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJobOutcome {
    pub status: ScrapeStatus,
    pub finished_at: DateTime<Utc>,
    pub counts: ReconcileCounts,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
}

impl ScrapeJobOutcome {
    pub fn completed(finished_at: DateTime<Utc>, counts: ReconcileCounts) -> Self {
        Self {
            status: ScrapeStatus::Completed,
            finished_at,
            counts,
            error_message: None,
            error_code: None,
        }
    }

    pub fn failed(
        status: ScrapeStatus,
        finished_at: DateTime<Utc>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            finished_at,
            counts: ReconcileCounts::default(),
            error_message: Some(message.into()),
            error_code: Some(code.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReconcileCounts {
    pub seen: i32,
    pub created: i32,
    pub updated: i32,
    pub deactivated: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceAnomaly {
    pub id: i64,
    pub instance_id: Uuid,
    pub price_history_id: i64,
    pub previous_price_history_id: i64,
    pub scrape_job_id: Option<Uuid>,
    pub old_price: f64,
    pub new_price: f64,
    pub percent_change: f64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPriceAnomaly {
    pub instance_id: Uuid,
    pub price_history_id: i64,
    pub previous_price_history_id: i64,
    pub scrape_job_id: Option<Uuid>,
    pub old_price: f64,
    pub new_price: f64,
    pub percent_change: f64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSubscription {
    pub id: Uuid,
    pub email: String,
    pub gpu_model_id: Uuid,
    pub provider_id: Option<Uuid>,
    pub target_price_per_gpu_hour: f64,
    pub confirmation_token: String,
    pub unsubscribe_token: String,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAlertSubscription {
    pub email: String,
    pub gpu_model_id: Uuid,
    pub provider_id: Option<Uuid>,
    pub target_price_per_gpu_hour: f64,
}

/// Cheapest active offering within an alert scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub instance_id: Uuid,
    pub provider_slug: String,
    pub provider_name: String,
    pub instance_type: String,
    pub price_per_gpu_hour: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_gpu_price_divides_by_count() {
        let mut inst = PricingInstance::new("gpu_8x_h100", "h100-sxm", 8, 20.0);
        inst.price_per_hour_spot = Some(12.0);
        assert_eq!(inst.price_per_gpu_hour(), 2.5);
        assert_eq!(inst.spot_price_per_gpu_hour(), Some(1.5));
    }

    #[test]
    fn zero_gpu_count_does_not_divide_by_zero() {
        let inst = PricingInstance::new("cpu-only", "h100-sxm", 0, 3.0);
        assert_eq!(inst.price_per_gpu_hour(), 3.0);
    }

    #[test]
    fn enums_round_trip_through_strings() {
        assert_eq!("Enterprise".parse::<ReliabilityTier>().unwrap(), ReliabilityTier::Enterprise);
        assert!("gold".parse::<ReliabilityTier>().is_err());
        assert_eq!(
            ScrapeStatus::RateLimited.as_str().parse::<ScrapeStatus>().unwrap(),
            ScrapeStatus::RateLimited
        );
        assert_eq!(
            serde_json::to_string(&AvailabilityStatus::Limited).unwrap(),
            "\"limited\""
        );
    }
}
