//! Provider pricing adapters and the scrape client they share.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpuwatch_core::{PricingInstance, Provider};
use gpuwatch_storage::{FetchError, QueueError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod client;
mod html;
pub mod providers;

pub use client::ScrapeClient;

pub const CRATE_NAME: &str = "gpuwatch-adapters";

/// How an adapter reaches its provider's pricing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    RestApi,
    GraphQl,
    Html,
    BrowserRendered,
}

/// Failure classes an adapter can surface. Adapters raise these instead of
/// returning an empty batch so the fetch job can classify the cycle.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("upstream_{status}")]
    Upstream { status: u16 },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("browser_scrape_invalid_result: {0}")]
    BrowserScrapeInvalidResult(String),
    #[error("browser scrape failed: {0}")]
    BrowserScrapeFailed(String),
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    /// Short code recorded on the scrape job.
    pub fn code(&self) -> String {
        match self {
            Self::Unauthorized(_) => "unauthorized".to_string(),
            Self::Upstream { status } => format!("upstream_{status}"),
            Self::Timeout(_) => "timeout".to_string(),
            Self::Transport(_) => "transport_error".to_string(),
            Self::Parse(_) => "parse_error".to_string(),
            Self::BrowserScrapeInvalidResult(_) => "browser_scrape_invalid_result".to_string(),
            Self::BrowserScrapeFailed(_) => "browser_scrape_failed".to_string(),
            Self::Message(_) => "adapter_error".to_string(),
        }
    }
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Unauthorized { .. } => Self::Unauthorized(err.to_string()),
            FetchError::Upstream { status, .. } => Self::Upstream { status },
            FetchError::Timeout { .. } => Self::Timeout(err.to_string()),
            FetchError::Request(ref inner) if inner.is_timeout() => Self::Timeout(err.to_string()),
            FetchError::Decode { .. } => Self::Parse(err.to_string()),
            FetchError::InvalidHeader(_) => Self::Message(err.to_string()),
            FetchError::HttpStatus { .. } | FetchError::Request(_) => {
                Self::Transport(err.to_string())
            }
        }
    }
}

impl From<QueueError> for AdapterError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::WaitTimeout { .. } => Self::Timeout(err.to_string()),
            QueueError::JobFailed { error, .. } => Self::BrowserScrapeFailed(error),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Everything an adapter needs for one fetch.
#[derive(Clone)]
pub struct AdapterContext {
    pub provider: Provider,
    pub now: DateTime<Utc>,
    pub client: Arc<ScrapeClient>,
    pub api_key: Option<String>,
}

impl AdapterContext {
    /// Builds a context whose API key comes from `GPUWATCH_API_KEY_<SLUG>`.
    pub fn from_env(provider: Provider, now: DateTime<Utc>, client: Arc<ScrapeClient>) -> Self {
        let api_key = std::env::var(api_key_env_var(&provider.slug))
            .ok()
            .filter(|v| !v.trim().is_empty());
        Self {
            provider,
            now,
            client,
            api_key,
        }
    }
}

/// `lambda-labs` -> `GPUWATCH_API_KEY_LAMBDA_LABS`.
pub fn api_key_env_var(provider_slug: &str) -> String {
    let suffix = provider_slug
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect::<String>();
    format!("GPUWATCH_API_KEY_{suffix}")
}

#[async_trait]
pub trait PricingAdapter: Send + Sync {
    fn provider_slug(&self) -> &'static str;
    fn source_kind(&self) -> SourceKind;

    /// Fetches and normalizes the provider's current offerings.
    async fn fetch_pricing(&self, ctx: &AdapterContext)
        -> Result<Vec<PricingInstance>, AdapterError>;
}

/// `Some(price)` when the value is a usable hourly price.
pub fn accept_price(value: f64) -> Option<f64> {
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Drops records with unusable prices and clears unusable spot prices.
pub fn retain_priced(items: Vec<PricingInstance>) -> Vec<PricingInstance> {
    items
        .into_iter()
        .filter(|item| accept_price(item.price_per_hour).is_some() && item.gpu_count > 0)
        .map(|mut item| {
            item.price_per_hour_spot = item.price_per_hour_spot.and_then(accept_price);
            item
        })
        .collect()
}

/// Lower-case, dash-separated form used for synthesized instance types.
pub(crate) fn slugify(value: &str) -> String {
    value
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Provider slug -> adapter.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<&'static str, Arc<dyn PricingAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every shipped adapter.
    pub fn with_default_adapters() -> Self {
        let mut registry = Self::new();
        for slug in providers::PROVIDER_SLUGS {
            if let Some(adapter) = adapter_for_provider(slug) {
                registry.register(adapter);
            }
        }
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn PricingAdapter>) {
        self.adapters.insert(adapter.provider_slug(), adapter);
    }

    pub fn get(&self, provider_slug: &str) -> Option<Arc<dyn PricingAdapter>> {
        self.adapters.get(provider_slug).cloned()
    }

    pub fn slugs(&self) -> Vec<&'static str> {
        self.adapters.keys().copied().collect()
    }
}

pub fn adapter_for_provider(provider_slug: &str) -> Option<Arc<dyn PricingAdapter>> {
    match provider_slug {
        "lambda-labs" => Some(Arc::new(providers::lambda_labs::LambdaLabsAdapter)),
        "runpod" => Some(Arc::new(providers::runpod::RunpodAdapter)),
        "vast-ai" => Some(Arc::new(providers::vast_ai::VastAiAdapter)),
        "coreweave" => Some(Arc::new(providers::coreweave::CoreweaveAdapter)),
        "datacrunch" => Some(Arc::new(providers::datacrunch::DatacrunchAdapter)),
        _ => None,
    }
}
