//! Reference data seeding from `catalog/*.yaml`.

use std::path::Path;

use anyhow::{Context, Result};
use gpuwatch_core::{GpuModel, Provider, ReliabilityTier};
use gpuwatch_storage::CatalogStore;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
struct GpuModelsFile {
    gpu_models: Vec<GpuModelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpuModelEntry {
    pub slug: String,
    pub name: String,
    pub vram_gb: i32,
    #[serde(default)]
    pub architecture: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProvidersFile {
    providers: Vec<ProviderEntry>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub slug: String,
    pub name: String,
    pub reliability_tier: ReliabilityTier,
    #[serde(default)]
    pub pricing_url: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub has_public_api: bool,
    #[serde(default)]
    pub supports_spot: bool,
    #[serde(default)]
    pub supports_reserved: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    pub gpu_models: Vec<GpuModelEntry>,
    pub providers: Vec<ProviderEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub gpu_models: usize,
    pub providers: usize,
}

async fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

impl Catalog {
    /// Loads `gpu_models.yaml` and `providers.yaml` from `dir`.
    pub async fn load(dir: &Path) -> Result<Self> {
        let gpus: GpuModelsFile = read_yaml(&dir.join("gpu_models.yaml")).await?;
        let providers: ProvidersFile = read_yaml(&dir.join("providers.yaml")).await?;
        Ok(Self {
            gpu_models: gpus.gpu_models,
            providers: providers.providers,
        })
    }

    /// Upserts every entry by slug; existing rows keep their ids.
    pub async fn seed(&self, store: &dyn CatalogStore) -> Result<SeedReport> {
        for entry in &self.gpu_models {
            store
                .upsert_gpu_model(&GpuModel {
                    id: Uuid::new_v4(),
                    slug: entry.slug.clone(),
                    name: entry.name.clone(),
                    vram_gb: entry.vram_gb,
                    architecture: entry.architecture.clone(),
                })
                .await
                .with_context(|| format!("upserting gpu model {}", entry.slug))?;
        }
        for entry in &self.providers {
            store
                .upsert_provider(&Provider {
                    id: Uuid::new_v4(),
                    slug: entry.slug.clone(),
                    name: entry.name.clone(),
                    reliability_tier: entry.reliability_tier,
                    pricing_url: entry.pricing_url.clone(),
                    api_base_url: entry.api_base_url.clone(),
                    has_public_api: entry.has_public_api,
                    supports_spot: entry.supports_spot,
                    supports_reserved: entry.supports_reserved,
                    is_active: entry.is_active,
                })
                .await
                .with_context(|| format!("upserting provider {}", entry.slug))?;
        }
        let report = SeedReport {
            gpu_models: self.gpu_models.len(),
            providers: self.providers.len(),
        };
        info!(gpu_models = report.gpu_models, providers = report.providers, "catalog seeded");
        Ok(report)
    }
}
