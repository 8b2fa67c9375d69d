use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gpuwatch_adapters::AdapterRegistry;
use gpuwatch_core::jobs::{JobPayload, QueueName};
use gpuwatch_storage::{
    BackoffPolicy, CacheBackend, EnqueueOptions, JobQueue, PgJobQueue, PgStore, RedisCache,
};
use gpuwatch_sync::{pipeline_handler, Catalog, PipelineHandler, PipelineScheduler, SyncConfig, WorkerPool};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gpuwatch")]
#[command(about = "GPU cloud price ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending database migrations.
    Migrate,
    /// Upsert GPU models and providers from the catalog directory.
    Seed {
        #[arg(long, default_value = "catalog")]
        catalog_dir: PathBuf,
    },
    /// Consume every queue until Ctrl-C.
    Worker {
        /// Also register the repeatable jobs from this process.
        #[arg(long)]
        with_scheduler: bool,
    },
    /// Register repeatable jobs only; no queue consumption.
    Schedule,
    /// Fetch one provider, either through the queue or in this process.
    Fetch {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        inline: bool,
    },
    /// Run one alert matching pass in this process.
    MatchAlerts,
    /// Serve the read API.
    Serve,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("gpuwatch=info".parse()?);
    let json = std::env::var("GPUWATCH_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<(Arc<PgStore>, Arc<PgJobQueue>)> {
    let max_connections =
        (config.fetch_concurrency + config.browser_concurrency + config.notify_concurrency + 4) as u32;
    let store = PgStore::connect(&config.database_url, max_connections)
        .await
        .context("connecting to database")?;
    let queue = PgJobQueue::new(store.pool().clone(), BackoffPolicy::default());
    Ok((Arc::new(store), Arc::new(queue)))
}

/// Shared response cache for invalidation after fetches; absent without Redis.
fn shared_cache(config: &SyncConfig) -> Result<Option<Arc<dyn CacheBackend>>> {
    match config.redis_url.as_deref() {
        Some(url) => {
            let cache = RedisCache::new(url, std::time::Duration::from_millis(500))
                .context("connecting to redis")?;
            Ok(Some(Arc::new(cache)))
        }
        None => {
            info!("REDIS_URL not set, api cache invalidation disabled");
            Ok(None)
        }
    }
}

fn build_handler(config: &SyncConfig, store: Arc<PgStore>, queue: Arc<PgJobQueue>) -> Result<PipelineHandler> {
    pipeline_handler(config, store, queue, shared_cache(config)?)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Worker {
        with_scheduler: false,
    }) {
        Commands::Migrate => {
            let (store, _) = connect(&config).await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Seed { catalog_dir } => {
            let (store, _) = connect(&config).await?;
            let catalog = Catalog::load(&catalog_dir).await?;
            let report = catalog.seed(store.as_ref()).await?;
            println!(
                "catalog seeded: gpu_models={} providers={}",
                report.gpu_models, report.providers
            );
        }
        Commands::Worker { with_scheduler } => {
            let (store, queue) = connect(&config).await?;
            let handler = build_handler(&config, store.clone(), queue.clone())?;
            let mut pool = WorkerPool::new(queue.clone(), Arc::new(handler))
                .lane(QueueName::PricingFetch, config.fetch_concurrency)
                .lane(QueueName::Aggregates, 1)
                .lane(QueueName::Alerts, 1)
                .lane(QueueName::Notifications, config.notify_concurrency);
            if config.browserless_url.is_some() {
                pool = pool.lane(QueueName::BrowserScrape, config.browser_concurrency);
            } else {
                warn!("BROWSERLESS_URL not set, browser-scrape queue is not consumed by this worker");
            }

            let scheduler = PipelineScheduler::new(
                config.clone(),
                store.clone(),
                queue.clone(),
                AdapterRegistry::with_default_adapters(),
            );
            let mut sched = if with_scheduler {
                Some(scheduler.build().await?)
            } else {
                scheduler.maybe_build().await?
            };
            if let Some(sched) = &sched {
                sched.start().await.context("starting scheduler")?;
            }

            let (tx, rx) = watch::channel(false);
            let running = tokio::spawn(pool.run(rx));
            shutdown_signal().await;
            info!("shutdown requested, draining in-flight jobs");
            let _ = tx.send(true);
            running.await.context("worker pool task")??;
            if let Some(sched) = sched.as_mut() {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Schedule => {
            let (store, queue) = connect(&config).await?;
            let scheduler = PipelineScheduler::new(
                config.clone(),
                store,
                queue,
                AdapterRegistry::with_default_adapters(),
            );
            let mut sched = scheduler.build().await?;
            sched.start().await.context("starting scheduler")?;
            shutdown_signal().await;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Fetch { provider, inline } => {
            let (store, queue) = connect(&config).await?;
            if inline {
                let handler = build_handler(&config, store, queue)?;
                let fetch = handler.fetch.context("pricing fetch is not configured")?;
                let report = fetch.run(&provider).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let job_id = queue
                    .enqueue(
                        &JobPayload::PricingFetch {
                            provider_slug: provider.clone(),
                        },
                        EnqueueOptions::default(),
                    )
                    .await
                    .with_context(|| format!("enqueueing fetch for {provider}"))?;
                println!("enqueued pricing-fetch job {job_id} for {provider}");
            }
        }
        Commands::MatchAlerts => {
            let (store, queue) = connect(&config).await?;
            let handler = build_handler(&config, store, queue)?;
            let alerts = handler.alerts.context("alert matcher is not configured")?;
            let report = alerts.run().await?;
            println!("alert match complete: scanned={} notified={}", report.scanned, report.notified);
        }
        Commands::Serve => {
            gpuwatch_web::serve_from_env().await?;
        }
    }

    Ok(())
}
