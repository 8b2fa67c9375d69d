//! Queue-driven worker pool. Each queue gets its own lane with an independent
//! concurrency limit; lanes poll `claim` and report back `complete`/`fail`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use gpuwatch_core::jobs::{JobPayload, QueueName};
use gpuwatch_storage::{ClaimedJob, JobQueue, JobState};
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::alerts::AlertMatcher;
use crate::browser::BrowserScrapeHandler;
use crate::fetch_job::PricingFetchJob;
use crate::maintenance::MaintenanceJob;
use crate::notify::Notifier;

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs one claimed job. `Ok` carries the result stored on the job row.
    async fn handle(&self, job: &ClaimedJob) -> anyhow::Result<Option<JsonValue>>;
}

/// Routes every payload kind to the component that owns it. Components left
/// unset make their payloads fail, so a process only consumes queues it is wired for.
#[derive(Default)]
pub struct PipelineHandler {
    pub fetch: Option<Arc<PricingFetchJob>>,
    pub alerts: Option<Arc<AlertMatcher>>,
    pub maintenance: Option<Arc<MaintenanceJob>>,
    pub browser: Option<Arc<BrowserScrapeHandler>>,
    pub notifier: Option<Arc<Notifier>>,
}

fn missing(component: &str) -> anyhow::Error {
    anyhow::anyhow!("{component} is not configured in this worker")
}

#[async_trait]
impl JobHandler for PipelineHandler {
    async fn handle(&self, job: &ClaimedJob) -> anyhow::Result<Option<JsonValue>> {
        match &job.payload {
            JobPayload::PricingFetch { provider_slug } => {
                let fetch = self.fetch.as_ref().ok_or_else(|| missing("pricing fetch"))?;
                let report = fetch.run(provider_slug).await?;
                Ok(Some(serde_json::to_value(report)?))
            }
            JobPayload::AlertMatch => {
                let alerts = self.alerts.as_ref().ok_or_else(|| missing("alert matcher"))?;
                let report = alerts.run().await?;
                Ok(Some(serde_json::to_value(report)?))
            }
            JobPayload::Maintenance => {
                let maintenance = self
                    .maintenance
                    .as_ref()
                    .ok_or_else(|| missing("maintenance"))?;
                let report = maintenance.run_at(Utc::now()).await?;
                Ok(Some(serde_json::to_value(report)?))
            }
            JobPayload::BrowserScrape(request) => {
                let browser = self.browser.as_ref().ok_or_else(|| missing("browser renderer"))?;
                Ok(Some(browser.render(request).await?))
            }
            JobPayload::Email { to, subject, text } => {
                let notifier = self.notifier.as_ref().ok_or_else(|| missing("notifier"))?;
                notifier.send_email(to, subject, text).await?;
                Ok(None)
            }
            JobPayload::Slack { text } => {
                let notifier = self.notifier.as_ref().ok_or_else(|| missing("notifier"))?;
                notifier.send_slack(text).await?;
                Ok(None)
            }
            JobPayload::Webhook { url, payload } => {
                let notifier = self.notifier.as_ref().ok_or_else(|| missing("notifier"))?;
                notifier.send_webhook(url, payload).await?;
                Ok(None)
            }
        }
    }
}

/// Claims one job from `queue` and runs it. Returns `false` when the queue was empty.
pub async fn process_next(
    queue: &dyn JobQueue,
    name: QueueName,
    handler: &dyn JobHandler,
) -> anyhow::Result<bool> {
    let Some(job) = queue.claim(name).await.context("claiming job")? else {
        return Ok(false);
    };
    let span = info_span!(
        "job",
        queue = name.as_str(),
        kind = job.payload.kind(),
        job_id = %job.id,
        attempt = job.attempt
    );
    async {
        match handler.handle(&job).await {
            Ok(result) => {
                queue.complete(job.id, result).await.context("completing job")?;
                debug!("job completed");
            }
            Err(err) => {
                let state = queue
                    .fail(job.id, &format!("{err:#}"))
                    .await
                    .context("failing job")?;
                match state {
                    JobState::Waiting => warn!(error = %err, max_attempts = job.max_attempts, "job failed, retry scheduled"),
                    _ => error!(error = %err, "job failed permanently"),
                }
            }
        }
        Ok(true)
    }
    .instrument(span)
    .await
}

/// Drains every runnable job currently on `queue`.
pub async fn drain(
    queue: &dyn JobQueue,
    name: QueueName,
    handler: &dyn JobHandler,
) -> anyhow::Result<usize> {
    let mut processed = 0;
    while process_next(queue, name, handler).await? {
        processed += 1;
    }
    Ok(processed)
}

struct Lane {
    queue: QueueName,
    concurrency: usize,
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    lanes: Vec<Lane>,
    idle_poll: Duration,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            queue,
            handler,
            lanes: Vec::new(),
            idle_poll: Duration::from_secs(1),
        }
    }

    pub fn lane(mut self, queue: QueueName, concurrency: usize) -> Self {
        self.lanes.push(Lane {
            queue,
            concurrency: concurrency.max(1),
        });
        self
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    /// Runs every lane until `shutdown` flips to `true`; in-flight jobs finish first.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();
        for lane in &self.lanes {
            info!(queue = lane.queue.as_str(), concurrency = lane.concurrency, "starting worker lane");
            for slot in 0..lane.concurrency {
                let queue = self.queue.clone();
                let handler = self.handler.clone();
                let name = lane.queue;
                let idle_poll = self.idle_poll;
                let mut shutdown = shutdown.clone();
                tasks.spawn(async move {
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        let worked = match process_next(queue.as_ref(), name, handler.as_ref()).await {
                            Ok(worked) => worked,
                            Err(err) => {
                                error!(queue = name.as_str(), slot, error = %format!("{err:#}"), "worker loop error");
                                false
                            }
                        };
                        if !worked {
                            tokio::select! {
                                _ = tokio::time::sleep(idle_poll) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                    }
                });
            }
        }
        while let Some(joined) = tasks.join_next().await {
            joined.context("worker task panicked")?;
        }
        info!("worker pool stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use gpuwatch_storage::{BackoffPolicy, EnqueueOptions, MemoryJobQueue};

    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _job: &ClaimedJob) -> anyhow::Result<Option<JsonValue>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("attempt {n} failed");
            }
            Ok(Some(serde_json::json!({ "ok": true })))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_jobs_retry_with_backoff_until_success() {
        let queue = MemoryJobQueue::new(BackoffPolicy {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
        });
        let handler = Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        };
        let id = queue
            .enqueue(&JobPayload::AlertMatch, EnqueueOptions::default())
            .await
            .unwrap();

        assert!(process_next(&queue, QueueName::Alerts, &handler).await.unwrap());
        // Retry is delayed, nothing runnable yet.
        assert!(!process_next(&queue, QueueName::Alerts, &handler).await.unwrap());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(process_next(&queue, QueueName::Alerts, &handler).await.unwrap());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(process_next(&queue, QueueName::Alerts, &handler).await.unwrap());

        let record = queue.job(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.attempts, 3);
    }

    #[tokio::test]
    async fn unwired_components_fail_their_payloads() {
        let queue = MemoryJobQueue::default();
        let handler = PipelineHandler::default();
        let id = queue
            .enqueue(
                &JobPayload::Slack { text: "hi".into() },
                EnqueueOptions {
                    max_attempts: Some(1),
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(drain(&queue, QueueName::Notifications, &handler).await.unwrap(), 1);
        let record = queue.job(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert!(record.last_error.unwrap().contains("notifier is not configured"));
    }

    #[tokio::test]
    async fn pool_stops_on_shutdown_signal() {
        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::default());
        let handler = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        queue
            .enqueue(&JobPayload::Maintenance, EnqueueOptions::default())
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let pool = WorkerPool::new(queue.clone(), handler.clone())
            .lane(QueueName::Aggregates, 1)
            .with_idle_poll(Duration::from_millis(10));
        let running = tokio::spawn(pool.run(rx));

        while handler.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        running.await.unwrap().unwrap();
    }
}
