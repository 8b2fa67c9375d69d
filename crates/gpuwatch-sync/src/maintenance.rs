use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use gpuwatch_storage::{JobQueue, PipelineStore};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired_scrape_jobs: u64,
    pub pruned_jobs: u64,
}

/// Housekeeping on the `aggregates` queue: times out abandoned scrape jobs and
/// prunes finished queue rows.
pub struct MaintenanceJob {
    store: Arc<dyn PipelineStore>,
    queue: Arc<dyn JobQueue>,
    stale_after: Duration,
    retain_finished: Duration,
}

impl MaintenanceJob {
    pub fn new(store: Arc<dyn PipelineStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            store,
            queue,
            stale_after: Duration::minutes(30),
            retain_finished: Duration::days(7),
        }
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> anyhow::Result<MaintenanceReport> {
        let expired_scrape_jobs = self
            .store
            .expire_stale_scrape_jobs(now - self.stale_after, now)
            .await?;
        let pruned_jobs = self.queue.prune_finished(now - self.retain_finished).await?;
        info!(expired_scrape_jobs, pruned_jobs, "maintenance finished");
        Ok(MaintenanceReport {
            expired_scrape_jobs,
            pruned_jobs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuwatch_core::ScrapeStatus;
    use gpuwatch_storage::{MemoryJobQueue, MemoryStore};
    use uuid::Uuid;

    #[tokio::test]
    async fn stale_running_jobs_time_out() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let stale = store
            .open_scrape_job(Uuid::new_v4(), now - Duration::minutes(45))
            .await
            .unwrap();
        let fresh = store
            .open_scrape_job(Uuid::new_v4(), now - Duration::minutes(5))
            .await
            .unwrap();

        let job = MaintenanceJob::new(store.clone(), Arc::new(MemoryJobQueue::default()));
        let report = job.run_at(now).await.unwrap();
        assert_eq!(report.expired_scrape_jobs, 1);

        let stale = store.scrape_job(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, ScrapeStatus::Timeout);
        assert_eq!(stale.error_code.as_deref(), Some("stale_running"));
        let fresh = store.scrape_job(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, ScrapeStatus::Running);
    }
}
