//! Durable job queue seam plus an in-process implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpuwatch_core::jobs::{JobPayload, QueueName};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {job_id} did not finish within {waited:?}")]
    WaitTimeout { job_id: Uuid, waited: Duration },
    #[error("job {job_id} failed: {error}")]
    JobFailed { job_id: Uuid, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub delay: Duration,
    pub max_attempts: Option<i32>,
    /// While a job with the same key is waiting or active, enqueue returns its id.
    pub dedupe_key: Option<String>,
}

impl EnqueueOptions {
    pub fn deduped(key: impl Into<String>) -> Self {
        Self {
            dedupe_key: Some(key.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts: i32,
    pub max_attempts: i32,
    pub dedupe_key: Option<String>,
    pub run_at: DateTime<Utc>,
    pub result: Option<JsonValue>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub queue: QueueName,
    pub payload: JobPayload,
    /// 1-based attempt number of this claim.
    pub attempt: i32,
    pub max_attempts: i32,
}

/// Exponential retry delay between job attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues onto the payload's queue and returns the job id.
    async fn enqueue(&self, payload: &JobPayload, options: EnqueueOptions)
        -> Result<Uuid, QueueError>;

    /// Claims the oldest runnable job on `queue`, if any.
    async fn claim(&self, queue: QueueName) -> Result<Option<ClaimedJob>, QueueError>;

    async fn complete(&self, job_id: Uuid, result: Option<JsonValue>) -> Result<(), QueueError>;

    /// Records a failed attempt. Returns `Waiting` when a retry was scheduled.
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<JobState, QueueError>;

    async fn job(&self, job_id: Uuid) -> Result<Option<JobRecord>, QueueError>;

    /// Deletes completed and failed jobs last touched before `before`.
    async fn prune_finished(&self, before: DateTime<Utc>) -> Result<u64, QueueError>;
}

/// Polls until the job completes and returns its result value.
pub async fn wait_for_job(
    queue: &dyn JobQueue,
    job_id: Uuid,
    timeout: Duration,
    poll_every: Duration,
) -> Result<Option<JsonValue>, QueueError> {
    let started = Instant::now();
    loop {
        let record = queue.job(job_id).await?.ok_or(QueueError::NotFound(job_id))?;
        match record.state {
            JobState::Completed => return Ok(record.result),
            JobState::Failed => {
                return Err(QueueError::JobFailed {
                    job_id,
                    error: record.last_error.unwrap_or_default(),
                })
            }
            JobState::Waiting | JobState::Active => {}
        }
        let waited = started.elapsed();
        if waited >= timeout {
            return Err(QueueError::WaitTimeout { job_id, waited });
        }
        tokio::time::sleep(poll_every.min(timeout - waited)).await;
    }
}

#[derive(Debug, Clone)]
struct MemoryJob {
    seq: u64,
    record: JobRecord,
    ready_at: Instant,
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    next_seq: u64,
    jobs: HashMap<Uuid, MemoryJob>,
}

/// Queue kept in process memory. Readiness uses tokio time so paused-clock tests
/// can step through retry delays.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobQueue {
    backoff: BackoffPolicy,
    state: Arc<Mutex<MemoryQueueState>>,
}

impl MemoryJobQueue {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            backoff,
            state: Arc::default(),
        }
    }

    /// Every job on `queue` in enqueue order.
    pub async fn jobs(&self, queue: QueueName) -> Vec<JobRecord> {
        let state = self.state.lock().await;
        let mut jobs = state
            .jobs
            .values()
            .filter(|j| j.record.queue == queue)
            .collect::<Vec<_>>();
        jobs.sort_by_key(|j| j.seq);
        jobs.into_iter().map(|j| j.record.clone()).collect()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        payload: &JobPayload,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        let queue = payload.queue();
        let mut state = self.state.lock().await;
        if let Some(key) = &options.dedupe_key {
            if let Some(existing) = state.jobs.values().find(|j| {
                j.record.queue == queue
                    && j.record.dedupe_key.as_deref() == Some(key.as_str())
                    && matches!(j.record.state, JobState::Waiting | JobState::Active)
            }) {
                return Ok(existing.record.id);
            }
        }

        let now = Utc::now();
        let delay = chrono::Duration::from_std(options.delay).unwrap_or_default();
        let id = Uuid::new_v4();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.jobs.insert(
            id,
            MemoryJob {
                seq,
                ready_at: Instant::now() + options.delay,
                record: JobRecord {
                    id,
                    queue,
                    payload: payload.clone(),
                    state: JobState::Waiting,
                    attempts: 0,
                    max_attempts: options.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
                    dedupe_key: options.dedupe_key,
                    run_at: now + delay,
                    result: None,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                },
            },
        );
        Ok(id)
    }

    async fn claim(&self, queue: QueueName) -> Result<Option<ClaimedJob>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let Some(job) = state
            .jobs
            .values_mut()
            .filter(|j| {
                j.record.queue == queue && j.record.state == JobState::Waiting && j.ready_at <= now
            })
            .min_by_key(|j| (j.ready_at, j.seq))
        else {
            return Ok(None);
        };
        job.record.state = JobState::Active;
        job.record.attempts += 1;
        job.record.updated_at = Utc::now();
        Ok(Some(ClaimedJob {
            id: job.record.id,
            queue,
            payload: job.record.payload.clone(),
            attempt: job.record.attempts,
            max_attempts: job.record.max_attempts,
        }))
    }

    async fn complete(&self, job_id: Uuid, result: Option<JsonValue>) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        job.record.state = JobState::Completed;
        job.record.result = result;
        job.record.updated_at = Utc::now();
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<JobState, QueueError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        job.record.last_error = Some(error.to_string());
        job.record.updated_at = Utc::now();
        if job.record.attempts < job.record.max_attempts {
            let delay = self
                .backoff
                .delay_for_attempt(job.record.attempts.saturating_sub(1) as usize);
            job.record.state = JobState::Waiting;
            job.ready_at = Instant::now() + delay;
            job.record.run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        } else {
            job.record.state = JobState::Failed;
        }
        Ok(job.record.state)
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<JobRecord>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).map(|j| j.record.clone()))
    }

    async fn prune_finished(&self, before: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut state = self.state.lock().await;
        let before_len = state.jobs.len();
        state.jobs.retain(|_, j| {
            !(matches!(j.record.state, JobState::Completed | JobState::Failed)
                && j.record.updated_at < before)
        });
        Ok((before_len - state.jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(slug: &str) -> JobPayload {
        JobPayload::PricingFetch {
            provider_slug: slug.into(),
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn dedupe_key_collapses_pending_jobs() {
        let queue = MemoryJobQueue::default();
        let a = queue
            .enqueue(&fetch("runpod"), EnqueueOptions::deduped("runpod"))
            .await
            .unwrap();
        let b = queue
            .enqueue(&fetch("runpod"), EnqueueOptions::deduped("runpod"))
            .await
            .unwrap();
        assert_eq!(a, b);

        let claimed = queue.claim(QueueName::PricingFetch).await.unwrap().unwrap();
        queue.complete(claimed.id, None).await.unwrap();
        let c = queue
            .enqueue(&fetch("runpod"), EnqueueOptions::deduped("runpod"))
            .await
            .unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_retry_with_backoff_then_fail() {
        let queue = MemoryJobQueue::new(BackoffPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
        });
        let id = queue
            .enqueue(
                &fetch("vast-ai"),
                EnqueueOptions {
                    max_attempts: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let first = queue.claim(QueueName::PricingFetch).await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        assert_eq!(queue.fail(id, "upstream_503").await.unwrap(), JobState::Waiting);
        assert!(queue.claim(QueueName::PricingFetch).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(10)).await;
        let second = queue.claim(QueueName::PricingFetch).await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(queue.fail(id, "upstream_503").await.unwrap(), JobState::Failed);

        let err = wait_for_job(&queue, id, Duration::from_secs(1), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::JobFailed { ref error, .. } if error == "upstream_503"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_job_times_out_and_returns_results() {
        let queue = MemoryJobQueue::default();
        let id = queue
            .enqueue(
                &JobPayload::Slack { text: "hi".into() },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        let err = wait_for_job(&queue, id, Duration::from_secs(2), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::WaitTimeout { .. }));

        queue
            .complete(id, Some(serde_json::json!({"ok": true})))
            .await
            .unwrap();
        let result = wait_for_job(&queue, id, Duration::from_secs(2), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn prune_drops_only_finished_jobs() {
        let queue = MemoryJobQueue::default();
        let done = queue
            .enqueue(&fetch("a"), EnqueueOptions::default())
            .await
            .unwrap();
        queue
            .enqueue(&fetch("b"), EnqueueOptions::default())
            .await
            .unwrap();
        queue.claim(QueueName::PricingFetch).await.unwrap();
        queue.complete(done, None).await.unwrap();
        let pruned = queue
            .prune_finished(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(queue.jobs(QueueName::PricingFetch).await.len(), 1);
    }
}
