use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpuwatch_core::jobs::{JobPayload, QueueName};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::queue::{
    BackoffPolicy, ClaimedJob, EnqueueOptions, JobQueue, JobRecord, JobState, QueueError,
    DEFAULT_MAX_ATTEMPTS,
};

const JOB_COLUMNS: &str = "id, queue, payload, state, attempts, max_attempts, dedupe_key, \
     run_at, result, last_error, created_at, updated_at";

/// Job queue stored in the `jobs` table. Claims use `FOR UPDATE SKIP LOCKED`
/// so any number of worker processes can poll the same queue.
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    backoff: BackoffPolicy,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, backoff: BackoffPolicy) -> Self {
        Self { pool, backoff }
    }
}

fn job_from_row(row: &PgRow) -> Result<JobRecord, QueueError> {
    let queue: String = row.try_get("queue")?;
    let state: String = row.try_get("state")?;
    let payload: JsonValue = row.try_get("payload")?;
    Ok(JobRecord {
        id: row.try_get("id")?,
        queue: queue
            .parse::<QueueName>()
            .map_err(|err| QueueError::Corrupt(err.to_string()))?,
        payload: serde_json::from_value(payload)?,
        state: JobState::parse(&state)
            .ok_or_else(|| QueueError::Corrupt(format!("job state {state}")))?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        dedupe_key: row.try_get("dedupe_key")?,
        run_at: row.try_get("run_at")?,
        result: row.try_get("result")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn delay_seconds(delay: std::time::Duration) -> f64 {
    delay.as_secs_f64()
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(
        &self,
        payload: &JobPayload,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        let queue = payload.queue();
        let body = serde_json::to_value(payload)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, payload, state, max_attempts, dedupe_key, run_at)
            VALUES ($1, $2, $3, 'waiting', $4, $5, now() + make_interval(secs => $6))
            ON CONFLICT (queue, dedupe_key)
              WHERE dedupe_key IS NOT NULL AND state IN ('waiting', 'active')
              DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(queue.as_str())
        .bind(&body)
        .bind(options.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1))
        .bind(&options.dedupe_key)
        .bind(delay_seconds(options.delay))
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = inserted {
            return Ok(row.try_get("id")?);
        }

        let row = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE queue = $1 AND dedupe_key = $2 AND state IN ('waiting', 'active')
            "#,
        )
        .bind(queue.as_str())
        .bind(&options.dedupe_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn claim(&self, queue: QueueName) -> Result<Option<ClaimedJob>, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs SET state = 'active', attempts = attempts + 1, updated_at = now()
            WHERE id = (
              SELECT id FROM jobs
              WHERE queue = $1 AND state = 'waiting' AND run_at <= now()
              ORDER BY run_at, created_at
              FOR UPDATE SKIP LOCKED
              LIMIT 1
            )
            RETURNING id, payload, attempts, max_attempts
            "#,
        )
        .bind(queue.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let payload: JsonValue = row.try_get("payload")?;
        Ok(Some(ClaimedJob {
            id: row.try_get("id")?,
            queue,
            payload: serde_json::from_value(payload)?,
            attempt: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
        }))
    }

    async fn complete(&self, job_id: Uuid, result: Option<JsonValue>) -> Result<(), QueueError> {
        let done = sqlx::query(
            "UPDATE jobs SET state = 'completed', result = $2, updated_at = now() WHERE id = $1",
        )
        .bind(job_id)
        .bind(&result)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<JobState, QueueError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT attempts, max_attempts FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(QueueError::NotFound(job_id))?;
        let attempts: i32 = row.try_get("attempts")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;

        let (state, delay) = if attempts < max_attempts {
            let delay = self
                .backoff
                .delay_for_attempt(attempts.saturating_sub(1) as usize);
            (JobState::Waiting, delay)
        } else {
            (JobState::Failed, std::time::Duration::ZERO)
        };
        sqlx::query(
            r#"
            UPDATE jobs SET
              state = $2,
              last_error = $3,
              run_at = now() + make_interval(secs => $4),
              updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(state.as_str())
        .bind(error)
        .bind(delay_seconds(delay))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(state)
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<JobRecord>, QueueError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn prune_finished(&self, before: DateTime<Utc>) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE state IN ('completed', 'failed') AND updated_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
