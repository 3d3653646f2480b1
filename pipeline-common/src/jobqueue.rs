use std::str::FromStr;

use async_trait::async_trait;
use chrono::prelude::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

/// Enumeration of errors for operations with the scoring queue.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
}

/// Enumeration of possible statuses for a Job.
/// Available: a job waiting in the queue to be picked up by a worker.
/// Running: a job claimed by a worker and currently being run.
/// Completed: a job successfully completed by a worker.
/// Failed: a job unsuccessfully completed by a worker.
#[derive(Debug, PartialEq, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Available,
    Completed,
    Failed,
    Running,
}

/// Allow casting JobStatus from strings.
impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobStatus::Available),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "running" => Ok(JobStatus::Running),
            invalid => Err(QueueError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

/// The queue payload for asynchronous scoring: the raw serialized envelope
/// exactly as it was published, so the worker can re-derive attribution
/// without a second storage read.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ScoringJob {
    pub payload: String,
}

/// A Job as claimed from the queue by a worker.
#[derive(sqlx::FromRow)]
pub struct Job<J> {
    pub id: i64,
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub parameters: sqlx::types::Json<J>,
}

/// A NewJob to be enqueued.
pub struct NewJob<J> {
    pub parameters: sqlx::types::Json<J>,
}

impl<J> NewJob<J> {
    pub fn new(parameters: J) -> Self {
        Self {
            parameters: sqlx::types::Json(parameters),
        }
    }
}

/// The enqueue-only face of the queue, so producers (the log consumer and
/// the partner poller) do not need to know how jobs are stored.
#[async_trait]
pub trait JobSink {
    async fn enqueue_payload(&self, raw: &str) -> Result<(), QueueError>;
}

/// A work queue implemented on top of a PostgreSQL table.
///
/// Delivery is at-least-once: dequeue claims the oldest available job with
/// FOR UPDATE SKIP LOCKED, so competing workers never double-claim, but a
/// worker crash leaves its job in `running` until operational cleanup.
pub struct PgQueue {
    table: String,
    pool: PgPool,
}

pub type PgQueueResult<T> = std::result::Result<T, QueueError>;

impl PgQueue {
    /// Initialize a new PgQueue backed by table in PostgreSQL.
    pub async fn new(table: &str, url: &str) -> PgQueueResult<Self> {
        let pool = PgPoolOptions::new()
            .connect(url)
            .await
            .map_err(|error| QueueError::ConnectionError { error })?;

        Ok(Self {
            table: table.to_owned(),
            pool,
        })
    }

    /// Initialize a new PgQueue backed by table in PostgreSQL from an existing pool.
    pub fn new_from_pool(table: &str, pool: PgPool) -> Self {
        Self {
            table: table.to_owned(),
            pool,
        }
    }

    /// Enqueue a Job.
    /// We take ownership of NewJob to enforce a specific NewJob is only enqueued once.
    pub async fn enqueue<J: Serialize + Sync>(&self, job: NewJob<J>) -> PgQueueResult<()> {
        // TODO: Escaping. I think sqlx doesn't support identifiers.
        let base_query = format!(
            r#"
INSERT INTO "{0}"
    (created_at, status, parameters)
VALUES
    (NOW(), 'available'::job_status, $1)
            "#,
            &self.table
        );

        sqlx::query(&base_query)
            .bind(&job.parameters)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Claim the oldest available Job, marking it as running. Returns None
    /// when the queue has nothing available, so callers can poll.
    pub async fn dequeue<J: DeserializeOwned + Send + Unpin + 'static>(
        &self,
    ) -> PgQueueResult<Option<Job<J>>> {
        let base_query = format!(
            r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        "{0}"
    WHERE
        status = 'available'
    ORDER BY
        id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    "{0}"
SET
    started_at = NOW(),
    status = 'running'::job_status,
    attempt = "{0}".attempt + 1
FROM
    available_in_queue
WHERE
    "{0}".id = available_in_queue.id
RETURNING
    "{0}".*
            "#,
            &self.table
        );

        let job: Option<Job<J>> = sqlx::query_as(&base_query)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(job)
    }

    /// Mark a claimed Job as completed.
    pub async fn complete(&self, job_id: i64) -> PgQueueResult<()> {
        self.finish(job_id, JobStatus::Completed).await
    }

    /// Mark a claimed Job as failed.
    pub async fn fail(&self, job_id: i64) -> PgQueueResult<()> {
        self.finish(job_id, JobStatus::Failed).await
    }

    async fn finish(&self, job_id: i64, status: JobStatus) -> PgQueueResult<()> {
        let base_query = format!(
            r#"
UPDATE "{0}"
SET
    finished_at = NOW(),
    status = $1
WHERE
    id = $2
            "#,
            &self.table
        );

        sqlx::query(&base_query)
            .bind(status)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }
}

#[async_trait]
impl JobSink for PgQueue {
    async fn enqueue_payload(&self, raw: &str) -> Result<(), QueueError> {
        self.enqueue(NewJob::new(ScoringJob {
            payload: raw.to_owned(),
        }))
        .await
    }
}
