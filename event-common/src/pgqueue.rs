//! # PgQueue
//!
//! The durable channel between ingestion and the upsert worker: a job queue
//! backed by the `job_queue` table. Delivery is at-least-once. A job is
//! dequeued inside a transaction with `FOR UPDATE SKIP LOCKED`, so it stays
//! invisible to other workers until that transaction ends, and becomes
//! available again if the worker dies before committing.
use std::str::FromStr;
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;

const ACQUIRE_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// Errors that can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction was already closed")]
    TransactionAlreadyClosedError,
}

/// A job could not be retried; the job is handed back so that it can be failed.
#[derive(Error, Debug)]
#[error("retry is an invalid state for this job: {error}")]
pub struct RetryInvalidError<T> {
    pub job: T,
    pub error: String,
}

#[derive(Error, Debug)]
pub enum RetryError<T> {
    #[error(transparent)]
    DatabaseError(#[from] DatabaseError),
    #[error(transparent)]
    RetryInvalidError(#[from] RetryInvalidError<T>),
}

#[derive(Debug, PartialEq, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be picked up, possibly scheduled in the future after a retry.
    Available,
    Completed,
    /// Exhausted its attempts or could not be processed at all.
    Failed,
}

pub type JobParameters<J> = sqlx::types::Json<J>;

#[derive(sqlx::FromRow, Debug)]
pub struct Job<J> {
    pub id: i64,
    /// Incremented on every dequeue, so the first attempt is 1.
    pub attempt: i32,
    pub attempted_at: Option<chrono::DateTime<chrono::offset::Utc>>,
    /// Names of the workers that dequeued this job, one entry per attempt.
    pub attempted_by: Vec<String>,
    pub created_at: chrono::DateTime<chrono::offset::Utc>,
    pub max_attempts: i32,
    pub parameters: JobParameters<J>,
    pub queue: String,
    pub status: JobStatus,
}

impl<J> Job<J> {
    pub fn is_gte_max_attempts(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    async fn complete<'c, E>(&self, executor: E) -> Result<CompletedJob, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
    {
        let base_query = r#"
UPDATE
    job_queue
SET
    last_attempt_finished_at = NOW(),
    status = 'completed'::job_status
WHERE
    queue = $1
    AND id = $2
        "#;

        sqlx::query(base_query)
            .bind(&self.queue)
            .bind(self.id)
            .execute(executor)
            .await?;

        Ok(CompletedJob {
            id: self.id,
            queue: self.queue.clone(),
        })
    }

    async fn fail<'c, E, S>(&self, error: S, executor: E) -> Result<FailedJob<S>, sqlx::Error>
    where
        S: Serialize + Sync + Send,
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
    {
        let json_error = sqlx::types::Json(error);
        let base_query = r#"
UPDATE
    job_queue
SET
    last_attempt_finished_at = NOW(),
    status = 'failed'::job_status,
    errors = array_append(errors, $3)
WHERE
    queue = $1
    AND id = $2
        "#;

        sqlx::query(base_query)
            .bind(&self.queue)
            .bind(self.id)
            .bind(&json_error)
            .execute(executor)
            .await?;

        Ok(FailedJob {
            id: self.id,
            error: json_error,
            queue: self.queue.clone(),
        })
    }

    async fn retry<'c, E, S>(
        &self,
        error: S,
        retry_interval: time::Duration,
        retry_queue: &str,
        executor: E,
    ) -> Result<RetriedJob, sqlx::Error>
    where
        S: Serialize + Sync + Send,
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
    {
        let json_error = sqlx::types::Json(error);
        let base_query = r#"
UPDATE
    job_queue
SET
    last_attempt_finished_at = NOW(),
    status = 'available'::job_status,
    scheduled_at = NOW() + $3,
    errors = array_append(errors, $4),
    queue = $5
WHERE
    queue = $1
    AND id = $2
        "#;

        sqlx::query(base_query)
            .bind(&self.queue)
            .bind(self.id)
            .bind(retry_interval)
            .bind(&json_error)
            .bind(retry_queue)
            .execute(executor)
            .await?;

        Ok(RetriedJob {
            id: self.id,
            queue: retry_queue.to_owned(),
        })
    }
}

/// Final transitions of a dequeued job. Each consumes the job.
#[async_trait]
pub trait PgQueueJob {
    async fn complete(self) -> Result<CompletedJob, DatabaseError>;

    async fn fail<E: Serialize + Sync + Send>(
        self,
        error: E,
    ) -> Result<FailedJob<E>, DatabaseError>;

    /// Make the job available again after `retry_interval`, unless it used up its attempts.
    async fn retry<E: Serialize + Sync + Send>(
        self,
        error: E,
        retry_interval: time::Duration,
        queue: &str,
    ) -> Result<RetriedJob, RetryError<Box<Self>>>;
}

type SharedTransaction<'c> = Arc<Mutex<Option<sqlx::Transaction<'c, sqlx::postgres::Postgres>>>>;

/// A job held by an open transaction, shared with the other jobs dequeued with it.
#[derive(Debug)]
pub struct PgTransactionJob<'c, J> {
    pub job: Job<J>,
    shared_txn: SharedTransaction<'c>,
}

/// Jobs dequeued together. Their transitions only become visible on `commit`.
pub struct PgTransactionBatch<'c, J> {
    pub jobs: Vec<PgTransactionJob<'c, J>>,
    shared_txn: SharedTransaction<'c>,
}

impl<J> PgTransactionBatch<'_, J> {
    pub async fn commit(self) -> PgQueueResult<()> {
        let mut txn_guard = self.shared_txn.lock().await;

        let Some(txn) = txn_guard.take() else {
            return Err(DatabaseError::TransactionAlreadyClosedError);
        };

        txn.commit().await.map_err(|e| DatabaseError::QueryError {
            command: "COMMIT".to_owned(),
            error: e,
        })?;

        Ok(())
    }
}

#[async_trait]
impl<'c, J: Send + Sync> PgQueueJob for PgTransactionJob<'c, J> {
    async fn complete(self) -> Result<CompletedJob, DatabaseError> {
        let mut txn_guard = self.shared_txn.lock().await;

        let txn_ref = txn_guard
            .as_deref_mut()
            .ok_or(DatabaseError::TransactionAlreadyClosedError)?;

        self.job
            .complete(txn_ref)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })
    }

    async fn fail<S: Serialize + Sync + Send>(
        self,
        error: S,
    ) -> Result<FailedJob<S>, DatabaseError> {
        let mut txn_guard = self.shared_txn.lock().await;

        let txn_ref = txn_guard
            .as_deref_mut()
            .ok_or(DatabaseError::TransactionAlreadyClosedError)?;

        self.job
            .fail(error, txn_ref)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })
    }

    async fn retry<E: Serialize + Sync + Send>(
        self,
        error: E,
        retry_interval: time::Duration,
        queue: &str,
    ) -> Result<RetriedJob, RetryError<Box<PgTransactionJob<'c, J>>>> {
        if self.job.is_gte_max_attempts() {
            return Err(RetryError::from(RetryInvalidError {
                job: Box::new(self),
                error: "Maximum attempts reached".to_owned(),
            }));
        }

        let mut txn_guard = self.shared_txn.lock().await;

        let txn_ref = txn_guard
            .as_deref_mut()
            .ok_or(DatabaseError::TransactionAlreadyClosedError)?;

        let retried_job = self
            .job
            .retry(error, retry_interval, queue, txn_ref)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(retried_job)
    }
}

#[derive(Debug)]
pub struct CompletedJob {
    pub id: i64,
    pub queue: String,
}

#[derive(Debug)]
pub struct RetriedJob {
    pub id: i64,
    /// The queue the job will be picked up from next.
    pub queue: String,
}

#[derive(Debug)]
pub struct FailedJob<J> {
    pub id: i64,
    pub error: sqlx::types::Json<J>,
    pub queue: String,
}

#[derive(Debug)]
pub struct NewJob<J> {
    pub max_attempts: i32,
    pub parameters: JobParameters<J>,
}

impl<J> NewJob<J> {
    pub fn new(max_attempts: i32, parameters: J) -> Self {
        Self {
            max_attempts,
            parameters: sqlx::types::Json(parameters),
        }
    }
}

#[derive(Clone)]
pub struct PgQueue {
    /// Several queues may share the table; jobs are tagged with this name.
    name: String,
    pool: PgPool,
}

pub type PgQueueResult<T> = std::result::Result<T, DatabaseError>;

impl PgQueue {
    /// Connect lazily to the database at `url`: no connection is opened until the first query.
    pub fn new(
        queue_name: &str,
        url: &str,
        max_connections: u32,
        app_name: &'static str,
    ) -> PgQueueResult<Self> {
        let name = queue_name.to_owned();
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| DatabaseError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy_with(options);

        Ok(Self { name, pool })
    }

    pub fn new_from_pool(queue_name: &str, pool: PgPool) -> PgQueue {
        Self {
            name: queue_name.to_owned(),
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dequeue up to `limit` jobs and hold the transaction.
    /// Concurrent `dequeue_tx` calls skip the locked rows, so each job is handed to one worker.
    pub async fn dequeue_tx<'a, J>(
        &self,
        attempted_by: &str,
        limit: u32,
    ) -> PgQueueResult<Option<PgTransactionBatch<'a, J>>>
    where
        J: DeserializeOwned + Send + Unpin + 'static,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| DatabaseError::ConnectionError { error })?;

        let base_query = r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        job_queue
    WHERE
        status = 'available'
        AND scheduled_at <= NOW()
        AND queue = $1
    ORDER BY
        attempt,
        scheduled_at
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
UPDATE
    job_queue
SET
    attempted_at = NOW(),
    attempt = attempt + 1,
    attempted_by = array_append(attempted_by, $3::text)
FROM
    available_in_queue
WHERE
    job_queue.id = available_in_queue.id
RETURNING
    job_queue.id,
    job_queue.attempt,
    job_queue.attempted_at,
    job_queue.attempted_by,
    job_queue.created_at,
    job_queue.max_attempts,
    job_queue.parameters,
    job_queue.queue,
    job_queue.status
        "#;

        let query_result: Result<Vec<Job<J>>, sqlx::Error> = sqlx::query_as(base_query)
            .bind(&self.name)
            .bind(i64::from(limit))
            .bind(attempted_by)
            .fetch_all(&mut *tx)
            .await;

        match query_result {
            Ok(jobs) => {
                if jobs.is_empty() {
                    return Ok(None);
                }

                let shared_txn = Arc::new(Mutex::new(Some(tx)));

                let jobs = jobs
                    .into_iter()
                    .map(|job| PgTransactionJob {
                        job,
                        shared_txn: shared_txn.clone(),
                    })
                    .collect();

                Ok(Some(PgTransactionBatch { jobs, shared_txn }))
            }

            // Transaction is rolled back on drop.
            Err(sqlx::Error::RowNotFound) => Ok(None),
            Err(e) => Err(DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error: e,
            }),
        }
    }

    /// Enqueue a `NewJob`, returning the id of the created job.
    pub async fn enqueue<J: Serialize + Sync>(&self, job: NewJob<J>) -> PgQueueResult<i64> {
        let base_query = r#"
INSERT INTO job_queue
    (attempt, created_at, scheduled_at, max_attempts, parameters, queue, status)
VALUES
    (0, NOW(), NOW(), $1, $2, $3, 'available'::job_status)
RETURNING
    id
        "#;

        let (id,): (i64,) = sqlx::query_as(base_query)
            .bind(job.max_attempts)
            .bind(&job.parameters)
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(id)
    }
}
