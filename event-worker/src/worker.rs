use std::collections::HashSet;
use std::sync::Arc;
use std::time;

use futures::future::join_all;
use health::HealthHandle;
use serde::Serialize;
use serde_json::Value;
use tokio::sync;
use tracing::{debug, error, warn};

use event_common::cache::QueryCache;
use event_common::event::{EventBatch, EventScope};
use event_common::pgqueue::{
    PgQueue, PgQueueJob, PgTransactionBatch, PgTransactionJob, RetryError, RetryInvalidError,
};
use event_common::retry::RetryPolicy;
use event_common::store::EventStore;
use event_common::upsert::{upsert_events, UpsertSummary};

use crate::error::WorkerError;

/// What to do with a job once its events went through the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Complete,
    /// Nothing could be written: schedule another attempt.
    Retry,
}

/// Partial success completes the job. Only a batch where every event failed
/// is retried, since replaying it is harmless.
pub fn disposition(summary: &UpsertSummary) -> JobDisposition {
    if summary.is_total_failure() {
        JobDisposition::Retry
    } else {
        JobDisposition::Complete
    }
}

/// Stored in the job's `errors` column.
#[derive(Debug, Serialize)]
struct JobFailure {
    kind: &'static str,
    message: String,
}

/// A worker to poll `PgQueue` and persist the event batches it carries.
pub struct EventWorker<'p> {
    /// An identifier for this worker. Used to mark jobs we have consumed.
    name: String,
    /// The queue we will be dequeuing jobs from.
    queue: &'p PgQueue,
    store: Arc<dyn EventStore + Send + Sync>,
    cache: QueryCache,
    /// The interval for polling the queue.
    poll_interval: time::Duration,
    /// The maximum number of jobs to dequeue in one query.
    dequeue_batch_size: u32,
    /// Maximum number of concurrent jobs being processed.
    max_concurrent_jobs: usize,
    /// Inserts in flight for a single job.
    upsert_concurrency: usize,
    retry_policy: RetryPolicy,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

/// Jobs per dequeue, bounded so a whole batch can always acquire its permits.
pub fn dequeue_limit(dequeue_batch_size: u32, max_concurrent_jobs: usize) -> u32 {
    let max_concurrent_jobs = u32::try_from(max_concurrent_jobs).unwrap_or(u32::MAX);
    dequeue_batch_size.min(max_concurrent_jobs).max(1)
}

impl<'p> EventWorker<'p> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: &'p PgQueue,
        store: Arc<dyn EventStore + Send + Sync>,
        cache: QueryCache,
        poll_interval: time::Duration,
        dequeue_batch_size: u32,
        max_concurrent_jobs: usize,
        upsert_concurrency: usize,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        let max_concurrent_jobs = max_concurrent_jobs.max(1);
        let limit = dequeue_limit(dequeue_batch_size, max_concurrent_jobs);
        if limit != dequeue_batch_size {
            warn!(
                dequeue_batch_size,
                max_concurrent_jobs, "dequeue batch size clamped to {}", limit
            );
        }

        Self {
            name: name.to_owned(),
            queue,
            store,
            cache,
            poll_interval,
            dequeue_batch_size: limit,
            max_concurrent_jobs,
            upsert_concurrency,
            retry_policy,
            liveness,
        }
    }

    async fn wait_for_jobs_tx<'a>(&self) -> PgTransactionBatch<'a, Value> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            match self
                .queue
                .dequeue_tx(&self.name, self.dequeue_batch_size)
                .await
            {
                Ok(Some(batch)) => return batch,
                Ok(None) => continue,
                Err(error) => {
                    error!("error while trying to dequeue_tx job: {}", error);
                    continue;
                }
            }
        }
    }

    /// Run this worker to continuously process any jobs that become available.
    pub async fn run(&self) {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_jobs));
        let report_semaphore_utilization = || {
            metrics::gauge!("event_worker_saturation_percent")
                .set(1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64);
        };

        let dequeue_batch_size_histogram = metrics::histogram!("event_worker_dequeue_batch_size");

        loop {
            report_semaphore_utilization();
            let batch = self.wait_for_jobs_tx().await;
            dequeue_batch_size_histogram.record(batch.jobs.len() as f64);

            // Get enough permits for the jobs before spawning a task.
            let permits = match semaphore
                .clone()
                .acquire_many_owned(batch.jobs.len() as u32)
                .await
            {
                Ok(permits) => permits,
                Err(error) => {
                    error!("worker semaphore closed: {}", error);
                    return;
                }
            };

            let store = self.store.clone();
            let cache = self.cache.clone();
            let retry_policy = self.retry_policy.clone();
            let upsert_concurrency = self.upsert_concurrency;

            tokio::spawn(async move {
                // Move `permits` into the closure so they will be dropped when the scope ends.
                let _permits = permits;

                process_batch(batch, store.as_ref(), &cache, &retry_policy, upsert_concurrency)
                    .await
            });
        }
    }
}

/// Process every job of a dequeued batch, commit their transitions, and then
/// invalidate cached queries for the scopes that received rows.
pub async fn process_batch(
    mut batch: PgTransactionBatch<'_, Value>,
    store: &(dyn EventStore + Send + Sync),
    cache: &QueryCache,
    retry_policy: &RetryPolicy,
    upsert_concurrency: usize,
) {
    // We have to `take` the Vec of jobs from the batch to avoid a borrow checker
    // error below when we commit.
    let futures = std::mem::take(&mut batch.jobs)
        .into_iter()
        .map(|job| process_job(job, store, retry_policy, upsert_concurrency));

    let mut touched_scopes = HashSet::new();
    for result in join_all(futures).await {
        match result {
            Ok(scopes) => touched_scopes.extend(scopes),
            Err(error) => error!("error processing event job: {}", error),
        }
    }

    if let Err(error) = batch.commit().await {
        error!("error committing transactional batch: {}", error);
        return;
    }

    cache.invalidate_scopes(&touched_scopes).await;
}

/// Persist the events of one job and record its transition in the batch transaction.
/// Returns the scopes that received new rows.
async fn process_job(
    job: PgTransactionJob<'_, Value>,
    store: &(dyn EventStore + Send + Sync),
    retry_policy: &RetryPolicy,
    upsert_concurrency: usize,
) -> Result<HashSet<EventScope>, WorkerError> {
    let batch: EventBatch = match serde_json::from_value(job.job.parameters.0.clone()) {
        Ok(batch) => batch,
        Err(error) => {
            warn!(job_id = job.job.id, "undecodable event batch: {}", error);
            metrics::counter!("event_worker_jobs_total", "outcome" => "failed").increment(1);
            job.fail(JobFailure {
                kind: "invalid_payload",
                message: error.to_string(),
            })
            .await?;
            return Ok(HashSet::new());
        }
    };

    let summary = upsert_events(store, &batch.events, upsert_concurrency).await;
    debug!(
        job_id = job.job.id,
        inserted = summary.inserted,
        duplicates = summary.duplicates,
        failed = summary.failed,
        "processed event batch"
    );
    for (outcome, count) in [
        ("inserted", summary.inserted),
        ("duplicate", summary.duplicates),
        ("failed", summary.failed),
    ] {
        metrics::counter!("event_worker_events_total", "outcome" => outcome)
            .increment(count as u64);
    }

    match disposition(&summary) {
        JobDisposition::Complete => {
            job.complete().await?;
            metrics::counter!("event_worker_jobs_total", "outcome" => "completed").increment(1);
        }
        JobDisposition::Retry => {
            let failure = JobFailure {
                kind: "persistence_failure",
                message: format!("none of {} events could be persisted", summary.failed),
            };
            let retry_interval = retry_policy.retry_interval(job.job.attempt.max(1) as u32);
            let retry_queue = retry_policy.retry_queue(&job.job.queue).to_owned();

            match job.retry(&failure, retry_interval, &retry_queue).await {
                Ok(_) => {
                    metrics::counter!("event_worker_jobs_total", "outcome" => "retried")
                        .increment(1);
                }
                Err(RetryError::RetryInvalidError(RetryInvalidError { job, .. })) => {
                    let job = *job;
                    warn!(job_id = job.job.id, "event batch exhausted its attempts");
                    job.fail(failure).await?;
                    metrics::counter!("event_worker_jobs_total", "outcome" => "failed")
                        .increment(1);
                }
                Err(RetryError::DatabaseError(error)) => return Err(error.into()),
            }
        }
    }

    Ok(summary.touched_scopes)
}
