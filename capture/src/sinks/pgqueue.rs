use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::{debug, error, instrument};

use event_common::event::EventBatch;
use event_common::pgqueue::{NewJob, PgQueue};

use crate::api::CaptureError;
use crate::sinks::{EventSink, JobHandle};

/// Enqueues every batch as one job in the Postgres job queue.
pub struct PgQueueSink {
    queue: PgQueue,
    max_attempts: i32,
}

impl PgQueueSink {
    pub fn new(queue: PgQueue, max_attempts: i32) -> Self {
        Self {
            queue,
            max_attempts,
        }
    }
}

#[async_trait]
impl EventSink for PgQueueSink {
    #[instrument(skip_all, fields(queue = self.queue.name(), batch_size = batch.events.len()))]
    async fn submit(&self, batch: EventBatch) -> Result<JobHandle, CaptureError> {
        let size = batch.events.len();
        let job = NewJob::new(self.max_attempts, batch);

        match self.queue.enqueue(job).await {
            Ok(id) => {
                debug!(job_id = id, "enqueued event batch");
                histogram!("capture_queue_batch_size").record(size as f64);
                counter!("capture_queue_jobs_total", "outcome" => "enqueued").increment(1);
                Ok(JobHandle(id))
            }
            Err(err) => {
                error!("failed to enqueue event batch: {}", err);
                counter!("capture_queue_jobs_total", "outcome" => "failed").increment(1);
                Err(CaptureError::QueueUnavailable)
            }
        }
    }
}
