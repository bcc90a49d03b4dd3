use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use metrics::histogram;

use event_common::event::EventBatch;

use crate::api::CaptureError;
use crate::sinks::{EventSink, JobHandle};

/// Logs batches instead of queueing them, for local development.
#[derive(Default)]
pub struct PrintSink {
    next_id: AtomicI64,
}

#[async_trait]
impl EventSink for PrintSink {
    async fn submit(&self, batch: EventBatch) -> Result<JobHandle, CaptureError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of events");
        let _enter = span.enter();

        histogram!("capture_queue_batch_size").record(batch.events.len() as f64);
        for event in &batch.events {
            tracing::info!("event: {:?}", event);
        }

        Ok(JobHandle(self.next_id.fetch_add(1, Ordering::Relaxed) + 1))
    }
}
