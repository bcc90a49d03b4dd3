use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use event_common::event::EventBatch;

use crate::api::CaptureError;

pub mod pgqueue;
pub mod print;

pub use pgqueue::PgQueueSink;
pub use print::PrintSink;

/// Reference to a batch accepted by a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle(pub i64);

/// The durable channel between capture and the upsert worker.
///
/// A successful `submit` means the batch will be delivered at least once; it
/// does not mean it has been persisted yet.
#[async_trait]
pub trait EventSink {
    async fn submit(&self, batch: EventBatch) -> Result<JobHandle, CaptureError>;
}
