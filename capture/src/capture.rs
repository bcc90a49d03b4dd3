use axum::extract::State;
use bytes::Bytes;
use metrics::counter;
use tracing::instrument;

use event_common::event::{EventBatch, EventRecord};

use crate::api::{CaptureError, CaptureResponse};
use crate::buffer::dedup_batch;
use crate::event::RawEvent;
use crate::prometheus::{report_buffer_overflow, report_dropped_events};
use crate::router;

#[instrument(skip_all, fields(batch_size, accepted))]
pub async fn event(
    state: State<router::State>,
    body: Bytes,
) -> Result<CaptureResponse, CaptureError> {
    tracing::Span::current().record("batch_size", 1);

    let record = RawEvent::from_bytes(&body)
        .and_then(|raw| Ok(raw.normalize(state.timesource.now())?))
        .map_err(|err| {
            report_dropped_events(err.cause(), 1);
            err
        })?;

    ingest(&state, vec![record]).await
}

#[instrument(skip_all, fields(batch_size, accepted))]
pub async fn batch(
    state: State<router::State>,
    body: Bytes,
) -> Result<CaptureResponse, CaptureError> {
    let records = decode_batch(&state, &body).map_err(|err| {
        report_dropped_events(err.cause(), 1);
        err
    })?;

    ingest(&state, records).await
}

fn decode_batch(state: &router::State, body: &Bytes) -> Result<Vec<EventRecord>, CaptureError> {
    let events = RawEvent::batch_from_bytes(body)?;
    tracing::Span::current().record("batch_size", events.len());

    if events.is_empty() {
        return Err(CaptureError::EmptyBatch);
    }
    if events.len() > state.max_batch_size {
        return Err(CaptureError::PayloadTooLarge(
            events.len(),
            state.max_batch_size,
        ));
    }

    let now = state.timesource.now();
    events
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            raw.normalize(now)
                .map_err(|source| CaptureError::InvalidBatchEvent { index, source })
        })
        .collect()
}

/// Queue the deduplicated records, then hand them to the fast path.
/// Nothing is buffered unless the queue accepted the batch.
async fn ingest(
    state: &router::State,
    records: Vec<EventRecord>,
) -> Result<CaptureResponse, CaptureError> {
    counter!("capture_events_received_total").increment(records.len() as u64);

    let events = dedup_batch(records);
    let accepted = events.len();
    tracing::Span::current().record("accepted", accepted);

    let batch = EventBatch { events };
    let job = state.sink.submit(batch.clone()).await.map_err(|err| {
        report_dropped_events(err.cause(), accepted as u64);
        err
    })?;
    tracing::debug!(job = job.0, accepted, "queued event batch");

    let outcome = state.buffer.push(batch.events);
    if outcome.overflow > 0 {
        report_buffer_overflow(outcome.overflow as u64);
    }

    counter!("capture_events_accepted_total").increment(accepted as u64);
    Ok(CaptureResponse {
        success: true,
        accepted,
    })
}
