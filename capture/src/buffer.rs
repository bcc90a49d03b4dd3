//! In-process dedup buffer and its fast-path flusher.
//!
//! Accepted events are written to the durable queue and also kept here, to be
//! persisted directly on the next flush tick. This path is lossy: whatever is
//! buffered when the process dies is gone, and only the queue guarantees the
//! event eventually lands. Both paths go through the same conditional insert,
//! so an event written by both is stored once.
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use health::HealthHandle;
use metrics::counter;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use event_common::best_effort::BestEffort;
use event_common::cache::QueryCache;
use event_common::event::{EventRecord, IdentityKey};
use event_common::store::EventStore;
use event_common::upsert::{upsert_events, UpsertSummary};

/// Drop repeated identities from a batch, keeping the first occurrence.
pub fn dedup_batch(events: Vec<EventRecord>) -> Vec<EventRecord> {
    let mut seen = HashSet::with_capacity(events.len());
    events
        .into_iter()
        .filter(|event| seen.insert(event.identity_key()))
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    pub buffered: usize,
    /// Already buffered since the last drain.
    pub duplicates: usize,
    /// Dropped because the buffer was full.
    pub overflow: usize,
}

#[derive(Default)]
struct BufferState {
    events: Vec<EventRecord>,
    seen: HashSet<IdentityKey>,
}

/// Events waiting for the next fast-path flush, deduplicated since the last drain.
pub struct EventBuffer {
    state: Mutex<BufferState>,
    capacity: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            capacity,
        }
    }

    pub fn push(&self, events: Vec<EventRecord>) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        for event in events {
            let key = event.identity_key();
            if state.seen.contains(&key) {
                outcome.duplicates += 1;
            } else if state.events.len() >= self.capacity {
                outcome.overflow += 1;
            } else {
                state.seen.insert(key);
                state.events.push(event);
                outcome.buffered += 1;
            }
        }
        outcome
    }

    /// Take everything buffered so far. Concurrent pushes land either in the
    /// returned batch or in the next one, never in both.
    pub fn drain(&self) -> Vec<EventRecord> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.seen.clear();
        std::mem::take(&mut state.events)
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Error, Debug)]
#[error("fast-path flush persisted none of {0} events")]
pub struct FlushError(pub usize);

/// Periodically persists the buffer straight to the store.
pub struct BufferFlusher {
    buffer: Arc<EventBuffer>,
    store: Arc<dyn EventStore + Send + Sync>,
    cache: QueryCache,
    interval: Duration,
    concurrency: usize,
    liveness: HealthHandle,
}

impl BufferFlusher {
    pub fn new(
        buffer: Arc<EventBuffer>,
        store: Arc<dyn EventStore + Send + Sync>,
        cache: QueryCache,
        interval: Duration,
        concurrency: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            buffer,
            store,
            cache,
            interval,
            concurrency,
            liveness,
        }
    }

    /// Drain the buffer and insert its events, then invalidate cached queries
    /// for every scope that received new rows.
    pub async fn flush(&self) -> BestEffort<UpsertSummary, FlushError> {
        let events = self.buffer.drain();
        if events.is_empty() {
            return BestEffort::from(Ok::<_, FlushError>(UpsertSummary::default()));
        }

        let summary = upsert_events(self.store.as_ref(), &events, self.concurrency).await;
        debug!(
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            failed = summary.failed,
            "flushed event buffer"
        );
        counter!("capture_buffer_flushed_total", "outcome" => "inserted")
            .increment(summary.inserted as u64);
        counter!("capture_buffer_flushed_total", "outcome" => "duplicate")
            .increment(summary.duplicates as u64);
        counter!("capture_buffer_flushed_total", "outcome" => "failed")
            .increment(summary.failed as u64);

        self.cache.invalidate_scopes(&summary.touched_scopes).await;

        let result = if summary.is_total_failure() {
            Err(FlushError(summary.failed))
        } else {
            Ok(summary)
        };
        result.into()
    }

    /// Flush on every tick until `shutdown` resolves, then flush one last time.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.liveness.report_healthy().await;
                    self.flush().await.absorb("buffer_flush");
                }
            }
        }

        info!(pending = self.buffer.len(), "draining event buffer before exit");
        self.flush().await.absorb("buffer_flush");
    }
}
