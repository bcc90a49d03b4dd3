//! Conditional inserts shared by the fast-path flush and the queue worker, so
//! both paths write the same rows under the same rules.
use std::collections::HashSet;

use futures::stream::{self, StreamExt};
use tracing::warn;

use crate::event::{EventRecord, EventScope};
use crate::store::{EventStore, InsertOutcome};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// Scopes that received at least one new row, for cache invalidation.
    pub touched_scopes: HashSet<EventScope>,
}

impl UpsertSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.duplicates + self.failed
    }

    /// Every record failed. An empty batch is not a failure.
    pub fn is_total_failure(&self) -> bool {
        self.failed > 0 && self.inserted + self.duplicates == 0
    }
}

/// Insert every record independently, at most `concurrency` at a time.
///
/// A failing record is logged and counted; it never stops the others.
pub async fn upsert_events<S>(store: &S, events: &[EventRecord], concurrency: usize) -> UpsertSummary
where
    S: EventStore + Send + Sync + ?Sized,
{
    let results: Vec<_> = stream::iter(events)
        .map(|record| async move { (record, store.insert_if_absent(record).await) })
        .buffer_unordered(concurrency.max(1))
        .boxed()
        .collect()
        .await;

    let mut summary = UpsertSummary::default();
    for (record, result) in results {
        match result {
            Ok(InsertOutcome::Inserted) => {
                summary.inserted += 1;
                summary.touched_scopes.insert(record.scope());
            }
            Ok(InsertOutcome::Duplicate) => summary.duplicates += 1,
            Err(error) => {
                warn!(
                    event_name = %record.event_name,
                    user_id = %record.user_id,
                    "failed to persist event: {}",
                    error
                );
                summary.failed += 1;
            }
        }
    }
    summary
}
