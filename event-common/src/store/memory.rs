use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{EventFilter, EventStore, FirstOccurrence, InsertOutcome, Interval, StoreError};
use crate::event::{EventRecord, Identity};

/// An `EventStore` kept in process memory, enforcing the same uniqueness rules
/// as the postgres schema. Used by tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryEventStore {
    records: Arc<Mutex<Vec<EventRecord>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<EventRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), StoreError> {
        match self.failing.load(Ordering::SeqCst) {
            true => Err(StoreError::Unavailable("memory store set to fail".to_owned())),
            false => Ok(()),
        }
    }

    fn matching(&self, filter: &EventFilter) -> Vec<EventRecord> {
        self.lock()
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_if_absent(&self, record: &EventRecord) -> Result<InsertOutcome, StoreError> {
        self.check()?;
        let key = match record.identity() {
            Identity::Composite { .. } => return Err(StoreError::InvalidIdentity),
            _ if record.event_id.is_some() && record.event_hash.is_some() => {
                return Err(StoreError::InvalidIdentity)
            }
            _ => record.identity_key(),
        };

        let mut records = self.lock();
        if records.iter().any(|existing| existing.identity_key() == key) {
            return Ok(InsertOutcome::Duplicate);
        }
        records.push(record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn count_by_period(
        &self,
        filter: &EventFilter,
        interval: Interval,
    ) -> Result<Vec<(DateTime<Utc>, i64)>, StoreError> {
        self.check()?;
        let mut buckets: BTreeMap<DateTime<Utc>, i64> = BTreeMap::new();
        for record in self.matching(filter) {
            *buckets.entry(interval.truncate(record.timestamp)).or_default() += 1;
        }
        Ok(buckets.into_iter().collect())
    }

    async fn first_occurrences(
        &self,
        filter: &EventFilter,
    ) -> Result<Vec<FirstOccurrence>, StoreError> {
        self.check()?;
        let mut firsts: HashMap<(String, String), DateTime<Utc>> = HashMap::new();
        for record in self.matching(filter) {
            firsts
                .entry((record.user_id, record.event_name))
                .and_modify(|seen| *seen = (*seen).min(record.timestamp))
                .or_insert(record.timestamp);
        }
        Ok(firsts
            .into_iter()
            .map(|((user_id, event_name), first_seen)| FirstOccurrence {
                user_id,
                event_name,
                first_seen,
            })
            .collect())
    }

    async fn distinct_users(&self, filter: &EventFilter) -> Result<HashSet<String>, StoreError> {
        self.check()?;
        Ok(self
            .matching(filter)
            .into_iter()
            .map(|record| record.user_id)
            .collect())
    }

    async fn find_events(
        &self,
        filter: &EventFilter,
        limit: i64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.check()?;
        let mut events = self.matching(filter);
        // Stable sort keeps insertion order for full ties.
        events.sort_by_key(|record| (record.timestamp, record.created_at));
        events.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(events)
    }
}
