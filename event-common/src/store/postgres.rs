use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};

use super::{EventFilter, EventStore, FirstOccurrence, InsertOutcome, Interval, StoreError};
use crate::event::EventRecord;
use crate::metadata::Metadata;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Columns of `events`, in the order `EventRow` reads them.
const EVENT_COLUMNS: &str = "org_id, project_id, event_id, event_name, user_id, metadata, occurred_at, event_hash, created_at";

#[derive(sqlx::FromRow)]
struct EventRow {
    org_id: Option<String>,
    project_id: Option<String>,
    event_id: Option<String>,
    event_name: String,
    user_id: String,
    metadata: sqlx::types::Json<Metadata>,
    occurred_at: DateTime<Utc>,
    event_hash: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<EventRow> for EventRecord {
    fn from(row: EventRow) -> Self {
        EventRecord {
            org_id: row.org_id,
            project_id: row.project_id,
            event_id: row.event_id,
            event_name: row.event_name,
            user_id: row.user_id,
            metadata: row.metadata.0,
            timestamp: row.occurred_at,
            event_hash: row.event_hash,
            created_at: row.created_at,
        }
    }
}

/// Event store backed by the `events` table.
///
/// Uniqueness lives in the schema: partial unique indexes on
/// `(org, project, event_id)` and `(org, project, event_hash)`, with null
/// scopes coalesced so they compare equal. Inserts use
/// `ON CONFLICT DO NOTHING`, which makes the first writer win.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Connect lazily to `url`, bounding each statement by `statement_timeout`.
    pub fn new(
        url: &str,
        max_connections: u32,
        statement_timeout: Duration,
        app_name: &'static str,
    ) -> Result<Self, StoreError> {
        let timeout_ms = statement_timeout.as_millis().to_string();
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| StoreError::PoolCreationError { error })?
            .application_name(app_name)
            .options([("statement_timeout", timeout_ms.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn push_conditions(builder: &mut QueryBuilder<'_, Postgres>, filter: &EventFilter) {
    builder.push(" WHERE TRUE");
    if let Some(org_id) = &filter.scope.org_id {
        builder.push(" AND org_id = ").push_bind(org_id.clone());
    }
    if let Some(project_id) = &filter.scope.project_id {
        builder.push(" AND project_id = ").push_bind(project_id.clone());
    }
    if let Some(names) = &filter.event_names {
        builder
            .push(" AND event_name = ANY(")
            .push_bind(names.clone())
            .push(")");
    }
    if let Some(users) = &filter.user_ids {
        builder
            .push(" AND user_id = ANY(")
            .push_bind(users.clone())
            .push(")");
    }
    if let Some(start) = filter.window.start {
        builder.push(" AND occurred_at >= ").push_bind(start);
    }
    if let Some(end) = filter.window.end {
        let op = if filter.window.end_inclusive {
            " AND occurred_at <= "
        } else {
            " AND occurred_at < "
        };
        builder.push(op).push_bind(end);
    }
}

fn query_error(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |error| StoreError::QueryError {
        command: command.to_owned(),
        error,
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert_if_absent(&self, record: &EventRecord) -> Result<InsertOutcome, StoreError> {
        if record.event_id.is_some() == record.event_hash.is_some() {
            return Err(StoreError::InvalidIdentity);
        }

        let base_query = r#"
INSERT INTO events
    (org_id, project_id, event_id, event_name, user_id, metadata, occurred_at, event_hash, created_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9)
ON CONFLICT DO NOTHING
        "#;

        let result = sqlx::query(base_query)
            .bind(&record.org_id)
            .bind(&record.project_id)
            .bind(&record.event_id)
            .bind(&record.event_name)
            .bind(&record.user_id)
            .bind(sqlx::types::Json(&record.metadata))
            .bind(record.timestamp)
            .bind(&record.event_hash)
            .bind(record.created_at)
            .execute(&self.pool)
            .await
            .map_err(query_error("INSERT"))?;

        Ok(match result.rows_affected() {
            0 => InsertOutcome::Duplicate,
            _ => InsertOutcome::Inserted,
        })
    }

    async fn count_by_period(
        &self,
        filter: &EventFilter,
        interval: Interval,
    ) -> Result<Vec<(DateTime<Utc>, i64)>, StoreError> {
        // Truncate in UTC so buckets don't depend on the session time zone.
        let mut builder = QueryBuilder::new("SELECT date_trunc('");
        builder
            .push(interval.pg_unit())
            .push("', occurred_at AT TIME ZONE 'UTC') AT TIME ZONE 'UTC' AS period, COUNT(*) AS count FROM events");
        push_conditions(&mut builder, filter);
        builder.push(" GROUP BY period ORDER BY period");

        builder
            .build_query_as::<(DateTime<Utc>, i64)>()
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }

    async fn first_occurrences(
        &self,
        filter: &EventFilter,
    ) -> Result<Vec<FirstOccurrence>, StoreError> {
        let mut builder = QueryBuilder::new(
            "SELECT user_id, event_name, MIN(occurred_at) AS first_seen FROM events",
        );
        push_conditions(&mut builder, filter);
        builder.push(" GROUP BY user_id, event_name");

        builder
            .build_query_as::<FirstOccurrence>()
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }

    async fn distinct_users(&self, filter: &EventFilter) -> Result<HashSet<String>, StoreError> {
        let mut builder = QueryBuilder::new("SELECT DISTINCT user_id FROM events");
        push_conditions(&mut builder, filter);

        let rows: Vec<(String,)> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;

        Ok(rows.into_iter().map(|(user_id,)| user_id).collect())
    }

    async fn find_events(
        &self,
        filter: &EventFilter,
        limit: i64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let mut builder = QueryBuilder::new("SELECT ");
        builder.push(EVENT_COLUMNS).push(" FROM events");
        push_conditions(&mut builder, filter);
        builder
            .push(" ORDER BY occurred_at ASC, created_at ASC, id ASC LIMIT ")
            .push_bind(limit);

        let rows: Vec<EventRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;

        Ok(rows.into_iter().map(EventRecord::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventScope, EventRecord};
    use crate::store::TimeWindow;
    use chrono::TimeZone;

    fn event(event_id: Option<&str>, user_id: &str, name: &str, day: u32) -> EventRecord {
        let timestamp = Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap();
        EventRecord {
            org_id: Some("o".to_owned()),
            project_id: None,
            event_id: event_id.map(str::to_owned),
            event_name: name.to_owned(),
            user_id: user_id.to_owned(),
            metadata: Metadata::new(),
            timestamp,
            event_hash: match event_id {
                Some(_) => None,
                None => Some(format!("{user_id}:{name}:{day}")),
            },
            created_at: timestamp,
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_insert_if_absent_is_idempotent(db: PgPool) {
        let store = PgEventStore::new_from_pool(db);
        let with_id = event(Some("e-1"), "u1", "signup", 1);
        let hashed = event(None, "u1", "signup", 1);

        for record in [&with_id, &hashed] {
            assert_eq!(
                store.insert_if_absent(record).await.unwrap(),
                InsertOutcome::Inserted
            );
            // Null project_id must still collide with itself.
            assert_eq!(
                store.insert_if_absent(record).await.unwrap(),
                InsertOutcome::Duplicate
            );
        }

        let all = store
            .find_events(&EventFilter::default(), 100)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_queries_respect_filters(db: PgPool) {
        let store = PgEventStore::new_from_pool(db);
        for record in [
            event(None, "u1", "signup", 1),
            event(None, "u2", "signup", 1),
            event(None, "u1", "purchase", 2),
            event(None, "u1", "purchase", 3),
        ] {
            store.insert_if_absent(&record).await.unwrap();
        }

        let signups = EventFilter {
            scope: EventScope::new(Some("o".to_owned()), None),
            event_names: Some(vec!["signup".to_owned()]),
            ..Default::default()
        };
        let buckets = store
            .count_by_period(&signups, Interval::Daily)
            .await
            .unwrap();
        assert_eq!(
            buckets,
            vec![(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), 2)]
        );
        assert_eq!(store.distinct_users(&signups).await.unwrap().len(), 2);

        let firsts = store
            .first_occurrences(&EventFilter::default())
            .await
            .unwrap();
        assert_eq!(firsts.len(), 3);

        let journey = store
            .find_events(
                &EventFilter {
                    user_ids: Some(vec!["u1".to_owned()]),
                    ..Default::default()
                },
                2,
            )
            .await
            .unwrap();
        assert_eq!(
            journey.iter().map(|e| e.event_name.as_str()).collect::<Vec<_>>(),
            vec!["signup", "purchase"]
        );

        let second_purchase = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();
        let until = |window: TimeWindow| EventFilter {
            event_names: Some(vec!["purchase".to_owned()]),
            window,
            ..Default::default()
        };
        let closed = store
            .find_events(&until(TimeWindow::through(None, Some(second_purchase))), 10)
            .await
            .unwrap();
        assert_eq!(closed.len(), 1);
        let half_open = store
            .find_events(&until(TimeWindow::new(None, Some(second_purchase))), 10)
            .await
            .unwrap();
        assert!(half_open.is_empty());
    }
}
