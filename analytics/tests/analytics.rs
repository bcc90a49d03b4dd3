use std::sync::Arc;

use assert_json_diff::assert_json_eq;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use analytics::engine::AnalyticsEngine;
use analytics::router::router;
use analytics::server::spawn_heartbeat;
use common_redis::MockRedisClient;
use event_common::cache::{QueryCache, DEFAULT_TTL};
use event_common::event::EventRecord;
use event_common::store::{EventStore, MemoryEventStore};
use event_common::time::FixedTime;
use health::HealthRegistry;

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
}

struct TestAnalytics {
    app: Router,
    store: MemoryEventStore,
    redis: MockRedisClient,
    liveness: HealthRegistry,
}

impl TestAnalytics {
    fn new() -> Self {
        let store = MemoryEventStore::new();
        let redis = MockRedisClient::new();
        let engine = AnalyticsEngine::new(
            Arc::new(store.clone()),
            QueryCache::new(Arc::new(redis.clone()), DEFAULT_TTL),
            Arc::new(FixedTime {
                time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            }),
        );
        let liveness = HealthRegistry::new("liveness");
        let app = router(engine, liveness.clone(), None);
        Self {
            app,
            store,
            redis,
            liveness,
        }
    }

    async fn track(&self, org_id: &str, user_id: &str, event_name: &str, timestamp: DateTime<Utc>) {
        let record = EventRecord {
            org_id: Some(org_id.to_owned()),
            project_id: Some("p".to_owned()),
            event_id: None,
            event_name: event_name.to_owned(),
            user_id: user_id.to_owned(),
            metadata: Default::default(),
            timestamp,
            event_hash: Some(format!("{org_id}-{user_id}-{event_name}-{timestamp}")),
            created_at: timestamp,
        };
        self.store.insert_if_absent(&record).await.unwrap();
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post(&self, uri: &str, body: impl Into<Body>) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(body.into())
                .unwrap(),
        )
        .await
    }
}

#[tokio::test]
async fn funnel_counts_ordered_conversions_and_caches() {
    let analytics = TestAnalytics::new();
    analytics.track("o", "u1", "signup", at(1, 0)).await;
    analytics.track("o", "u1", "purchase", at(2, 0)).await;

    let request = json!({"steps": ["signup", "purchase"], "orgId": "o", "projectId": "p"}).to_string();
    let expected = json!({
        "success": true,
        "totalUsers": 1,
        "steps": [
            {"step": "signup", "users": 1, "users_in_order": 1},
            {"step": "purchase", "users": 1, "users_in_order": 1}
        ]
    });

    let (status, body) = analytics.post("/analytics/funnels", request.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(body, expected);

    let (status, body) = analytics.post("/analytics/funnels", request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cached"], json!(true));
    assert_eq!(body["steps"], expected["steps"]);
}

#[tokio::test]
async fn funnel_ignores_out_of_order_and_other_scopes() {
    let analytics = TestAnalytics::new();
    analytics.track("o", "u1", "purchase", at(1, 0)).await;
    analytics.track("o", "u1", "signup", at(2, 0)).await;
    analytics.track("other", "u2", "signup", at(1, 0)).await;
    analytics.track("other", "u2", "purchase", at(2, 0)).await;

    let (status, body) = analytics
        .post(
            "/analytics/funnels",
            json!({"steps": ["signup", "purchase"], "orgId": "o"}).to_string(),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(
        body,
        json!({
            "success": true,
            "totalUsers": 1,
            "steps": [
                {"step": "signup", "users": 1, "users_in_order": 1},
                {"step": "purchase", "users": 1, "users_in_order": 0}
            ]
        })
    );
}

#[tokio::test]
async fn retention_follows_the_cohort() {
    let analytics = TestAnalytics::new();
    for user in ["u1", "u2", "u3", "u4"] {
        analytics.track("o", user, "signup", at(1, 9)).await;
    }
    analytics.track("o", "u1", "login", at(4, 10)).await;
    analytics.track("o", "u2", "login", at(4, 23)).await;
    // Not in the cohort.
    analytics.track("o", "u5", "login", at(4, 10)).await;

    let (status, body) = analytics
        .get("/analytics/retention?cohort=signup&startDate=2024-01-01&days=4&orgId=o&projectId=p")
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(
        body,
        json!({
            "success": true,
            "cohortSize": 4,
            "retention": [
                {"day": 0, "count": 4, "percent": 100.0},
                {"day": 1, "count": 0, "percent": 0.0},
                {"day": 2, "count": 0, "percent": 0.0},
                {"day": 3, "count": 2, "percent": 50.0}
            ]
        })
    );
}

#[tokio::test]
async fn retention_with_an_empty_cohort() {
    let analytics = TestAnalytics::new();
    analytics.track("o", "u1", "login", at(1, 0)).await;

    let (status, body) = analytics
        .get("/analytics/retention?cohort=signup&startDate=2024-01-01")
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(
        body,
        json!({"success": true, "cohortSize": 0, "retention": []})
    );
}

#[tokio::test]
async fn metrics_are_bucketed_by_interval() {
    let analytics = TestAnalytics::new();
    analytics.track("o", "u1", "signup", at(1, 3)).await;
    analytics.track("o", "u2", "signup", at(1, 20)).await;
    analytics.track("o", "u3", "signup", at(3, 8)).await;
    analytics.track("o", "u3", "login", at(3, 9)).await;

    let (status, body) = analytics
        .get("/analytics/metrics?event=signup&orgId=o&projectId=p")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(
        body,
        json!({
            "success": true,
            "event": "signup",
            "interval": "daily",
            "data": [
                {"period": "2024-01-01", "count": 2},
                {"period": "2024-01-03", "count": 1}
            ]
        })
    );

    let (status, body) = analytics
        .get("/analytics/metrics?event=signup&interval=hourly&startDate=2024-01-01T10:00:00Z")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["data"],
        json!([
            {"period": "2024-01-01T20:00:00Z", "count": 1},
            {"period": "2024-01-03T08:00:00Z", "count": 1}
        ])
    );
}

#[tokio::test]
async fn journey_is_ordered_and_limited() {
    let analytics = TestAnalytics::new();
    analytics.track("o", "u1", "checkout", at(3, 0)).await;
    analytics.track("o", "u1", "signup", at(1, 0)).await;
    analytics.track("o", "u1", "browse", at(2, 0)).await;
    analytics.track("o", "u2", "signup", at(1, 0)).await;

    let (status, body) = analytics
        .get("/analytics/users/u1/journey?orgId=o&limit=2")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));

    let names: Vec<&str> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|event| event["eventName"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["signup", "browse"]);
}

#[tokio::test]
async fn invalid_queries_are_rejected() {
    let analytics = TestAnalytics::new();

    for (uri, error) in [
        ("/analytics/metrics", "event is required"),
        (
            "/analytics/metrics?event=signup&interval=monthly",
            "interval must be one of hourly, daily, weekly (got 'monthly')",
        ),
        (
            "/analytics/metrics?event=signup&startDate=2024-01-02&endDate=2024-01-01",
            "startDate must be before endDate",
        ),
        ("/analytics/retention", "cohort is required"),
        (
            "/analytics/retention?cohort=signup&days=366",
            "days must be an integer between 1 and 365",
        ),
        (
            "/analytics/users/u1/journey?limit=0",
            "limit must be an integer between 1 and 1000",
        ),
    ] {
        let (status, body) = analytics.get(uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_json_eq!(body, json!({"success": false, "error": error}));
    }

    let (status, body) = analytics
        .post("/analytics/funnels", json!({"steps": []}).to_string())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_eq!(
        body,
        json!({"success": false, "error": "steps must hold between 1 and 20 event names"})
    );

    let (status, body) = analytics.post("/analytics/funnels", "{").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn cache_outage_falls_back_to_the_store() {
    let analytics = TestAnalytics::new();
    analytics.track("o", "u1", "signup", at(1, 0)).await;
    analytics.redis.set_failing(true);

    for _ in 0..2 {
        let (status, body) = analytics.get("/analytics/metrics?event=signup").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.get("cached"), None);
        assert_eq!(body["data"], json!([{"period": "2024-01-01", "count": 1}]));
    }
}

#[tokio::test]
async fn store_failures_are_internal_errors() {
    let analytics = TestAnalytics::new();
    analytics.store.set_failing(true);

    let (status, body) = analytics
        .get("/analytics/users/u1/journey")
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq!(
        body,
        json!({"success": false, "error": "internal server error"})
    );
    assert!(analytics.redis.keys().is_empty());
}

#[tokio::test]
async fn funnel_and_journey_include_events_at_the_end_date() {
    let analytics = TestAnalytics::new();
    analytics.track("o", "u1", "a", at(1, 0)).await;
    analytics.track("o", "u1", "b", at(2, 0)).await;
    analytics.track("o", "u1", "c", at(2, 1)).await;

    let (status, body) = analytics
        .post(
            "/analytics/funnels",
            json!({"steps": ["a", "b"], "endDate": "2024-01-02T00:00:00Z"}).to_string(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(
        body,
        json!({
            "success": true,
            "totalUsers": 1,
            "steps": [
                {"step": "a", "users": 1, "users_in_order": 1},
                {"step": "b", "users": 1, "users_in_order": 1}
            ]
        })
    );

    let (status, body) = analytics
        .get("/analytics/users/u1/journey?startDate=2024-01-02T00:00:00Z&endDate=2024-01-02T00:00:00Z")
        .await;
    // A single instant is not a window.
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, body) = analytics
        .get("/analytics/users/u1/journey?endDate=2024-01-02T00:00:00Z")
        .await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|event| event["eventName"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[tokio::test]
async fn liveness_follows_the_heartbeat() {
    let analytics = TestAnalytics::new();

    let (status, _) = analytics.get("/_liveness").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let heartbeat = spawn_heartbeat(&analytics.liveness).await;
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    let (mut status, mut body) = analytics.get("/_liveness").await;
    while status != StatusCode::OK && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        (status, body) = analytics.get("/_liveness").await;
    }
    heartbeat.abort();

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], json!(true));
}
