use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    extract::connect_info::MockConnectInfo,
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_rusqlite::Connection;
use tower::ServiceExt;

use portfolio_analytics::config::Config;
use portfolio_analytics::geo::{EnrichmentError, GeoLookup, GeoResult};
use portfolio_analytics::migrations::run_migrations;
use portfolio_analytics::{router, AppState};

const TOKEN: &str = "test-token";

#[derive(Default)]
struct StubGeo {
    calls: AtomicUsize,
    addresses: Mutex<Vec<String>>,
}

#[async_trait]
impl GeoLookup for StubGeo {
    async fn lookup(&self, ip: &str) -> Result<GeoResult, EnrichmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.addresses.lock().unwrap().push(ip.to_string());
        Ok(GeoResult {
            city: "Madrid".to_string(),
            region: "Madrid".to_string(),
            country: "Spain".to_string(),
            org: "Acme Cloud".to_string(),
            is_company: true,
            ..Default::default()
        })
    }
}

async fn app() -> (Router, Arc<StubGeo>) {
    let (app, geo, _) = app_with_db().await;
    (app, geo)
}

async fn app_with_db() -> (Router, Arc<StubGeo>, Arc<Connection>) {
    let db = Connection::open_in_memory().await.unwrap();
    run_migrations(&db).await.unwrap();
    let db = Arc::new(db);

    let geo = Arc::new(StubGeo::default());
    let config = Config {
        admin_token: TOKEN.to_string(),
        ..Config::default()
    };
    let state = AppState {
        db: db.clone(),
        geo: geo.clone(),
        config: Arc::new(config),
    };
    let app = router(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
    (app, geo, db)
}

async fn stored_prefixes(db: &Connection) -> Vec<String> {
    db.call(|conn| {
        let mut stmt = conn.prepare("SELECT anonymized_ip FROM visits ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, rusqlite::Error>>()?;
        Ok(rows)
    })
    .await
    .unwrap()
}

fn post_json(uri: &str, ip: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn admin_get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn health_reports_ok() {
    let (app, _) = app().await;
    let request = Request::builder()
        .uri("/api/health")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn admin_routes_require_token() {
    let (app, _) = app().await;

    for uri in ["/api/visits/stats", "/api/visits/history", "/api/events/stats"] {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", uri);
        assert_eq!(body["error"], "unauthorized");

        let request = Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", uri);
    }
}

#[tokio::test]
async fn visits_are_aggregated_end_to_end() {
    let (app, geo) = app().await;

    for (n, ip) in ["203.0.113.7", "198.51.100.20", "192.0.2.44"].iter().enumerate() {
        let (status, body) = send(
            &app,
            post_json(
                "/api/visits",
                ip,
                json!({ "page": "/projects", "referrer": "https://www.Google.com/search?q=x" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_visits"], n as i64 + 1);
    }
    assert_eq!(geo.calls.load(Ordering::SeqCst), 3);

    let (status, body) = send(
        &app,
        post_json("/api/visits/duration", "203.0.113.7", json!({ "seconds": 45 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true }));

    let (status, stats) = send(&app, admin_get("/api/visits/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["unique_visitors"], 3);
    assert_eq!(stats["total_page_views"], 3);
    assert_eq!(stats["avg_duration_seconds"], 45.0);
    assert_eq!(
        stats["by_page"],
        json!([{ "page": "/projects", "views": 3, "unique_visitors": 3 }])
    );
    assert_eq!(
        stats["by_referrer"],
        json!([{ "referrer": "google.com", "visitors": 3 }])
    );
    assert_eq!(stats["company_vs_residential"], json!({ "empresa": 3, "usuario": 0 }));

    let request = Request::builder()
        .uri("/api/visits/count")
        .body(Body::empty())
        .unwrap();
    let (status, counts) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(counts, json!({ "unique_visitors": 3, "total_page_views": 3 }));
}

#[tokio::test]
async fn private_addresses_skip_geo_lookup() {
    let (app, geo) = app().await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/visits")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_visits"], 1);
    assert_eq!(geo.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn history_has_thirty_days() {
    let (app, _) = app().await;
    send(&app, post_json("/api/visits", "203.0.113.7", json!({ "page": "/" }))).await;

    let (status, history) = send(&app, admin_get("/api/visits/history")).await;
    assert_eq!(status, StatusCode::OK);

    let days = history.as_array().unwrap();
    assert_eq!(days.len(), 30);
    assert_eq!(days[29]["visitors"], 1);
    assert!(days[..29].iter().all(|day| day["visitors"] == 0));
}

#[tokio::test]
async fn unknown_event_type_is_rejected() {
    let (app, _) = app().await;

    let (status, body) = send(
        &app,
        post_json("/api/events", "203.0.113.7", json!({ "type": "page_scroll" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid event type");

    let (status, _) = send(&app, post_json("/api/events", "203.0.113.7", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, stats) = send(&app, admin_get("/api/events/stats")).await;
    assert_eq!(stats["funnel"]["project_clicks"], 0);
    assert_eq!(stats["funnel"]["contact_submits"], 0);
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let (app, _) = app().await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/events")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn project_clicks_feed_the_funnel() {
    let (app, _) = app().await;
    let metadata = json!({ "project_id": 7, "title": "Portfolio" });

    for _ in 0..2 {
        let (status, body) = send(
            &app,
            post_json(
                "/api/events",
                "203.0.113.7",
                json!({ "type": "project_click", "metadata": metadata }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));
    }
    send(
        &app,
        post_json("/api/events", "203.0.113.7", json!({ "type": "contact_submit" })),
    )
    .await;

    let (status, stats) = send(&app, admin_get("/api/events/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["funnel"]["project_clicks"], 2);
    assert_eq!(stats["funnel"]["contact_submits"], 1);
    assert_eq!(stats["this_week"]["project_clicks"], 2);
    assert_eq!(stats["last_week"]["project_clicks"], 0);
    assert_eq!(stats["deltas"]["project_clicks"], Value::Null);
    assert_eq!(
        stats["top_projects"],
        json!([{ "project_id": 7, "title": "Portfolio", "clicks": 2 }])
    );
}

#[tokio::test]
async fn follow_toggle_round_trips() {
    let (app, _) = app().await;

    let (_, body) = send(&app, post_json("/api/followers/toggle", "203.0.113.7", json!({}))).await;
    assert_eq!(body, json!({ "followers_count": 1, "following": true }));

    let (_, body) = send(&app, post_json("/api/followers/toggle", "203.0.113.7", json!({}))).await;
    assert_eq!(body, json!({ "followers_count": 0, "following": false }));
}

#[tokio::test]
async fn cv_downloads_are_counted() {
    let (app, _) = app().await;

    let (status, body) = send(&app, post_json("/api/cv/download", "203.0.113.7", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_downloads"], 1);

    let (status, stats) = send(&app, admin_get("/api/cv/downloads")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_downloads"], 1);
    assert_eq!(stats["unique_downloads"], 1);
    assert_eq!(stats["today_downloads"], 1);
}

#[tokio::test]
async fn forwarded_values_that_are_not_addresses_are_ignored() {
    let (app, geo, db) = app_with_db().await;

    for forged in ["83.45.112.201 x", "83.45.112.201?fields=status,query#"] {
        let (status, _) = send(&app, post_json("/api/visits", forged, json!({ "page": "/" }))).await;
        assert_eq!(status, StatusCode::OK);
    }
    send(&app, post_json("/api/visits", "83.45.112.201", json!({ "page": "/" }))).await;

    assert_eq!(
        stored_prefixes(&db).await,
        vec!["127.0.0.0", "127.0.0.0", "83.45.112.0"]
    );
    assert_eq!(*geo.addresses.lock().unwrap(), vec!["83.45.112.201".to_string()]);
}

#[tokio::test]
async fn neighbours_on_one_network_follow_separately() {
    let (app, _) = app().await;

    let (_, body) = send(&app, post_json("/api/followers/toggle", "83.45.112.10", json!({}))).await;
    assert_eq!(body, json!({ "followers_count": 1, "following": true }));

    let (_, body) = send(&app, post_json("/api/followers/toggle", "83.45.112.99", json!({}))).await;
    assert_eq!(body, json!({ "followers_count": 2, "following": true }));

    let request = Request::builder()
        .uri("/api/followers")
        .header("x-forwarded-for", "83.45.112.10")
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&app, request).await;
    assert_eq!(body, json!({ "followers_count": 2, "following": true }));
}
