//! Axum JSON API over the tracker queries. Read-only apart from the report
//! trigger; all business logic stays in the engine.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tokio::net::TcpListener;

use calt_engine::{
    latest_report, Tracker, DEFAULT_RECENT_DAYS, DEFAULT_VETERAN_LIMIT, DEFAULT_VETERAN_MIN_DAYS,
};

pub const CRATE_NAME: &str = "calt-web";

#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<Tracker>,
    pub reports_dir: PathBuf,
}

impl AppState {
    pub fn new(tracker: Arc<Tracker>, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            tracker,
            reports_dir: reports_dir.into(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct VeteransQuery {
    min_days: Option<u32>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct NewAdsQuery {
    days: Option<u32>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/ads/veterans", get(veterans_handler))
        .route("/api/ads/new", get(new_ads_handler))
        .route("/api/ads/all", get(all_ads_handler))
        .route("/api/competitors", get(competitors_handler))
        .route("/api/scrapes/recent", get(recent_scrapes_handler))
        .route("/api/reports/generate", post(generate_report_handler))
        .route("/api/reports/latest", get(latest_report_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.tracker.stats(Utc::now()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err),
    }
}

async fn veterans_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VeteransQuery>,
) -> Response {
    let min_days = query.min_days.unwrap_or(DEFAULT_VETERAN_MIN_DAYS);
    let limit = query.limit.unwrap_or(DEFAULT_VETERAN_LIMIT);
    match state.tracker.veterans(min_days, limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn new_ads_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NewAdsQuery>,
) -> Response {
    let days = query.days.unwrap_or(DEFAULT_RECENT_DAYS);
    match state.tracker.recent(days, Utc::now()).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn all_ads_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.tracker.all_active().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn competitors_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.tracker.store().list_competitors().await {
        Ok(competitors) => Json(competitors).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn recent_scrapes_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.tracker.store().recent_scrape_events(50).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn generate_report_handler(State(state): State<Arc<AppState>>) -> Response {
    match state
        .tracker
        .write_winners_report(&state.reports_dir, Utc::now())
        .await
    {
        Ok(path) => Json(serde_json::json!({
            "success": true,
            "path": path.display().to_string(),
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn latest_report_handler(State(state): State<Arc<AppState>>) -> Response {
    let found = match latest_report(&state.reports_dir) {
        Ok(found) => found,
        Err(err) => return server_error(err),
    };
    let Some(path) = found else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "No report found. Generate one first." })),
        )
            .into_response();
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use calt_core::{AdCandidate, AdType};
    use calt_store::JsonStore;
    use chrono::Duration;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn seeded_app(dir: &TempDir) -> Router {
        let store = Arc::new(JsonStore::new(dir.path().join("data")));
        let now = Utc::now();
        store
            .register_competitor("Nike", None, now)
            .await
            .unwrap();
        store
            .upsert_ad(
                &AdCandidate {
                    ad_id: "a1".into(),
                    competitor_id: 1,
                    ad_type: AdType::Video,
                    headline: "Run Far".into(),
                    body_text: "body".into(),
                    image_url: String::new(),
                    video_url: String::new(),
                },
                now,
            )
            .await
            .unwrap();
        store
            .backdate_first_seen("a1", now - Duration::days(45))
            .await
            .unwrap();
        store.recompute_days_running(now).await.unwrap();
        store.append_scrape_event(1, 1, 1, now).await.unwrap();

        let tracker = Arc::new(Tracker::new(store));
        app(AppState::new(tracker, dir.path().join("reports")))
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn stats_endpoint_reports_counts() {
        let dir = TempDir::new().unwrap();
        let app = seeded_app(&dir).await;

        let (status, body) = get_json(&app, "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_ads"], 1);
        assert_eq!(body["veteran_ads"], 1);
        assert_eq!(body["new_ads"], 0);
    }

    #[tokio::test]
    async fn veterans_endpoint_honors_query_parameters() {
        let dir = TempDir::new().unwrap();
        let app = seeded_app(&dir).await;

        let (status, body) = get_json(&app, "/api/ads/veterans?min_days=10&limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["page_name"], "Nike");
        assert_eq!(body[0]["days_running"], 45);

        let (_, strict) = get_json(&app, "/api/ads/veterans?min_days=60").await;
        assert!(strict.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn competitors_and_scrapes_are_visible() {
        let dir = TempDir::new().unwrap();
        let app = seeded_app(&dir).await;

        let (status, competitors) = get_json(&app, "/api/competitors").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(competitors[0]["page_name"], "Nike");

        let (status, scrapes) = get_json(&app, "/api/scrapes/recent").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(scrapes.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn report_generation_then_download_roundtrip() {
        let dir = TempDir::new().unwrap();
        let app = seeded_app(&dir).await;

        let missing = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/reports/latest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let generated = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/reports/generate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(generated.status(), StatusCode::OK);

        let latest = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/reports/latest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(latest.status(), StatusCode::OK);
        let text = String::from_utf8(
            latest
                .into_body()
                .collect()
                .await
                .unwrap()
                .to_bytes()
                .to_vec(),
        )
        .unwrap();
        assert!(text.contains("Run Far"));
    }
}
