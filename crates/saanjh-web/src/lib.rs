//! Axum surface for triggering ingestion runs remotely.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use saanjh_ingest::{IngestPipeline, IngestRunReport};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "saanjh-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub trigger_secret: String,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestPipeline>, trigger_secret: impl Into<String>) -> Self {
        Self {
            pipeline,
            trigger_secret: trigger_secret.into(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TriggerQuery {
    secret: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ingest/trigger", post(trigger_handler).get(trigger_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "ingestion trigger listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Secret comes from a `Bearer` header, or from `?secret=` so the GET
/// form works from cron-style HTTP pingers.
fn authorized(state: &AppState, headers: &HeaderMap, query: &TriggerQuery) -> bool {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if bearer == Some(state.trigger_secret.as_str()) {
        return true;
    }
    query.secret.as_deref() == Some(state.trigger_secret.as_str())
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TriggerQuery>,
) -> Response {
    if !authorized(&state, &headers, &query) {
        warn!("ingestion trigger denied, bad secret");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "success": false,
                "error": "invalid or missing trigger secret",
                "timestamp": Utc::now(),
            })),
        )
            .into_response();
    }

    info!("ingestion triggered over http");
    let report = state.pipeline.run_once().await;
    let status = run_status(&report);
    (status, Json(report_body(&report))).into_response()
}

fn run_status(report: &IngestRunReport) -> StatusCode {
    // Partial outcomes still return the report with 200; only a run
    // that fetched nothing and produced only errors is a 500.
    if !report.errors.is_empty() && report.stats.fetched == 0 {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

fn report_body(report: &IngestRunReport) -> serde_json::Value {
    serde_json::json!({
        "success": report.success,
        "stats": report.stats,
        "logs": report.logs,
        "errors": report.errors,
        "timestamp": report.finished_at,
    })
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok", "timestamp": Utc::now() })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use saanjh_ingest::IngestConfig;
    use saanjh_storage::MemoryEventStore;
    use tower::ServiceExt;

    fn test_state(secret: &str) -> AppState {
        let config = IngestConfig {
            bookmyshow_enabled: false,
            request_delay_ms: 0,
            ..IngestConfig::default()
        };
        let store = Arc::new(MemoryEventStore::new());
        let pipeline = IngestPipeline::new(config, store).expect("pipeline");
        AppState::new(Arc::new(pipeline), secret)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn trigger_without_secret_is_unauthorized() {
        let app = app(test_state("s3cret"));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/ingest/trigger")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(resp).await;
        assert_eq!(body["success"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn trigger_with_wrong_bearer_is_unauthorized() {
        let app = app(test_state("s3cret"));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/ingest/trigger")
                    .header(header::AUTHORIZATION, "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn trigger_with_bearer_runs_and_reports() {
        // No adapters configured, so the run is an empty success.
        let app = app(test_state("s3cret"));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/ingest/trigger")
                    .header(header::AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], serde_json::json!(true));
        assert!(body["stats"].is_object());
        assert!(body["logs"].is_array());
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn get_trigger_accepts_query_secret() {
        let app = app(test_state("s3cret"));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/ingest/trigger?secret=s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn healthz_is_open() {
        let app = app(test_state("s3cret"));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], serde_json::json!("ok"));
    }
}
