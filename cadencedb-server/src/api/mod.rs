//! HTTP API endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use cadencedb_core::storage::{EngineStats, ReadRequest, StorageEngine};
use cadencedb_core::{CadenceError, Datapoint, SeriesKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<StorageEngine>,
    /// Most datapoints one `/read` response carries
    pub max_read_datapoints: u64,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the API router
pub fn create_router(engine: Arc<StorageEngine>, max_read_datapoints: u64) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))

        // Datapoints
        .route("/write", post(write))
        .route("/read", post(read))

        // Maintenance
        .route("/flush", post(flush))
        .route("/stats", get(stats))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState {
            engine,
            max_read_datapoints,
        })
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub labels: BTreeMap<String, String>,
    pub datapoints: Vec<Datapoint>,
}

#[derive(Debug, Deserialize)]
pub struct ReadBody {
    pub labels: BTreeMap<String, String>,
    pub start: Timestamp,
    pub end: Timestamp,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub prefer_latest: bool,
}

#[derive(Debug, Serialize)]
pub struct ReadResponse {
    pub datapoints: Vec<Datapoint>,
    /// More datapoints matched than one response may carry. The oldest are
    /// kept, or the newest with `prefer_latest`.
    pub truncated: bool,
}

#[derive(Debug, Serialize)]
pub struct FlushResponse {
    pub series_flushed: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// Map an engine error onto the status a client should act on
fn engine_error(e: CadenceError) -> ApiError {
    let status = if e.is_invalid_request() {
        StatusCode::BAD_REQUEST
    } else if e.is_retryable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        tracing::error!("Request failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    error_response(status, e)
}

/// Run a blocking engine call off the async executor
async fn blocking<T, F>(engine: Arc<StorageEngine>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&StorageEngine) -> cadencedb_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))?
        .map_err(engine_error)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: cadencedb_core::VERSION.to_string(),
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn write(
    State(state): State<AppState>,
    Json(req): Json<WriteRequest>,
) -> Result<StatusCode, ApiError> {
    let key = SeriesKey { labels: req.labels };
    blocking(state.engine, move |engine| engine.write(&key, &req.datapoints)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn read(
    State(state): State<AppState>,
    Json(req): Json<ReadBody>,
) -> Result<Json<ReadResponse>, ApiError> {
    let key = SeriesKey { labels: req.labels };
    let cap = state.max_read_datapoints;

    // One past the cap tells a truncated range from one that fits exactly
    let fetch_limit = cap.saturating_add(1);
    let request = ReadRequest {
        start: req.start,
        end: req.end,
        limit: Some(req.limit.map_or(fetch_limit, |limit| limit.min(fetch_limit))),
        prefer_latest: req.prefer_latest,
    };
    let mut datapoints =
        blocking(state.engine, move |engine| engine.read_all(&key, request)).await?;

    let truncated = datapoints.len() as u64 > cap;
    if truncated {
        if req.prefer_latest {
            datapoints.remove(0);
        } else {
            datapoints.pop();
        }
    }
    Ok(Json(ReadResponse {
        datapoints,
        truncated,
    }))
}

async fn flush(State(state): State<AppState>) -> Result<Json<FlushResponse>, ApiError> {
    let series_flushed = blocking(state.engine, |engine| engine.flush_all()).await?;
    Ok(Json(FlushResponse { series_flushed }))
}

async fn stats(State(state): State<AppState>) -> Json<EngineStats> {
    Json(state.engine.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use cadencedb_core::storage::StorageConfig;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_router(temp_dir: &TempDir) -> Router {
        capped_router(temp_dir, 1_000)
    }

    fn capped_router(temp_dir: &TempDir, max_read_datapoints: u64) -> Router {
        let engine = StorageEngine::open(StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            worker_threads: 2,
            worker_queue_limit: 64,
            background_flush: false,
            ..StorageConfig::default()
        })
        .unwrap();
        create_router(Arc::new(engine), max_read_datapoints)
    }

    async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_ping() {
        let temp_dir = TempDir::new().unwrap();
        let app = test_router(&temp_dir);

        let response = app
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"pong");
    }

    #[tokio::test]
    async fn test_write_flush_read() {
        let temp_dir = TempDir::new().unwrap();
        let app = test_router(&temp_dir);
        let labels = json!({"host": "web-01", "metric": "cpu"});

        let (status, _) = post(
            &app,
            "/write",
            json!({
                "labels": labels,
                "datapoints": [
                    {"timestamp": 20, "value": 2.0, "duration": 10},
                    {"timestamp": 10, "value": 1.0, "duration": 10},
                    {"timestamp": 30, "value": 3.0, "duration": 10}
                ]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = post(&app, "/flush", json!(null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["series_flushed"], 1);

        let (status, body) = post(
            &app,
            "/read",
            json!({"labels": labels, "start": 0, "end": 100, "limit": 2, "prefer_latest": true}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let points = body["datapoints"].as_array().unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0]["timestamp"], 20);
        assert_eq!(points[1]["value"], 3.0);
        assert_eq!(body["truncated"], false);
    }

    #[tokio::test]
    async fn test_read_is_capped() {
        let temp_dir = TempDir::new().unwrap();
        let app = capped_router(&temp_dir, 3);
        let labels = json!({"host": "a"});

        let datapoints: Vec<Value> = (0..10)
            .map(|i| json!({"timestamp": i, "value": i as f64, "duration": 1}))
            .collect();
        post(&app, "/write", json!({"labels": labels, "datapoints": datapoints})).await;

        let timestamps = |body: &Value| -> Vec<i64> {
            body["datapoints"]
                .as_array()
                .unwrap()
                .iter()
                .map(|p| p["timestamp"].as_i64().unwrap())
                .collect()
        };

        let (status, body) = post(&app, "/read", json!({"labels": labels, "start": 0, "end": 100})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(timestamps(&body), vec![0, 1, 2]);
        assert_eq!(body["truncated"], true);

        let (_, body) = post(
            &app,
            "/read",
            json!({"labels": labels, "start": 0, "end": 100, "prefer_latest": true, "limit": 50}),
        )
        .await;
        assert_eq!(timestamps(&body), vec![7, 8, 9]);
        assert_eq!(body["truncated"], true);

        // Exactly the cap is not a truncation
        let (_, body) = post(&app, "/read", json!({"labels": labels, "start": 7, "end": 100})).await;
        assert_eq!(timestamps(&body), vec![7, 8, 9]);
        assert_eq!(body["truncated"], false);

        let (_, body) = post(&app, "/read", json!({"labels": labels, "start": 0, "end": 100, "limit": 2})).await;
        assert_eq!(timestamps(&body), vec![0, 1]);
        assert_eq!(body["truncated"], false);
    }

    #[tokio::test]
    async fn test_bad_requests_are_400() {
        let temp_dir = TempDir::new().unwrap();
        let app = test_router(&temp_dir);

        let (status, body) = post(
            &app,
            "/read",
            json!({"labels": {"host": "a"}, "start": 10, "end": 5}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Invalid range"));

        let (status, _) = post(&app, "/write", json!({"labels": {}, "datapoints": []})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stats_counts_buffered_points() {
        let temp_dir = TempDir::new().unwrap();
        let app = test_router(&temp_dir);

        post(
            &app,
            "/write",
            json!({
                "labels": {"host": "a"},
                "datapoints": [{"timestamp": 1, "value": 1.0, "duration": 1}]
            }),
        )
        .await;

        let response = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["series"], 1);
        assert_eq!(body["buffered_datapoints"], 1);
        assert_eq!(body["worker_queues"].as_array().unwrap().len(), 2);
    }
}
