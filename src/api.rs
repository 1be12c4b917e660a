use axum::{
    body::Bytes,
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::{HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, instrument};

use crate::config::ApiConfig;
use crate::inference::{InferenceClient, PredictError};
use crate::publisher::MessagePublisher;
use crate::upload::{handle_upload, FileStore, UploadError};

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<dyn MessagePublisher>,
    pub store: Arc<FileStore>,
    pub inference: Arc<InferenceClient>,
    pub queue: String,
}

/// Standard error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Response returned after a successful upload
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub filename: String,
}

/// Build the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/upload", post(upload_file))
        .route("/predict", post(predict))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "gateway-service"
    }))
}

/// Accept a multipart file upload, store it, and queue it for processing
#[instrument(skip(state, multipart))]
async fn upload_file(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, (StatusCode, Json<ErrorResponse>)> {
    // A request without a multipart body gets the same envelope as a
    // missing file field
    let outcome = match multipart {
        Ok(multipart) => {
            handle_upload(multipart, &state.store, state.publisher.as_ref(), &state.queue).await
        }
        Err(_) => Err(UploadError::NoFile),
    };

    match outcome {
        Ok(filename) => {
            metrics::counter!("gateway.uploads.completed").increment(1);
            Ok(Json(UploadResponse {
                message: "file uploaded and queued".to_string(),
                filename,
            }))
        }
        Err(e) => {
            metrics::counter!("gateway.uploads.failed").increment(1);
            Err(upload_error_response(e))
        }
    }
}

/// Forward a prediction request to the inference service
#[instrument(skip(state, body))]
async fn predict(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<ErrorResponse>)> {
    match state.inference.predict(&body).await {
        Ok(result) => {
            metrics::counter!("gateway.predictions.completed").increment(1);
            Ok(Json(Value::Object(result)))
        }
        Err(e) => {
            metrics::counter!("gateway.predictions.failed").increment(1);
            Err(predict_error_response(e))
        }
    }
}

fn upload_error_response(err: UploadError) -> (StatusCode, Json<ErrorResponse>) {
    match err {
        UploadError::NoFile => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "no file provided".to_string(),
                code: "NO_FILE".to_string(),
            }),
        ),
        UploadError::Storage { .. } => {
            error!(error = %err, "Upload storage failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "failed to store file".to_string(),
                    code: "STORAGE_ERROR".to_string(),
                }),
            )
        }
        UploadError::Publish(_) => {
            error!(error = %err, "Upload publish failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "failed to queue file for processing".to_string(),
                    code: "PUBLISH_ERROR".to_string(),
                }),
            )
        }
    }
}

fn predict_error_response(err: PredictError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, message, code) = match &err {
        PredictError::InvalidBody(_) => (
            StatusCode::BAD_REQUEST,
            "invalid request body",
            "INVALID_BODY",
        ),
        PredictError::Unreachable(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "inference service unavailable",
            "UPSTREAM_UNAVAILABLE",
        ),
        PredictError::UpstreamStatus(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "inference request failed",
            "UPSTREAM_ERROR",
        ),
        PredictError::Decode(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to decode inference response",
            "DECODE_ERROR",
        ),
    };

    if status.is_server_error() {
        error!(error = %err, "Prediction bridge failed");
    }

    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
            code: code.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InferenceConfig;
    use crate::publisher::RecordingPublisher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestServer {
        url: String,
        publisher: Arc<RecordingPublisher>,
        dir: tempfile::TempDir,
    }

    async fn spawn_app(inference_url: String) -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let store = Arc::new(FileStore::new(dir.path()));
        let inference =
            Arc::new(InferenceClient::new(&InferenceConfig { url: inference_url }).unwrap());
        let state = AppState {
            publisher: publisher.clone(),
            store,
            inference,
            queue: "images".to_string(),
        };
        let router = create_router(state, &ApiConfig::default());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        TestServer {
            url: format!("http://{}", addr),
            publisher,
            dir,
        }
    }

    async fn spawn_upstream(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_upload_stores_file_and_queues_notification() {
        let app = spawn_app("http://127.0.0.1:9/unused".to_string()).await;

        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(b"jpeg-bytes".to_vec()).file_name("car.jpg"),
        );
        let response = reqwest::Client::new()
            .post(format!("{}/upload", app.url))
            .multipart(form)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["message"], "file uploaded and queued");
        assert_eq!(body["filename"], "car.jpg");

        assert_eq!(
            std::fs::read(app.dir.path().join("car.jpg")).unwrap(),
            b"jpeg-bytes"
        );
        let messages = app.publisher.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "images");
        assert_eq!(messages[0].1, b"car.jpg".to_vec());
    }

    #[tokio::test]
    async fn test_upload_without_file_field_is_rejected() {
        let app = spawn_app("http://127.0.0.1:9/unused".to_string()).await;

        let form = reqwest::multipart::Form::new().text("note", "no file here");
        let response = reqwest::Client::new()
            .post(format!("{}/upload", app.url))
            .multipart(form)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "no file provided");
        assert_eq!(body["code"], "NO_FILE");
        assert!(app.publisher.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_non_multipart_body_gets_error_envelope() {
        let app = spawn_app("http://127.0.0.1:9/unused".to_string()).await;

        let response = reqwest::Client::new()
            .post(format!("{}/upload", app.url))
            .header("content-type", "application/json")
            .body(r#"{"filename":"car.jpg"}"#)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "no file provided");
        assert_eq!(body["code"], "NO_FILE");
        assert!(app.publisher.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_publish_failure_returns_500_and_keeps_file() {
        let app = spawn_app("http://127.0.0.1:9/unused".to_string()).await;
        app.publisher.fail.store(true, Ordering::SeqCst);

        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(b"rows".to_vec()).file_name("data.csv"),
        );
        let response = reqwest::Client::new()
            .post(format!("{}/upload", app.url))
            .multipart(form)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 500);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["code"], "PUBLISH_ERROR");
        // The stored file survives the failed publish
        assert_eq!(
            std::fs::read(app.dir.path().join("data.csv")).unwrap(),
            b"rows"
        );
    }

    #[tokio::test]
    async fn test_predict_relays_inference_result() {
        let upstream = spawn_upstream(Router::new().route(
            "/predict/onnx",
            post(|Json(v): Json<Value>| async move {
                Json(json!({"price": 12000, "seen_year": v["year"]}))
            }),
        ))
        .await;
        let app = spawn_app(format!("{}/predict/onnx", upstream)).await;

        let response = reqwest::Client::new()
            .post(format!("{}/predict", app.url))
            .header("content-type", "application/json")
            .body(r#"{"brand":"Toyota","year":2020}"#)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["price"], 12000);
        assert_eq!(body["seen_year"], 2020);
    }

    #[tokio::test]
    async fn test_predict_invalid_body_is_rejected_before_upstream() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let upstream = spawn_upstream(Router::new().route(
            "/predict/onnx",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"price": 1}))
                }
            }),
        ))
        .await;
        let app = spawn_app(format!("{}/predict/onnx", upstream)).await;

        let response = reqwest::Client::new()
            .post(format!("{}/predict", app.url))
            .header("content-type", "application/json")
            .body(r#"{"brand":"Toyota","year":"abc"}"#)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "invalid request body");
        assert_eq!(body["code"], "INVALID_BODY");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_predict_upstream_failure_is_translated() {
        let upstream = spawn_upstream(Router::new().route(
            "/predict/onnx",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "secret-detail") }),
        ))
        .await;
        let app = spawn_app(format!("{}/predict/onnx", upstream)).await;

        let response = reqwest::Client::new()
            .post(format!("{}/predict", app.url))
            .header("content-type", "application/json")
            .body(r#"{"brand":"BMW"}"#)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 500);
        let text = response.text().await.unwrap();
        assert!(!text.contains("secret-detail"));
        let body: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["code"], "UPSTREAM_ERROR");
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = spawn_app("http://127.0.0.1:9/unused".to_string()).await;

        let response = reqwest::get(format!("{}/health", app.url)).await.unwrap();

        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }
}
