//! REST ingress: five endpoints translating HTTP bodies into `Queue`
//! commands and `Queue`/FSM replies into JSON bodies. The ingress is an
//! external collaborator whose contract is fixed but whose internals are
//! not otherwise constrained, so this module is intentionally thin: no
//! business logic lives here beyond request validation and shape
//! translation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::error::Error;
use crate::model::{QueueStatus, TestId, TestStatus};
use crate::queue::{QueueCmd, QueueHandle};

pub fn build_router(queue: QueueHandle) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/v1/tests/initialize", post(initialize_test))
        .route("/api/v1/tests/start", post(start_test))
        .route("/api/v1/tests/:test_id/status", get(get_test_status))
        .route("/api/v1/tests/:test_id", delete(cancel_test))
        .route("/api/v1/queue/status", get(get_queue_status))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(queue)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeTestRequest {
    pub test_id: Uuid,
    pub feature_files_location: String,
    pub bucket_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeTestSuccess {
    pub test_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTestRequest {
    pub test_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTestSuccess {
    pub test_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStatusSuccess {
    pub test_id: Uuid,
    pub status: TestStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCancelledSuccess {
    pub test_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusSuccess {
    pub depth: usize,
    pub in_progress: usize,
}

async fn reply_channel<T>() -> (oneshot::Sender<T>, oneshot::Receiver<T>) {
    oneshot::channel()
}

async fn send_and_await<T>(
    queue: &QueueHandle,
    build: impl FnOnce(oneshot::Sender<T>) -> QueueCmd,
) -> Result<T, Error> {
    let (tx, rx) = reply_channel().await;
    queue
        .send(build(tx))
        .await
        .map_err(|_| Error::Fatal { message: "queue task is no longer running".into() })?;
    rx.await
        .map_err(|_| Error::Fatal { message: "queue dropped the reply channel".into() })
}

async fn initialize_test(
    State(queue): State<QueueHandle>,
    Json(req): Json<InitializeTestRequest>,
) -> impl IntoResponse {
    let test_id = TestId::new(req.test_id);
    let result = send_and_await(&queue, |reply| QueueCmd::Initialize {
        test_id,
        feature_files_location: req.feature_files_location,
        bucket_name: req.bucket_name,
        reply,
    })
    .await
    .and_then(std::convert::identity);

    match result {
        Ok(()) => {
            info!(%test_id, "test initialized");
            (StatusCode::CREATED, Json(InitializeTestSuccess { test_id: req.test_id })).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn start_test(
    State(queue): State<QueueHandle>,
    Json(req): Json<StartTestRequest>,
) -> impl IntoResponse {
    let test_id = TestId::new(req.test_id);
    let result = send_and_await(&queue, |reply| QueueCmd::Start { test_id, reply })
        .await
        .and_then(std::convert::identity);

    match result {
        Ok(()) => {
            info!(%test_id, "test started");
            (StatusCode::OK, Json(StartTestSuccess { test_id: req.test_id })).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn get_test_status(
    State(queue): State<QueueHandle>,
    Path(test_id): Path<Uuid>,
) -> impl IntoResponse {
    let tid = TestId::new(test_id);
    let result = send_and_await(&queue, |reply| QueueCmd::GetStatus { test_id: tid, reply })
        .await
        .and_then(std::convert::identity);

    match result {
        Ok(status) => {
            (StatusCode::OK, Json(TestStatusSuccess { test_id, status })).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn cancel_test(State(queue): State<QueueHandle>, Path(test_id): Path<Uuid>) -> impl IntoResponse {
    let tid = TestId::new(test_id);
    let result = send_and_await(&queue, |reply| QueueCmd::Cancel { test_id: tid, reply })
        .await
        .and_then(std::convert::identity);

    match result {
        Ok(()) => {
            info!(test_id = %tid, "test cancelled");
            (StatusCode::OK, Json(TestCancelledSuccess { test_id })).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn get_queue_status(State(queue): State<QueueHandle>) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel::<QueueStatus>();
    if queue.send(QueueCmd::GetQueueStatus { reply: tx }).await.is_err() {
        return Error::Fatal { message: "queue task is no longer running".into() }.into_response();
    }
    match rx.await {
        Ok(status) => (
            StatusCode::OK,
            Json(QueueStatusSuccess { depth: status.depth, in_progress: status.in_flight }),
        )
            .into_response(),
        Err(_) => Error::Fatal { message: "queue dropped the reply channel".into() }.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{SchemaCodec, SchemaRegistryClient};
    use crate::config::{
        ActorRuntimeConfig, Config, KafkaConfig, ObjectStorageConfig, QueueConfig, RestConfig,
        SchemaRegistryConfig, VaultConfig,
    };
    use crate::dsl_registry::DslRegistry;
    use crate::object_storage::fake::FakeObjectStore;
    use crate::queue::QueueDeps;
    use crate::vault_backend::fake::FakeSecretVault;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            actor_runtime: ActorRuntimeConfig {
                system_name: "test-probe".into(),
                shutdown_timeout: Duration::from_secs(5),
                restart_max_count: 3,
                restart_window: Duration::from_secs(60),
                call_timeout: Duration::from_secs(5),
                build_timeout: Duration::from_secs(30),
            },
            queue: QueueConfig { max_concurrent: 2, max_queue_depth: 4 },
            kafka: KafkaConfig {
                bootstrap_servers: "localhost:9092".into(),
                group_id_prefix: "test-probe".into(),
                delivery_timeout: Duration::from_secs(30),
                message_timeout: Duration::from_secs(5),
                max_message_bytes: 1024,
                compression: "lz4".into(),
                acks: "all".into(),
                idempotent: true,
                reconnect_backoff_ms: 1000,
                reconnect_backoff_max_ms: 10000,
                rdkafka_debug: None,
            },
            schema_registry: SchemaRegistryConfig {
                url: "http://localhost:1".into(),
                request_timeout: Duration::from_millis(50),
                cache_capacity: 10,
            },
            rest: RestConfig {
                port: 0,
                host: "127.0.0.1".into(),
                request_timeout: Duration::from_secs(5),
                max_body_size: 1024,
                cors_enabled: false,
                cors_origins: vec![],
            },
            object_storage: ObjectStorageConfig { bucket: "bucket".into(), region: "us-east-1".into(), endpoint: None },
            vault: VaultConfig { namespace: "ns".into(), cache_ttl: Duration::from_secs(60) },
        })
    }

    fn test_queue() -> QueueHandle {
        let client = SchemaRegistryClient::new("http://localhost:1", Duration::from_millis(10)).unwrap();
        let codec = Arc::new(SchemaCodec::new(client, 10));
        let deps = QueueDeps {
            object_store: Arc::new(FakeObjectStore::default()),
            secret_vault: Arc::new(FakeSecretVault::default()),
            codec: codec.clone(),
            registry: Arc::new(DslRegistry::new(codec, Duration::from_secs(5))),
        };
        crate::queue::spawn(test_config(), deps)
    }

    #[tokio::test]
    async fn initialize_then_status_round_trips() {
        let router = build_router(test_queue());
        let test_id = Uuid::new_v4();

        let body = serde_json::json!({
            "testId": test_id,
            "featureFilesLocation": "s3://bucket/path",
            "bucketName": "bucket",
        });
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/tests/initialize")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(format!("/api/v1/tests/{test_id}/status"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_for_unknown_test_is_not_found() {
        let router = build_router(test_queue());
        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(format!("/api/v1/tests/{}/status", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn queue_status_starts_empty() {
        let router = build_router(test_queue());
        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/v1/queue/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
