use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use code_exec::{
    store::ResultStore, ConnectionRegistry, IngestionGateway, SubmissionMessage, SubmitAck,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{future::Future, net::SocketAddr, sync::Arc};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

mod rpc;
mod ws;

pub use rpc::{dispatch, serve_rpc, RpcError, RpcRequest, RpcResponse};
pub use ws::{ConnectionStatus, WsPushChannel};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Pipeline(#[from] code_exec::Error),
    #[error("Result not found: {0}")]
    NotFound(String),
    #[error("Server error: {0}")]
    ServerError(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Pipeline(code_exec::Error::Decode(_)) => {
                StatusCode::BAD_REQUEST
            }
            ServerError::Pipeline(code_exec::Error::AdmissionDenied) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ServerError::Pipeline(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Pipeline(_) | ServerError::ServerError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Body of a successful `GET /result/:id`
#[derive(Debug, Serialize, Deserialize)]
pub struct ResultResponse {
    pub id: String,
    pub output: String,
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub connection_id: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<IngestionGateway>,
    pub store: Arc<dyn ResultStore>,
    pub registry: Arc<ConnectionRegistry>,
}

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::permissive();

    Router::new()
        .route("/health", get(health_check))
        .route("/submit", post(submit))
        .route("/result/:id", get(fetch_result))
        .route("/ws", get(websocket))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn run_server<F>(app: Router, addr: SocketAddr, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Starting code execution server on {}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::ServerError(e.to_string()))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::ServerError(e.to_string()))?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn submit(
    State(state): State<AppState>,
    payload: Result<Json<SubmissionMessage>, JsonRejection>,
) -> Result<Json<SubmitAck>, ServerError> {
    let Json(submission) = payload.map_err(|e| ServerError::InvalidRequest(e.body_text()))?;
    let ack = state.gateway.submit(submission).await?;
    Ok(Json(ack))
}

async fn fetch_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResultResponse>, ServerError> {
    match state.store.get(&id).await? {
        Some(output) => Ok(Json(ResultResponse { id, output })),
        None => Err(ServerError::NotFound(id)),
    }
}

async fn websocket(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ServerError> {
    let connection_id = params
        .connection_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ServerError::InvalidRequest("connection_id is required".to_string()))?;

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let registry = state.registry.clone();
    Ok(upgrade.on_upgrade(move |socket| ws::handle_socket(socket, connection_id, registry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{body::Body, http::Request};
    use code_exec::queue::{AckMode, MemoryQueue, QueueClient, Subscription};
    use code_exec::store::MemoryResultStore;
    use code_exec::{Language, SlidingWindowLimiter};
    use std::time::Duration;
    use tower::ServiceExt;

    struct Fixture {
        app: Router,
        queue: MemoryQueue,
        store: Arc<MemoryResultStore>,
    }

    fn create_test_app(max_requests: usize) -> Fixture {
        let queue = MemoryQueue::new();
        let store = Arc::new(MemoryResultStore::new());
        let limiter = SlidingWindowLimiter::new(max_requests, Duration::from_secs(60));
        let state = AppState {
            gateway: Arc::new(IngestionGateway::new(
                Arc::new(limiter),
                Arc::new(queue.clone()),
                "submissions",
            )),
            store: store.clone(),
            registry: Arc::new(ConnectionRegistry::new()),
        };
        Fixture {
            app: create_app(state),
            queue,
            store,
        }
    }

    fn submit_request(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/submit")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn valid_submission(id: &str) -> String {
        let submission = SubmissionMessage::from_source(id, Language::Python, "print(1+1)", "c1");
        serde_json::to_string(&submission).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let fixture = create_test_app(10);

        let response = fixture
            .app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_submit_enqueues() {
        let fixture = create_test_app(10);

        let response = fixture
            .app
            .oneshot(submit_request(valid_submission("r1")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], "r1");
        assert_eq!(fixture.queue.len("submissions"), 1);
    }

    #[tokio::test]
    async fn test_submit_validation_error() {
        let fixture = create_test_app(10);
        let body = json!({ "id": "r1", "code": "eA==", "language_id": 42, "connection_id": "c1" });

        let response = fixture
            .app
            .oneshot(submit_request(body.to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Language not supported: 42");
        assert!(fixture.queue.is_empty("submissions"));
    }

    #[tokio::test]
    async fn test_submit_malformed_json() {
        let fixture = create_test_app(10);

        let response = fixture
            .app
            .oneshot(submit_request("{not json".to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_submit_rate_limited() {
        let fixture = create_test_app(1);

        let first = fixture
            .app
            .clone()
            .oneshot(submit_request(valid_submission("r1")))
            .await
            .unwrap();
        let second = fixture
            .app
            .oneshot(submit_request(valid_submission("r2")))
            .await
            .unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_json(second).await["error"], "Too many requests");
        assert_eq!(fixture.queue.len("submissions"), 1);
    }

    struct UnavailableQueue;

    #[async_trait]
    impl QueueClient for UnavailableQueue {
        async fn publish(&self, _queue: &str, _payload: &[u8]) -> Result<(), code_exec::Error> {
            Err(code_exec::Error::Queue("broker unavailable".into()))
        }

        async fn consume(
            &self,
            _queue: &str,
            _mode: AckMode,
        ) -> Result<Box<dyn Subscription>, code_exec::Error> {
            Err(code_exec::Error::Queue("broker unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_submit_queue_failure() {
        let limiter = SlidingWindowLimiter::new(10, Duration::from_secs(60));
        let state = AppState {
            gateway: Arc::new(IngestionGateway::new(
                Arc::new(limiter),
                Arc::new(UnavailableQueue),
                "submissions",
            )),
            store: Arc::new(MemoryResultStore::new()),
            registry: Arc::new(ConnectionRegistry::new()),
        };

        let response = create_app(state)
            .oneshot(submit_request(valid_submission("r1")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "Internal server error");
    }

    #[tokio::test]
    async fn test_fetch_result() {
        let fixture = create_test_app(10);
        fixture
            .store
            .set("r1", "2\n", Duration::from_secs(60))
            .await
            .unwrap();

        let found = fixture
            .app
            .clone()
            .oneshot(Request::builder().uri("/result/r1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);
        let result: ResultResponse = serde_json::from_value(body_json(found).await).unwrap();
        assert_eq!(result.id, "r1");
        assert_eq!(result.output, "2\n");

        let missing = fixture
            .app
            .oneshot(Request::builder().uri("/result/r2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_websocket_requires_connection_id() {
        let fixture = create_test_app(10);

        let response = fixture
            .app
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["error"],
            "Invalid request: connection_id is required"
        );
    }
}
