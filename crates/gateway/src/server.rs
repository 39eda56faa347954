//! Axum-based HTTP server for the chat-completion surface.

use axum::{
    extract::{Json, Query, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use metrics_exporter_prometheus::PrometheusHandle;

use capgraph_core::{
    config::ServerConfig,
    types::{CapabilityDescriptor, ChatCompletionRequest},
    Error, Result,
};

use crate::service::ChatService;
use crate::streaming::DONE_SENTINEL;

/// Gateway server.
pub struct GatewayServer {
    config: ServerConfig,
    service: Arc<ChatService>,
    metrics_handle: Option<PrometheusHandle>,
}

impl GatewayServer {
    pub fn new(config: ServerConfig, service: Arc<ChatService>) -> Self {
        Self {
            config,
            service,
            metrics_handle: None,
        }
    }

    /// Expose `GET /metrics` from this handle.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Build the Axum router.
    pub fn build_router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/v1/capabilities", get(capabilities_handler))
            .route("/v1/capabilities/reload", post(reload_handler))
            .route("/v1/chat/completions", post(chat_handler))
            .with_state(self.service.clone());

        if let Some(handle) = &self.metrics_handle {
            let handle = handle.clone();
            router = router.route("/metrics", get(move || async move { handle.render() }));
        }

        router
            .layer(middleware::from_fn(track_metrics))
            .layer(self.cors_layer())
            .layer(TraceLayer::new_for_http())
    }

    fn cors_layer(&self) -> CorsLayer {
        let origins = &self.config.allowed_origins;
        let allow_origin = if origins.is_empty() || origins.iter().any(|o| o == "*") {
            AllowOrigin::from(Any)
        } else {
            AllowOrigin::list(origins.iter().filter_map(|o| match HeaderValue::from_str(o) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                    None
                }
            }))
        };
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods(Any)
            .allow_headers(Any)
    }

    /// Run the server.
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::internal(format!("Failed to bind {}: {}", addr, e)))?;

        tracing::info!(addr = %addr, "Gateway server starting");

        axum::serve(listener, self.build_router())
            .await
            .map_err(|e| Error::internal(format!("Server error: {}", e)))?;

        Ok(())
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Default, Deserialize)]
struct CapabilityQuery {
    context: Option<String>,
    group: Option<String>,
}

#[derive(Debug, Serialize)]
struct CapabilityList {
    object: &'static str,
    data: Vec<CapabilityDescriptor>,
}

/// Error body returned by the HTTP layer.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    /// The turn ended in the error terminal.
    TurnFailed(String),
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        if e.is_client_error() {
            ApiError::BadRequest(e.to_string())
        } else {
            ApiError::Internal(e.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "invalid_request_error", m),
            ApiError::TurnFailed(m) => (StatusCode::INTERNAL_SERVER_ERROR, "turn_failed", m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", m),
        };
        (status, Json(json!({"error": {"message": message, "type": kind}}))).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn capabilities_handler(
    State(service): State<Arc<ChatService>>,
    Query(query): Query<CapabilityQuery>,
) -> impl IntoResponse {
    let data = service
        .capabilities(query.context.as_deref(), query.group.as_deref())
        .await;
    Json(CapabilityList { object: "list", data })
}

async fn reload_handler(State(service): State<Arc<ChatService>>) -> std::result::Result<impl IntoResponse, ApiError> {
    let snapshot = service.reload().await?;
    Ok(Json(json!({"status": "reloaded", "capabilities": snapshot.len()})))
}

async fn chat_handler(
    State(service): State<Arc<ChatService>>,
    Json(request): Json<ChatCompletionRequest>,
) -> std::result::Result<Response, ApiError> {
    let stream = request.stream;
    let reply = service.handle(request).await?;

    if let Some(error) = reply.error {
        return Err(ApiError::TurnFailed(error));
    }

    let responder = &service.context().streaming;
    if !stream {
        return Ok(Json(responder.envelope(&reply.model, reply.message)).into_response());
    }

    let frames = responder.stream(&reply.model, &reply.message);
    let events = async_stream::stream! {
        futures::pin_mut!(frames);
        while let Some(frame) = frames.next().await {
            match Event::default().json_data(&frame) {
                Ok(event) => yield Ok::<_, Infallible>(event),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode stream frame");
                    break;
                }
            }
        }
        yield Ok(Event::default().data(DONE_SENTINEL));
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()).into_response())
}

async fn track_metrics(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    capgraph_governance::track_request(&method, &path, response.status().as_u16(), start.elapsed().as_secs_f64());
    response
}
