//! JSON/SSE HTTP facade over the RAG pipeline.
//!
//! Mirrors the ambient stack's own server module: an `AppState` clone-shared
//! across handlers, a typed `AppError` that renders as `{"error": {...}}`,
//! permissive CORS for the local developer-facing endpoints, and `axum::serve`
//! with graceful shutdown tied into the process [`crate::lifecycle`] flag.

mod routes;

pub mod metrics;

use crate::auth::AdminAuth;
use crate::chunker::Chunker;
use crate::completion::CompletionClient;
use crate::config::Config;
use crate::embedding::client::EmbeddingClient;
use crate::lifecycle::ShutdownFlag;
use crate::source::SourceCollector;
use crate::store::VectorStore;
use crate::updater::IncrementalUpdater;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<VectorStore>,
    pub embedding: Arc<EmbeddingClient>,
    pub completion: Arc<CompletionClient>,
    pub collector: Arc<SourceCollector>,
    pub chunker: Arc<Chunker>,
    pub updater: Arc<AsyncMutex<IncrementalUpdater>>,
    pub auth: Arc<AsyncRwLock<AdminAuth>>,
    pub metrics: Arc<Metrics>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

pub fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

pub fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Enforces Basic or Bearer auth on protected routes; returns 401 with
/// `WWW-Authenticate` on failure.
async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, AppError> {
    let unauthorized_response = || {
        let mut response = AppError {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized".to_string(),
            message: "authentication required".to_string(),
        }
        .into_response();
        response
            .headers_mut()
            .insert("WWW-Authenticate", "Basic realm=\"ragline\"".parse().unwrap());
        response
    };

    let Some(header) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        return Ok(unauthorized_response());
    };

    let credential = if let Some(token) = header.strip_prefix("Bearer ") {
        crate::auth::Credential::Bearer(token.to_string())
    } else if let Some(encoded) = header.strip_prefix("Basic ") {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let Ok(decoded) = STANDARD.decode(encoded) else {
            return Ok(unauthorized_response());
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return Ok(unauthorized_response());
        };
        let password = decoded.splitn(2, ':').nth(1).unwrap_or("").to_string();
        crate::auth::Credential::Basic(password)
    } else {
        return Ok(unauthorized_response());
    };

    let auth = state.auth.read().await;
    if auth.authenticate(&credential).is_err() {
        return Ok(unauthorized_response());
    }
    drop(auth);

    Ok(next.run(request).await)
}

pub async fn run_server(state: AppState, port: u16, shutdown: ShutdownFlag) -> anyhow::Result<()> {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let protected = Router::new()
        .route("/api/setup", get(routes::get_setup).post(routes::post_setup))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let app = Router::new()
        .route("/api/health", get(routes::health))
        .route("/api", get(routes::catalog))
        .route("/api/search", post(routes::search))
        .route("/api/embed", post(routes::embed))
        .route("/api/documents", get(routes::list_documents).post(routes::add_document))
        .route("/api/stats", get(routes::stats))
        .route("/api/metrics", get(routes::metrics_json))
        .route("/metrics", get(routes::metrics_prometheus))
        .route("/api/update", post(routes::update))
        .route("/api/chat", post(routes::chat))
        .route("/api/authenticate", post(routes::authenticate))
        .merge(protected)
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "http facade listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await?;

    Ok(())
}

async fn wait_for_shutdown(flag: ShutdownFlag) {
    while !flag.is_set() {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}
