//! Route handlers for the HTTP facade. Each handler increments the shared
//! metrics counters (even on error) and translates domain errors into the
//! facade's JSON error contract.

use super::{bad_request, internal_error, unauthorized, AppError, AppState};
use crate::auth::Credential;
use crate::completion::{CompletionClient, CompletionSink};
use crate::embedding::client::EmbedKind;
use crate::models::{Attachment, ChatMessage, FileMetadata};
use crate::planner::RetrievalPlanner;
use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
pub struct CatalogResponse {
    endpoints: Vec<&'static str>,
}

pub async fn catalog() -> Json<CatalogResponse> {
    Json(CatalogResponse {
        endpoints: vec![
            "GET /api/health",
            "POST /api/search",
            "POST /api/embed",
            "GET /api/documents",
            "POST /api/documents",
            "GET /api/stats",
            "GET /api/metrics",
            "GET /metrics",
            "POST /api/update",
            "POST /api/chat",
            "GET/POST /api/setup",
            "POST /api/authenticate",
        ],
    })
}

#[derive(Deserialize)]
pub struct SearchRequest {
    query: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    5
}

pub async fn search(State(state): State<AppState>, Json(req): Json<SearchRequest>) -> Result<Response, AppError> {
    let timer = state.metrics.start_request("search");
    if req.query.trim().is_empty() {
        state.metrics.record_error();
        return Err(bad_request("query must not be empty"));
    }

    let result = async {
        let vectors = state.embedding.encode(&[req.query.clone()], EmbedKind::Query).await?;
        let query_vec = vectors.first().ok_or_else(|| anyhow::anyhow!("no embedding returned for query"))?;
        state.store.search(query_vec, req.top_k).await.map_err(anyhow::Error::from)
    }
    .await;

    state.metrics.finish(timer);
    match result {
        Ok(results) => Ok(Json(results).into_response()),
        Err(err) => {
            state.metrics.record_error();
            Err(internal_error(err.to_string()))
        }
    }
}

#[derive(Deserialize)]
pub struct EmbedRequest {
    text: String,
}

#[derive(Serialize)]
pub struct EmbedEntry {
    embedding: Vec<f32>,
    dimension: usize,
}

pub async fn embed(State(state): State<AppState>, Json(req): Json<EmbedRequest>) -> Result<Response, AppError> {
    let timer = state.metrics.start_request("embed");
    if req.text.trim().is_empty() {
        state.metrics.record_error();
        return Err(bad_request("text must not be empty"));
    }

    let chunks = state.chunker.chunk(&req.text, "inline:/api/embed");
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();

    let result = state.embedding.encode(&texts, EmbedKind::Document).await;
    state.metrics.finish(timer);

    match result {
        Ok(vectors) => {
            let entries: Vec<EmbedEntry> = vectors
                .into_iter()
                .map(|v| EmbedEntry { dimension: v.len(), embedding: v })
                .collect();
            Ok(Json(entries).into_response())
        }
        Err(err) => {
            state.metrics.record_error();
            Err(internal_error(err.to_string()))
        }
    }
}

#[derive(Deserialize)]
pub struct AddDocumentRequest {
    content: String,
    source_id: String,
}

#[derive(Serialize)]
pub struct AddDocumentResponse {
    status: &'static str,
    chunks_added: usize,
}

pub async fn add_document(State(state): State<AppState>, Json(req): Json<AddDocumentRequest>) -> Result<Response, AppError> {
    let timer = state.metrics.start_request("documents");
    if req.content.trim().is_empty() {
        state.metrics.record_error();
        return Err(bad_request("content must not be empty"));
    }

    let result = async {
        let chunks = state.chunker.chunk(&req.content, &req.source_id);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = state.embedding.encode(&texts, EmbedKind::Document).await?;
        state.store.add_documents(&chunks, &vectors).await.map_err(anyhow::Error::from)?;
        state
            .store
            .upsert_file_metadata(&FileMetadata {
                path: req.source_id.clone(),
                last_modified: crate::models::now_unix(),
                file_size: req.content.len() as i64,
                num_lines: req.content.lines().count() as i64,
            })
            .await
            .map_err(anyhow::Error::from)?;
        Ok::<usize, anyhow::Error>(chunks.len())
    }
    .await;

    state.metrics.finish(timer);
    match result {
        Ok(chunks_added) => Ok(Json(AddDocumentResponse { status: "ok", chunks_added }).into_response()),
        Err(err) => {
            state.metrics.record_error();
            Err(internal_error(err.to_string()))
        }
    }
}

pub async fn list_documents(State(state): State<AppState>) -> Result<Response, AppError> {
    let timer = state.metrics.start_request("documents");
    let result = state.store.get_tracked_files().await;
    state.metrics.finish(timer);
    match result {
        Ok(files) => Ok(Json(files).into_response()),
        Err(err) => {
            state.metrics.record_error();
            Err(internal_error(err.to_string()))
        }
    }
}

pub async fn stats(State(state): State<AppState>) -> Result<Response, AppError> {
    match state.store.get_stats().await {
        Ok(stats) => Ok(Json(stats).into_response()),
        Err(err) => {
            state.metrics.record_error();
            Err(internal_error(err.to_string()))
        }
    }
}

pub async fn metrics_json(State(state): State<AppState>) -> Json<crate::http::metrics::MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

pub async fn metrics_prometheus(State(state): State<AppState>) -> Response {
    ([("content-type", "text/plain; version=0.0.4")], state.metrics.render_prometheus()).into_response()
}

pub async fn update(State(state): State<AppState>) -> Result<Response, AppError> {
    let timer = state.metrics.start_request("update");
    let result = async {
        let mut updater = state.updater.lock().await;
        let info = updater.detect_changes(&state.store).await?;
        updater.apply(&info, &state.store).await
    }
    .await;
    state.metrics.finish(timer);

    match result {
        Ok(updated) => Ok(Json(serde_json::json!({ "updated": updated })).into_response()),
        Err(err) => {
            state.metrics.record_error();
            Err(internal_error(err.to_string()))
        }
    }
}

#[derive(Deserialize)]
pub struct ChatRequest {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    sourceids: Vec<String>,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<usize>,
    #[serde(default)]
    targetapi: Option<String>,
}

struct ChannelSink(mpsc::UnboundedSender<String>);

impl CompletionSink for ChannelSink {
    fn on_token(&mut self, token: &str) {
        let _ = self.0.send(token.to_string());
    }
}

pub async fn chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Result<Response, AppError> {
    let timer = state.metrics.start_request("chat");
    let question = req
        .messages
        .last()
        .map(|m| m.content.clone())
        .ok_or_else(|| bad_request("messages must not be empty"))?;

    let api = req
        .targetapi
        .as_deref()
        .and_then(|id| state.config.generation.apis.iter().find(|a| a.id == id))
        .or_else(|| state.config.generation.current())
        .cloned();
    let Some(api) = api else {
        state.metrics.record_error();
        return Err(bad_request("no generation API configured"));
    };

    let planner = RetrievalPlanner::new(&state.store, &state.collector, &state.embedding, &state.config.generation);
    let results = planner
        .plan(&question, &req.attachments, &req.sourceids)
        .await
        .map_err(|e| {
            state.metrics.record_error();
            internal_error(e.to_string())
        })?;

    let reply_budget = req.max_tokens.unwrap_or(state.config.generation.default_max_tokens);
    let context_budget = CompletionClient::context_budget(&api, state.config.generation.max_context_tokens, reply_budget);
    let context = state.completion.build_context(&results, &state.config.generation.prepend_label_format, context_budget);
    let prompt = CompletionClient::build_prompt(&context, &question);
    let temperature = req.temperature.or(Some(state.config.generation.default_temperature));

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let completion = state.completion.clone();
    let messages = req.messages.clone();
    let sources: Vec<String> = results.iter().map(|r| r.source_id.clone()).collect();

    let metrics = state.metrics.clone();
    tokio::spawn(async move {
        let mut sink = ChannelSink(tx.clone());
        let outcome = completion.stream(&api, &messages, &prompt, temperature, reply_budget, &mut sink).await;
        if outcome.is_err() {
            metrics.record_error();
        }
        let sources_event = serde_json::json!({ "type": "context_sources", "sources": sources });
        let _ = tx.send(format!("__RAGLINE_EVENT__{}", sources_event));
        let _ = tx.send("__RAGLINE_DONE__".to_string());
    });

    let body_stream = stream::unfold(rx, |mut rx| async move {
        let token = rx.recv().await?;
        let event = if let Some(event) = token.strip_prefix("__RAGLINE_EVENT__") {
            format!("data: {event}\n\n")
        } else if token == "__RAGLINE_DONE__" {
            "data: [DONE]\n\n".to_string()
        } else {
            let payload = serde_json::json!({ "content": token });
            format!("data: {payload}\n\n")
        };
        Some((Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(event)), rx))
    });

    state.metrics.finish(timer);

    Response::builder()
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(body_stream))
        .map_err(|e| internal_error(e.to_string()))
}

#[derive(Deserialize)]
pub struct AuthenticateRequest {
    password: String,
}

#[derive(Serialize)]
pub struct AuthenticateResponse {
    token: String,
}

pub async fn authenticate(State(state): State<AppState>, Json(req): Json<AuthenticateRequest>) -> Result<Response, AppError> {
    let auth = state.auth.read().await;
    match auth.authenticate(&Credential::Basic(req.password)) {
        Ok(token) => Ok(Json(AuthenticateResponse { token }).into_response()),
        Err(_) => Err(unauthorized("invalid credentials")),
    }
}

fn setup_snapshot(state: &AppState) -> serde_json::Value {
    serde_json::json!({
        "chunking": { "min_tokens": state.config.chunking.nof_min_tokens, "max_tokens": state.config.chunking.nof_max_tokens },
        "embedding_current_api": state.config.embedding.current_api,
        "generation_current_api": state.config.generation.current_api,
    })
}

pub async fn get_setup(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(setup_snapshot(&state))
}

/// Configuration is read-only while the server is running (edit the config
/// file and restart to change it), so this echoes the stored config back
/// rather than applying the submitted body — the auth layer has already
/// verified the caller before this handler runs.
pub async fn post_setup(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(setup_snapshot(&state))
}
