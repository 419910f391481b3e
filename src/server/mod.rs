#[cfg(test)]
mod tests;

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::{future, stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::chunker::{clean_text_for_embedding, Chunker};
use crate::config::Settings;
use crate::database::VectorDatabase;
use crate::indexer::Updater;
use crate::inference::{CompletionClient, Embedder, EmbeddingClient};
use crate::retrieval::{ChatRequest, RetrievalPlanner};
use crate::sources::SourceCollector;
use crate::tokenizer::TokenCounter;
use crate::{RagError, Result};

/// Shared application state; components are wired once at startup.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: Arc<VectorDatabase>,
    pub chunker: Arc<Chunker>,
    pub embedder: Arc<dyn Embedder>,
    pub collector: Arc<SourceCollector>,
    pub updater: Arc<Updater>,
    pub planner: Arc<RetrievalPlanner>,
}

impl AppState {
    /// Construct every component from settings and open the store.
    pub async fn initialize(settings: Settings) -> Result<Self> {
        let counter = Arc::new(TokenCounter::new(&settings.tokenizer.config_path));
        let chunker = Arc::new(Chunker::new(counter, &settings.chunking));

        let db = Arc::new(VectorDatabase::open(&settings.database).await?);

        let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingClient::new(
            &settings.embedding.api_url,
            &settings.embedding.api_key,
            &settings.embedding.model,
            settings.embedding.timeout_ms,
        )?);
        let completion = Arc::new(CompletionClient::new(
            &settings.generation.api_url,
            &settings.generation.api_key,
            &settings.generation.model,
            settings.generation.timeout_ms,
        )?);

        let collector = Arc::new(SourceCollector::new(
            settings.sources.clone(),
            settings.files.clone(),
        ));

        let updater = Arc::new(Updater::new(
            Arc::clone(&db),
            Arc::clone(&chunker),
            Arc::clone(&embedder),
            Arc::clone(&collector),
            settings.embedding.batch_size,
            settings.embedding.prepend_phrase.clone(),
            settings.chunking.semantic,
        ));

        let planner = Arc::new(RetrievalPlanner::new(
            Arc::clone(&db),
            Arc::clone(&chunker),
            Arc::clone(&embedder),
            completion,
            Arc::clone(&collector),
            settings.embedding.top_k,
            settings.generation.max_full_sources,
            settings.generation.max_related_per_source,
            settings.generation.max_chunks,
            settings.generation.max_context_tokens,
        ));

        Ok(Self {
            settings: Arc::new(settings),
            db,
            chunker,
            embedder,
            collector,
            updater,
            planner,
        })
    }
}

#[derive(Debug)]
struct ApiError(RagError);

impl From<RagError> for ApiError {
    fn from(e: RagError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RagError::BadRequest(_)
            | RagError::DimensionMismatch { .. }
            | RagError::BadResponse(_)
            | RagError::Config(_) => StatusCode::BAD_REQUEST,
            RagError::NotFound(_) => StatusCode::NOT_FOUND,
            RagError::Transport(_) | RagError::ServerError { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api", get(api_index))
        .route("/api/health", get(health))
        .route("/api/stats", get(get_stats))
        .route("/api/documents", get(list_documents).post(add_document))
        .route("/api/search", post(search))
        .route("/api/embed", post(embed_text))
        .route("/api/update", post(trigger_update))
        .route("/api/chat", post(chat))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until Ctrl-C.
pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Starting HTTP API server on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Server stopping");
        })
        .await?;
    Ok(())
}

async fn api_index() -> Json<Value> {
    Json(json!({
        "name": "coderag API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "GET /api/health": "Health check",
            "GET /api/stats": "Database statistics",
            "GET /api/documents": "Tracked files",
            "POST /api/search": "Semantic search",
            "POST /api/embed": "Generate embeddings",
            "POST /api/documents": "Add a document",
            "POST /api/update": "Trigger manual update",
            "POST /api/chat": "Chat with context (streaming)",
        }
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let stats = state.db.get_stats().await?;
    let sources: serde_json::Map<String, Value> = stats
        .sources
        .into_iter()
        .map(|(source, count)| (source, json!(count)))
        .collect();
    let types: serde_json::Map<String, Value> = stats
        .types
        .into_iter()
        .map(|(chunk_type, count)| (chunk_type, json!(count)))
        .collect();

    Ok(Json(json!({
        "total_chunks": stats.total_chunks,
        "vector_count": stats.vector_count,
        "deleted_count": stats.deleted_count,
        "active_count": stats.active_count,
        "sources": sources,
        "types": types,
    })))
}

async fn list_documents(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let files = state.db.get_tracked_files().await?;
    let entries: Vec<Value> = files
        .into_iter()
        .map(|f| {
            json!({
                "path": f.path,
                // Stored at nanosecond resolution; report unix seconds.
                "lastModified": f.last_modified / 1_000_000_000,
                "size": f.file_size,
            })
        })
        .collect();
    Ok(Json(json!(entries)))
}

#[derive(Deserialize)]
struct SearchPayload {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

async fn search(
    State(state): State<AppState>,
    Json(payload): Json<SearchPayload>,
) -> ApiResult<Json<Value>> {
    let embedding = state.embedder.embed(&payload.query).await?;
    let results = state
        .db
        .search(&embedding, payload.top_k.unwrap_or(5))
        .await?;

    let entries: Vec<Value> = results
        .into_iter()
        .map(|r| {
            json!({
                "content": r.content,
                "source_id": r.source_id,
                "chunk_type": r.chunk_type,
                "chunk_unit": r.chunk_unit,
                "chunk_id": r.chunk_id,
                "similarity_score": r.similarity_score,
                "start_pos": r.start,
                "end_pos": r.end,
            })
        })
        .collect();
    Ok(Json(json!(entries)))
}

#[derive(Deserialize)]
struct EmbedPayload {
    text: String,
}

async fn embed_text(
    State(state): State<AppState>,
    Json(payload): Json<EmbedPayload>,
) -> ApiResult<Json<Value>> {
    let embedding = state.embedder.embed(&payload.text).await?;
    Ok(Json(json!({
        "embedding": embedding,
        "dimension": embedding.len(),
    })))
}

#[derive(Deserialize)]
struct AddDocumentPayload {
    content: String,
    source_id: String,
}

async fn add_document(
    State(state): State<AppState>,
    Json(payload): Json<AddDocumentPayload>,
) -> ApiResult<Json<Value>> {
    let chunks = state
        .chunker
        .chunk(&payload.content, &payload.source_id, state.settings.chunking.semantic);

    let prepend = &state.settings.embedding.prepend_phrase;
    let mut embeddings = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        let cleaned = clean_text_for_embedding(&chunk.text, prepend);
        embeddings.push(state.embedder.embed(&cleaned).await?);
    }

    let ids = state.db.add_documents(&chunks, &embeddings).await?;
    state.db.persist().await?;

    Ok(Json(json!({
        "status": "success",
        "chunks_added": ids.len(),
    })))
}

async fn trigger_update(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let touched = state.updater.update().await?;
    Ok(Json(json!({
        "status": "updated",
        "nof_files": touched,
    })))
}

/// Flags a chat stream that was dropped before its terminator ran,
/// i.e. the client disconnected mid-stream.
struct DisconnectGuard {
    finished: bool,
}

impl DisconnectGuard {
    fn new() -> Self {
        Self { finished: false }
    }

    fn finish(&mut self) {
        self.finished = true;
    }

    fn interruption() -> RagError {
        RagError::Cancelled("chat stream dropped before completion".to_string())
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!("{}", Self::interruption());
        }
    }
}

/// Streaming chat: SSE events `data: {"content": …}` terminated by
/// `data: [DONE]`. A mid-stream failure emits one error event before
/// the terminator. A client disconnect drops the response body, which
/// drops the upstream completion request with it; chat never writes to
/// the store, so nothing partial persists.
async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Response {
    let (_context, deltas) = match state.planner.chat(&request).await {
        Ok(planned) => planned,
        Err(e) => {
            error!("Chat request failed: {}", e);
            return ApiError(e).into_response();
        }
    };

    let mut guard = DisconnectGuard::new();
    let events = deltas
        .scan(false, |errored, delta| {
            if *errored {
                return future::ready(None);
            }
            let event = match delta {
                Ok(content) => Event::default().data(json!({ "content": content }).to_string()),
                Err(e) => {
                    *errored = true;
                    Event::default().data(json!({ "error": e.to_string() }).to_string())
                }
            };
            future::ready(Some(Ok::<Event, Infallible>(event)))
        })
        .chain(stream::once(async move {
            guard.finish();
            Ok::<Event, Infallible>(Event::default().data("[DONE]"))
        }));

    Sse::new(events).into_response()
}
