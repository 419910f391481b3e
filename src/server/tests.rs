use super::*;
use crate::config::{DatabaseConfig, DistanceMetric, Settings};
use crate::database::SearchResult;
use crate::inference::{ChatMessage, CompletionProvider, DeltaStream};
use async_trait::async_trait;
use tempfile::TempDir;

const DIM: usize = 4;
const KEYWORDS: [&str; 4] = ["alpha", "omega", "zeta", "delta"];

struct StubEmbedder;

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, text: &str) -> crate::Result<Vec<f32>> {
        let mut v: Vec<f32> = KEYWORDS
            .iter()
            .map(|k| text.matches(k).count() as f32 + 0.01)
            .collect();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter_mut().for_each(|x| *x /= norm);
        Ok(v)
    }
}

struct StubCompletion;

#[async_trait]
impl CompletionProvider for StubCompletion {
    async fn stream_completion(
        &self,
        _messages: &[ChatMessage],
        _context: &[SearchResult],
        _temperature: f32,
    ) -> crate::Result<DeltaStream> {
        Ok(Box::pin(tokio_stream::iter(vec![Ok("ok".to_string())])))
    }
}

async fn stub_state(dir: &TempDir) -> AppState {
    stub_state_with(dir, Arc::new(StubCompletion)).await
}

async fn stub_state_with(dir: &TempDir, completion: Arc<dyn CompletionProvider>) -> AppState {
    let mut settings = Settings::default();
    settings.database = DatabaseConfig {
        sqlite_path: dir.path().join("db.sqlite").to_string_lossy().into_owned(),
        index_path: dir.path().join("db.usearch").to_string_lossy().into_owned(),
        vector_dim: DIM,
        max_elements: 1000,
        distance_metric: DistanceMetric::L2,
    };
    settings.chunking.nof_min_tokens = 1;
    settings.chunking.nof_max_tokens = 100;

    let counter = Arc::new(TokenCounter::without_vocab());
    let chunker = Arc::new(Chunker::new(counter, &settings.chunking));
    let db = Arc::new(VectorDatabase::open(&settings.database).await.unwrap());
    let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder);
    let collector = Arc::new(SourceCollector::new(vec![], settings.files.clone()));

    let updater = Arc::new(Updater::new(
        Arc::clone(&db),
        Arc::clone(&chunker),
        Arc::clone(&embedder),
        Arc::clone(&collector),
        8,
        String::new(),
        false,
    ));
    let planner = Arc::new(RetrievalPlanner::new(
        Arc::clone(&db),
        Arc::clone(&chunker),
        Arc::clone(&embedder),
        completion,
        Arc::clone(&collector),
        3,
        1,
        2,
        5,
        100_000,
    ));

    AppState {
        settings: Arc::new(settings),
        db,
        chunker,
        embedder,
        collector,
        updater,
        planner,
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let Json(body) = health().await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn api_index_lists_endpoints() {
    let Json(body) = api_index().await;
    assert!(body["endpoints"]["GET /api/health"].is_string());
    assert!(body["endpoints"]["POST /api/chat"].is_string());
}

#[tokio::test]
async fn stats_on_empty_store() {
    let dir = TempDir::new().unwrap();
    let state = stub_state(&dir).await;

    let Json(body) = get_stats(State(state)).await.unwrap();
    assert_eq!(body["total_chunks"], 0);
    assert_eq!(body["active_count"], 0);
    assert_eq!(body["deleted_count"], 0);
}

#[tokio::test]
async fn add_document_then_search() {
    let dir = TempDir::new().unwrap();
    let state = stub_state(&dir).await;

    let Json(added) = add_document(
        State(state.clone()),
        Json(AddDocumentPayload {
            content: "alpha beta gamma".to_string(),
            source_id: "doc1.md".to_string(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(added["status"], "success");
    assert_eq!(added["chunks_added"], 1);

    let Json(results) = search(
        State(state),
        Json(SearchPayload {
            query: "alpha".to_string(),
            top_k: None,
        }),
    )
    .await
    .unwrap();

    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["source_id"], "doc1.md");
    assert!(results[0]["similarity_score"].as_f64().unwrap() >= 0.5);
}

#[tokio::test]
async fn documents_lists_tracked_files() {
    let dir = TempDir::new().unwrap();
    let state = stub_state(&dir).await;

    add_document(
        State(state.clone()),
        Json(AddDocumentPayload {
            content: "alpha".to_string(),
            source_id: "tracked.md".to_string(),
        }),
    )
    .await
    .unwrap();

    let Json(body) = list_documents(State(state)).await.unwrap();
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["path"], "tracked.md");
}

#[tokio::test]
async fn embed_endpoint_returns_dimension() {
    let dir = TempDir::new().unwrap();
    let state = stub_state(&dir).await;

    let Json(body) = embed_text(
        State(state),
        Json(EmbedPayload {
            text: "alpha".to_string(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(body["dimension"], DIM);
    assert_eq!(body["embedding"].as_array().unwrap().len(), DIM);
}

#[tokio::test]
async fn update_endpoint_reports_count() {
    let dir = TempDir::new().unwrap();
    let state = stub_state(&dir).await;

    let Json(body) = trigger_update(State(state)).await.unwrap();
    assert_eq!(body["status"], "updated");
    assert_eq!(body["nof_files"], 0);
}

#[test]
fn error_status_mapping() {
    let cases = [
        (RagError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
        (
            RagError::DimensionMismatch {
                actual: 2,
                expected: 4,
            },
            StatusCode::BAD_REQUEST,
        ),
        (RagError::NotFound("x".into()), StatusCode::NOT_FOUND),
        (RagError::Transport("x".into()), StatusCode::BAD_GATEWAY),
        (
            RagError::ServerError {
                status: 500,
                body: "x".into(),
            },
            StatusCode::BAD_GATEWAY,
        ),
        (RagError::Storage("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
    ];
    for (err, expected) in cases {
        let response = ApiError(err).into_response();
        assert_eq!(response.status(), expected);
    }
}

#[tokio::test]
async fn chat_rejects_non_user_last_message() {
    let dir = TempDir::new().unwrap();
    let state = stub_state(&dir).await;

    let request = ChatRequest {
        messages: vec![ChatMessage {
            role: "assistant".to_string(),
            content: "hi".to_string(),
        }],
        attachments: vec![],
        sourceids: vec![],
        temperature: 0.5,
    };
    let response = chat(State(state), Json(request)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Completion stub that emits one delta every 100 ms until dropped and
/// reports its drop through a shared flag.
struct SlowCompletion {
    dropped: Arc<std::sync::atomic::AtomicBool>,
}

struct SetOnDrop(Arc<std::sync::atomic::AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

#[async_trait]
impl CompletionProvider for SlowCompletion {
    async fn stream_completion(
        &self,
        _messages: &[ChatMessage],
        _context: &[SearchResult],
        _temperature: f32,
    ) -> crate::Result<DeltaStream> {
        let guard = SetOnDrop(Arc::clone(&self.dropped));
        let deltas = futures::stream::unfold((0u32, guard), |(n, guard)| async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            Some((
                Ok::<String, RagError>(format!("chunk {}", n)),
                (n + 1, guard),
            ))
        });
        Ok(Box::pin(deltas))
    }
}

#[tokio::test]
async fn chat_client_disconnect_stops_streaming_without_persisting() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let dir = TempDir::new().unwrap();
    let dropped = Arc::new(AtomicBool::new(false));
    let state = stub_state_with(
        &dir,
        Arc::new(SlowCompletion {
            dropped: Arc::clone(&dropped),
        }),
    )
    .await;

    add_document(
        State(state.clone()),
        Json(AddDocumentPayload {
            content: "alpha beta".to_string(),
            source_id: "doc1.md".to_string(),
        }),
    )
    .await
    .unwrap();
    let before = state.db.get_stats().await.unwrap();

    let request = ChatRequest {
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: "alpha?".to_string(),
        }],
        attachments: vec![],
        sourceids: vec![],
        temperature: 0.5,
    };
    let response = chat(State(state.clone()), Json(request)).await;
    assert_eq!(response.status(), StatusCode::OK);

    // Read one delta, then disconnect by dropping the response body.
    let mut body = response.into_body().into_data_stream();
    let first = tokio::time::timeout(std::time::Duration::from_secs(2), body.next())
        .await
        .expect("no delta within two seconds");
    assert!(first.is_some());
    drop(body);

    // The upstream completion stream must be gone within one second.
    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while !dropped.load(Ordering::Relaxed) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("completion stream still alive one second after disconnect");

    // Chat is stateless with respect to the store.
    let after = state.db.get_stats().await.unwrap();
    assert_eq!(before, after);
}

#[test]
fn disconnect_guard_reports_cancelled() {
    assert!(matches!(
        DisconnectGuard::interruption(),
        RagError::Cancelled(_)
    ));
}

#[tokio::test]
async fn chat_streams_sse() {
    let dir = TempDir::new().unwrap();
    let state = stub_state(&dir).await;

    add_document(
        State(state.clone()),
        Json(AddDocumentPayload {
            content: "alpha beta".to_string(),
            source_id: "doc1.md".to_string(),
        }),
    )
    .await
    .unwrap();

    let request = ChatRequest {
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: "alpha?".to_string(),
        }],
        attachments: vec![],
        sourceids: vec![],
        temperature: 0.5,
    };
    let response = chat(State(state), Json(request)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.starts_with("text/event-stream"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("data: {\"content\":\"ok\"}"));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}
