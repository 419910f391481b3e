
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::StreamExt;
use url::Url;

use crate::database::SearchResult;
use crate::{RagError, Result};

/// Prompt template for context-grounded completions. `__CONTEXT__` and
/// `__QUESTION__` are substituted before the request is sent.
const QUERY_TEMPLATE: &str = "\
You're a helpful software developer assistant, please use the provided context to base your answers on
for user questions. Answer to the best of your knowledge. Keep your responses short and on point.
Context:
__CONTEXT__

Question:
__QUESTION__
";

/// One chat-format message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Produces dense vector embeddings for text.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }
}

/// Streams completion deltas for a chat exchange grounded in retrieved
/// context.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        context: &[SearchResult],
        temperature: f32,
    ) -> Result<DeltaStream>;
}

/// Typed client for the embedding endpoint.
///
/// Wire contract: POST `{"content": [text, ...], "model": "..."}` with
/// bearer auth; the response is an array aligned to the inputs where
/// `[i].embedding[0]` holds the vector.
pub struct EmbeddingClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl fmt::Debug for EmbeddingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingClient")
            .field("api_url", &self.api_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    content: &'a [String],
    #[serde(skip_serializing_if = "str::is_empty")]
    model: &'a str,
}

impl EmbeddingClient {
    pub fn new(api_url: &str, api_key: &str, model: &str, timeout_ms: u64) -> Result<Self> {
        Url::parse(api_url)
            .map_err(|_| RagError::Config(format!("Invalid embedding URL: {}", api_url)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| RagError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    async fn request_embeddings(&self, texts: &[String]) -> Result<Vec<f32>> {
        let body = EmbedRequest {
            content: texts,
            model: &self.model,
        };

        let mut request = self.client.post(&self.api_url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await.map_err(map_transport)?;
        let status = response.status();
        let text = response.text().await.map_err(map_transport)?;
        if !status.is_success() {
            return Err(RagError::ServerError {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| RagError::BadResponse(format!("invalid JSON: {}", e)))?;
        parse_embedding_response(&parsed, texts.len())
    }
}

/// Extract `response[0].embedding[0][..]` after validating the shape.
fn parse_embedding_response(response: &Value, expected_items: usize) -> Result<Vec<f32>> {
    let items = response
        .as_array()
        .filter(|a| a.len() == expected_items)
        .ok_or_else(|| {
            RagError::BadResponse("unexpected embedding response format".to_string())
        })?;

    let embedding = items
        .first()
        .and_then(|item| item.get("embedding"))
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .and_then(Value::as_array)
        .ok_or_else(|| RagError::BadResponse("invalid embedding structure".to_string()))?;

    embedding
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| RagError::BadResponse("non-numeric embedding value".to_string()))
        })
        .collect()
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        self.request_embeddings(&texts).await
    }
}

/// Typed client for an OpenAI-compatible streaming chat-completions
/// endpoint.
pub struct CompletionClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl fmt::Debug for CompletionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionClient")
            .field("api_url", &self.api_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

impl CompletionClient {
    pub fn new(api_url: &str, api_key: &str, model: &str, timeout_ms: u64) -> Result<Self> {
        Url::parse(api_url)
            .map_err(|_| RagError::Config(format!("Invalid completion URL: {}", api_url)))?;

        // Connect timeout only; the stream itself may outlive any
        // reasonable total-request budget.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| RagError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    /// Expand the prompt template and rewrite the final user turn with
    /// the retrieved context.
    fn build_messages(messages: &[ChatMessage], context: &[SearchResult]) -> Vec<ChatMessage> {
        let question = messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let mut joined = String::new();
        for result in context {
            joined.push_str(&result.content);
            joined.push_str("\n\n");
        }

        let prompt = QUERY_TEMPLATE
            .replace("__CONTEXT__", &joined)
            .replace("__QUESTION__", &question);

        let mut rewritten = messages.to_vec();
        if let Some(last) = rewritten.last_mut() {
            last.content = prompt;
        }
        rewritten
    }
}

#[async_trait]
impl CompletionProvider for CompletionClient {
    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        context: &[SearchResult],
        temperature: f32,
    ) -> Result<DeltaStream> {
        let rewritten = Self::build_messages(messages, context);
        let body = CompletionRequest {
            model: &self.model,
            messages: &rewritten,
            temperature,
            stream: true,
        };

        let mut request = self
            .client
            .post(&self.api_url)
            .header("Accept", "text/event-stream")
            .json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await.map_err(map_transport)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::ServerError {
                status: status.as_u16(),
                body: text,
            });
        }

        let events = response.bytes_stream().eventsource();
        let deltas = events.filter_map(|event| match event {
            Ok(event) => parse_sse_event(&event.data),
            Err(e) => Some(Err(RagError::Transport(format!("SSE read error: {}", e)))),
        });
        Ok(Box::pin(deltas))
    }
}

/// Parse one SSE data frame into a delta. `[DONE]` ends the stream; a
/// delta without `content` falls back to `reasoning_content`, and a
/// delta with neither yields nothing.
fn parse_sse_event(data: &str) -> Option<Result<String>> {
    if data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            let delta = chunk.choices.first().map(|c| &c.delta)?;
            let content = delta
                .content
                .as_deref()
                .or(delta.reasoning_content.as_deref())
                .unwrap_or_default();
            if content.is_empty() {
                None
            } else {
                Some(Ok(content.to_owned()))
            }
        }
        Err(e) => Some(Err(RagError::BadResponse(format!(
            "failed to parse SSE data: {}",
            e
        )))),
    }
}

fn map_transport(e: reqwest::Error) -> RagError {
    RagError::Transport(e.to_string())
}
