
use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::chunker::{detect_content_type, Chunker};
use crate::database::{SearchResult, VectorDatabase, NONE_CHUNK_ID};
use crate::inference::{ChatMessage, CompletionProvider, DeltaStream, Embedder};
use crate::sources::{filter_related_sources, SourceCollector};
use crate::{RagError, Result};

const ATTACHMENT_START: &str = "[Attachment: ";
const ATTACHMENT_END: &str = "[/Attachment]";

fn default_temperature() -> f32 {
    0.5
}

/// A named attachment supplied alongside a chat request.
#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub name: Option<String>,
    pub content: String,
}

/// One chat exchange against the indexed corpus.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub sourceids: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

/// Assembles the bounded, ordered context for a chat query:
/// attachments, then full selected sources, then related sources, then
/// the surviving filtered chunks.
pub struct RetrievalPlanner {
    db: Arc<VectorDatabase>,
    chunker: Arc<Chunker>,
    embedder: Arc<dyn Embedder>,
    completion: Arc<dyn CompletionProvider>,
    collector: Arc<SourceCollector>,
    embedding_top_k: usize,
    max_full_sources: usize,
    max_related_per_source: usize,
    max_chunks: usize,
    max_context_tokens: usize,
}

impl RetrievalPlanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<VectorDatabase>,
        chunker: Arc<Chunker>,
        embedder: Arc<dyn Embedder>,
        completion: Arc<dyn CompletionProvider>,
        collector: Arc<SourceCollector>,
        embedding_top_k: usize,
        max_full_sources: usize,
        max_related_per_source: usize,
        max_chunks: usize,
        max_context_tokens: usize,
    ) -> Self {
        Self {
            db,
            chunker,
            embedder,
            completion,
            collector,
            embedding_top_k: embedding_top_k.max(1),
            max_full_sources,
            max_related_per_source,
            max_chunks: max_chunks.max(1),
            max_context_tokens,
        }
    }

    /// Plan the context and open the completion stream. The returned
    /// context is exactly what the completion was conditioned on, in
    /// order.
    pub async fn chat(&self, request: &ChatRequest) -> Result<(Vec<SearchResult>, DeltaStream)> {
        let (question, context) = self.plan_context(request).await?;

        let mut messages = request.messages.clone();
        if let Some(last) = messages.last_mut() {
            last.content = question;
        }

        let stream = self
            .completion
            .stream_completion(&messages, &context, request.temperature)
            .await?;
        Ok((context, stream))
    }

    /// Build the ranked, truncated context for `request`. Returns the
    /// question (attachment markers stripped) and the ordered results.
    pub async fn plan_context(
        &self,
        request: &ChatRequest,
    ) -> Result<(String, Vec<SearchResult>)> {
        let last = request
            .messages
            .last()
            .ok_or_else(|| RagError::BadRequest("messages must not be empty".to_string()))?;
        if last.role != "user" {
            return Err(RagError::BadRequest(
                "last message must have role 'user'".to_string(),
            ));
        }

        let (question, inline_attachment) = extract_inline_attachment(&last.content);

        // 1. Attachments.
        let mut context: Vec<SearchResult> = Vec::new();
        for attachment in &request.attachments {
            context.push(attachment_result(
                attachment.name.as_deref().unwrap_or("attachment"),
                &attachment.content,
            ));
        }
        if let Some(content) = &inline_attachment {
            context.push(attachment_result("attachment", content));
        }

        // 2. Chunk the question and gather ranked hits.
        let mut hits: Vec<SearchResult> = Vec::new();
        let mut rank: HashMap<String, f32> = HashMap::new();
        for chunk in self.chunker.chunk(&question, "", false) {
            let embedding = self.embedder.embed(&chunk.text).await?;
            let results = self.db.search(&embedding, self.embedding_top_k).await?;
            for result in results {
                *rank.entry(result.source_id.clone()).or_default() += result.similarity_score;
                hits.push(result);
            }
        }
        hits.sort_by(|a, b| {
            let ra = rank.get(&a.source_id).copied().unwrap_or_default();
            let rb = rank.get(&b.source_id).copied().unwrap_or_default();
            rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
        });

        // 3. Promote the top-ranked sources (plus explicit ones) to
        // full sources.
        let mut full_sources: Vec<String> = Vec::new();
        for hit in &hits {
            if full_sources.len() >= self.max_full_sources {
                break;
            }
            if !full_sources.contains(&hit.source_id) {
                full_sources.push(hit.source_id.clone());
            }
        }
        for source in &request.sourceids {
            if !full_sources.contains(source) {
                full_sources.push(source.clone());
            }
        }

        // Sources whose content actually made it into the context;
        // only these supersede their raw chunks.
        let mut covered: Vec<String> = Vec::new();
        for source in &full_sources {
            match self.collector.fetch(source).await {
                Ok(data) if !data.content.is_empty() => {
                    context.push(full_source_result(source, &data.content));
                    covered.push(source.clone());
                }
                Ok(_) => debug!("Full source {} is empty, skipped", source),
                Err(e) => warn!("Unable to fetch full source {}: {}", source, e),
            }
        }

        // 4. Related sources, deduped against the full-source set.
        let tracked: Vec<String> = self
            .db
            .get_tracked_files()
            .await?
            .into_iter()
            .map(|f| f.path)
            .collect();

        let mut related_sources: Vec<String> = Vec::new();
        for source in &full_sources {
            let mut taken = 0;
            for related in filter_related_sources(&tracked, source) {
                if taken >= self.max_related_per_source {
                    break;
                }
                if full_sources.contains(&related) || related_sources.contains(&related) {
                    continue;
                }
                match self.collector.fetch(&related).await {
                    Ok(data) if !data.content.is_empty() => {
                        context.push(full_source_result(&related, &data.content));
                        covered.push(related.clone());
                        related_sources.push(related);
                        taken += 1;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Unable to fetch related source {}: {}", related, e),
                }
            }
        }

        // 5. Surviving filtered chunks: drop anything a full or related
        // source already covers.
        for hit in hits {
            if covered.contains(&hit.source_id) {
                continue;
            }
            context.push(hit);
        }

        context.truncate(self.max_chunks);
        Ok((question, self.apply_token_budget(context)))
    }

    /// Keep the ordered context under the token budget. Entries that do
    /// not fit are skipped; the first entry is always kept. A zero
    /// budget means unlimited.
    fn apply_token_budget(&self, context: Vec<SearchResult>) -> Vec<SearchResult> {
        if self.max_context_tokens == 0 {
            return context;
        }

        let mut total = 0;
        let mut bounded = Vec::with_capacity(context.len());
        for result in context {
            let tokens = self.chunker.token_count(&result.content);
            if !bounded.is_empty() && total + tokens > self.max_context_tokens {
                debug!(
                    "Context token budget reached, dropping {} ({} tokens)",
                    result.source_id, tokens
                );
                continue;
            }
            total += tokens;
            bounded.push(result);
        }
        bounded
    }
}

/// Split an inline `[Attachment: …][/Attachment]` block out of the
/// question text.
fn extract_inline_attachment(content: &str) -> (String, Option<String>) {
    let Some(start) = content.find(ATTACHMENT_START) else {
        return (content.trim().to_string(), None);
    };

    let end = content
        .rfind(ATTACHMENT_END)
        .map(|pos| pos + ATTACHMENT_END.len())
        .unwrap_or(content.len());

    let attachment = content[start..end].trim().to_string();
    let question = content[..start].trim().to_string();
    (question, Some(attachment))
}

fn attachment_result(name: &str, content: &str) -> SearchResult {
    SearchResult {
        content: content.to_string(),
        source_id: name.to_string(),
        chunk_unit: "char".to_string(),
        chunk_type: detect_content_type(content, "").as_str().to_string(),
        chunk_id: NONE_CHUNK_ID,
        start: 0,
        end: content.len(),
        similarity_score: 1.0,
    }
}

fn full_source_result(source: &str, content: &str) -> SearchResult {
    SearchResult {
        content: content.to_string(),
        source_id: source.to_string(),
        chunk_unit: "char".to_string(),
        chunk_type: detect_content_type(content, source).as_str().to_string(),
        chunk_id: NONE_CHUNK_ID,
        start: 0,
        end: content.len(),
        similarity_score: 1.0,
    }
}
