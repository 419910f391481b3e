use serde::Serialize;
use sqlx::FromRow;

/// Sentinel label for transient results with no underlying row, e.g.
/// full sources fetched by the retrieval planner.
pub const NONE_CHUNK_ID: u64 = u64::MAX;

/// One persisted chunk row.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ChunkRow {
    pub id: i64,
    pub content: String,
    pub source_id: String,
    pub start_pos: i64,
    pub end_pos: i64,
    pub token_count: i64,
    pub unit: String,
    pub chunk_type: String,
}

/// One tracked source file, used for change detection.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct FileMetadata {
    pub path: String,
    pub last_modified: i64,
    pub file_size: i64,
}

/// A ranked retrieval hit. Produced by the store; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub content: String,
    pub source_id: String,
    pub chunk_unit: String,
    pub chunk_type: String,
    pub chunk_id: u64,
    pub start: usize,
    pub end: usize,
    pub similarity_score: f32,
}

/// Store totals and per-source/per-type breakdowns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct DatabaseStats {
    pub total_chunks: u64,
    pub vector_count: u64,
    pub deleted_count: u64,
    pub active_count: u64,
    pub sources: Vec<(String, u64)>,
    pub types: Vec<(String, u64)>,
}

impl ChunkRow {
    pub fn into_search_result(self, similarity_score: f32) -> SearchResult {
        SearchResult {
            content: self.content,
            source_id: self.source_id,
            chunk_unit: self.unit,
            chunk_type: self.chunk_type,
            chunk_id: self.id as u64,
            start: self.start_pos.max(0) as usize,
            end: self.end_pos.max(0) as usize,
            similarity_score,
        }
    }
}
