mod index;
pub mod models;
pub mod queries;


use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::chunker::Chunk;
use crate::config::DatabaseConfig;
use crate::{RagError, Result};

use index::AnnIndex;
pub use models::{ChunkRow, DatabaseStats, FileMetadata, SearchResult, NONE_CHUNK_ID};

pub type DbPool = Pool<Sqlite>;

/// Hybrid vector store: a SQLite metadata store paired with an HNSW
/// index keyed by chunk row id. Owns chunk rows, file metadata, and the
/// index; all mutation goes through this guarded API.
pub struct VectorDatabase {
    pool: DbPool,
    index: RwLock<AnnIndex>,
    dim: usize,
}

impl VectorDatabase {
    /// Open (or create) the store described by `config` and reconcile
    /// the two halves.
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.sqlite_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::query(include_str!("migrations/001_initial_schema.sql"))
            .execute(&pool)
            .await?;
        debug!("Database migrations completed");

        let ann = AnnIndex::open(
            Path::new(&config.index_path),
            config.vector_dim,
            config.distance_metric,
            config.max_elements,
        )?;

        let db = Self {
            pool,
            index: RwLock::new(ann),
            dim: config.vector_dim,
        };
        db.reconcile_on_startup().await?;
        Ok(db)
    }

    /// Sanity pass over the two halves: rows without a vector are
    /// reported (search cannot reach them until re-embedded); vectors
    /// without a row force an index rebuild from live rows.
    async fn reconcile_on_startup(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let row_ids = queries::all_chunk_ids(&mut conn).await?;
        drop(conn);

        let mut index = self.index.write().await;
        let matched: Vec<u64> = row_ids
            .iter()
            .map(|&id| id as u64)
            .filter(|&key| index.contains(key))
            .collect();

        let missing_vectors = row_ids.len() - matched.len();
        if missing_vectors > 0 {
            warn!(
                "{} chunk rows have no vector in the index; run `embed` to rebuild them",
                missing_vectors
            );
        }

        let orphans = index
            .vector_count()
            .saturating_sub(index.deleted_count())
            .saturating_sub(matched.len() as u64);
        if orphans > 0 {
            warn!(
                "{} vectors have no chunk row; rebuilding index from live rows",
                orphans
            );
            index.compact(&matched)?;
            index.save()?;
        }
        Ok(())
    }

    fn check_dim(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dim {
            return Err(RagError::DimensionMismatch {
                actual: embedding.len(),
                expected: self.dim,
            });
        }
        Ok(())
    }

    /// Insert one chunk with its embedding. Returns the assigned id.
    pub async fn add_document(&self, chunk: &Chunk, embedding: &[f32]) -> Result<i64> {
        let embeddings = [embedding.to_vec()];
        let ids = self
            .add_documents(std::slice::from_ref(chunk), &embeddings)
            .await?;
        Ok(ids[0])
    }

    /// Insert a batch atomically: either every row and vector becomes
    /// visible or none do. Id assignment follows input order.
    pub async fn add_documents(
        &self,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<Vec<i64>> {
        if chunks.len() != embeddings.len() {
            return Err(RagError::BadRequest(format!(
                "chunks and embeddings count mismatch: {} vs {}",
                chunks.len(),
                embeddings.len()
            )));
        }
        for embedding in embeddings {
            self.check_dim(embedding)?;
        }
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        // The write lock spans the transaction so readers never observe
        // a vector ahead of its committed row, or vice versa.
        let mut index = self.index.write().await;
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(chunks.len());

        for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
            let id = queries::insert_chunk(&mut tx, chunk).await?;
            self.upsert_source_metadata(&mut tx, &chunk.doc_uri).await?;
            index.add(id as u64, embedding)?;
            ids.push(id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Best-effort file metadata upsert; sources that are not files on
    /// disk (URLs, ad-hoc documents) get zeroed stat fields.
    async fn upsert_source_metadata(
        &self,
        conn: &mut sqlx::SqliteConnection,
        uri: &str,
    ) -> Result<()> {
        let (mtime, size) = crate::sources::stat_uri(uri);
        queries::upsert_file_metadata(conn, uri, mtime, size).await
    }

    /// Top-k nearest chunks, ordered by similarity descending.
    pub async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchResult>> {
        self.check_dim(query)?;

        let index = self.index.read().await;
        if index.active_count() == 0 {
            return Ok(Vec::new());
        }

        let hits = index.search(query, top_k)?;
        let mut conn = self.pool.acquire().await?;
        let mut results = Vec::with_capacity(hits.len());
        for (key, distance) in hits {
            match queries::get_chunk(&mut conn, key as i64).await? {
                Some(row) => results.push(row.into_search_result(index.similarity(distance))),
                // A label may outlive its row briefly between a delete
                // commit and its tombstone; drop it.
                None => debug!("Dropping search hit {} with no backing row", key),
            }
        }

        results.sort_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(results)
    }

    /// Search with post-filters: substring match on the source id and
    /// exact match on the chunk type. Issues a `2k` search and truncates.
    pub async fn search_with_filter(
        &self,
        query: &[f32],
        source_filter: &str,
        type_filter: &str,
        top_k: usize,
    ) -> Result<Vec<SearchResult>> {
        let candidates = self.search(query, top_k * 2).await?;
        Ok(candidates
            .into_iter()
            .filter(|r| source_filter.is_empty() || r.source_id.contains(source_filter))
            .filter(|r| type_filter.is_empty() || r.chunk_type == type_filter)
            .take(top_k)
            .collect())
    }

    /// Delete all chunks for a source; their vectors are tombstoned.
    /// Returns the number of deleted rows.
    pub async fn delete_documents_by_source(&self, source_id: &str) -> Result<u64> {
        let mut index = self.index.write().await;
        let mut tx = self.pool.begin().await?;
        let ids = queries::chunk_ids_for_source(&mut tx, source_id).await?;
        let deleted = queries::delete_chunks_by_source(&mut tx, source_id).await?;
        tx.commit().await?;

        // Tombstone persistence follows the relational commit.
        for id in ids {
            index.tombstone(id as u64);
        }
        debug!("Deleted {} chunks for source {}", deleted, source_id);
        Ok(deleted)
    }

    pub async fn upsert_file_metadata(&self, path: &str, mtime: i64, size: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        queries::upsert_file_metadata(&mut conn, path, mtime, size).await
    }

    pub async fn remove_file_metadata(&self, path: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        queries::remove_file_metadata(&mut conn, path).await
    }

    pub async fn get_tracked_files(&self) -> Result<Vec<FileMetadata>> {
        let mut conn = self.pool.acquire().await?;
        queries::get_tracked_files(&mut conn).await
    }

    pub async fn get_stats(&self) -> Result<DatabaseStats> {
        let mut conn = self.pool.acquire().await?;
        let total_chunks = queries::count_chunks(&mut conn).await?;
        let sources = queries::chunks_by_source(&mut conn).await?;
        let types = queries::chunks_by_type(&mut conn).await?;
        drop(conn);

        let index = self.index.read().await;
        Ok(DatabaseStats {
            total_chunks,
            vector_count: index.vector_count(),
            deleted_count: index.deleted_count(),
            active_count: index.active_count(),
            sources,
            types,
        })
    }

    /// Drop all rows, metadata, and vectors.
    pub async fn clear(&self) -> Result<()> {
        let mut index = self.index.write().await;
        let mut tx = self.pool.begin().await?;
        queries::delete_all_chunks(&mut tx).await?;
        tx.commit().await?;
        index.clear()?;
        index.save()?;
        info!("Database cleared");
        Ok(())
    }

    /// Rebuild the ANN index from live rows, discarding tombstones.
    /// The relational store is untouched.
    pub async fn compact(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let row_ids = queries::all_chunk_ids(&mut conn).await?;
        drop(conn);

        let live: Vec<u64> = row_ids.into_iter().map(|id| id as u64).collect();
        let mut index = self.index.write().await;
        index.compact(&live)?;
        index.save()?;
        Ok(())
    }

    /// Flush the ANN index to disk; relational writes flush per
    /// transaction.
    pub async fn persist(&self) -> Result<()> {
        let index = self.index.read().await;
        index.save()
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn vector_dim(&self) -> usize {
        self.dim
    }
}
