use sqlx::sqlite::SqliteConnection;

use super::models::{ChunkRow, FileMetadata};
use crate::chunker::Chunk;
use crate::{RagError, Result};

/// Attach the failing operation to a driver error.
fn storage_err(op: &'static str) -> impl FnOnce(sqlx::Error) -> RagError {
    move |e| RagError::Storage(format!("{}: {}", op, e))
}

/// Insert one chunk row and return the generated id.
pub async fn insert_chunk(conn: &mut SqliteConnection, chunk: &Chunk) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO chunks (content, source_id, start_pos, end_pos, token_count, unit, chunk_type)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&chunk.text)
    .bind(&chunk.doc_uri)
    .bind(chunk.metadata.start as i64)
    .bind(chunk.metadata.end as i64)
    .bind(chunk.metadata.token_count as i64)
    .bind(chunk.metadata.unit.as_str())
    .bind(chunk.metadata.chunk_type.as_str())
    .execute(conn)
    .await
    .map_err(storage_err("Failed to insert chunk"))?;

    Ok(result.last_insert_rowid())
}

pub async fn get_chunk(conn: &mut SqliteConnection, id: i64) -> Result<Option<ChunkRow>> {
    let row = sqlx::query_as::<_, ChunkRow>(
        "SELECT id, content, source_id, start_pos, end_pos, token_count, unit, chunk_type
         FROM chunks WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(conn)
    .await
    .map_err(storage_err("Failed to get chunk by id"))?;
    Ok(row)
}

pub async fn chunk_ids_for_source(conn: &mut SqliteConnection, source_id: &str) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM chunks WHERE source_id = ?")
        .bind(source_id)
        .fetch_all(conn)
        .await
        .map_err(storage_err("Failed to list chunk ids for source"))?;
    Ok(ids)
}

pub async fn delete_chunks_by_source(conn: &mut SqliteConnection, source_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM chunks WHERE source_id = ?")
        .bind(source_id)
        .execute(conn)
        .await
        .map_err(storage_err("Failed to delete chunks for source"))?;
    Ok(result.rows_affected())
}

pub async fn all_chunk_ids(conn: &mut SqliteConnection) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM chunks ORDER BY id")
        .fetch_all(conn)
        .await
        .map_err(storage_err("Failed to list chunk ids"))?;
    Ok(ids)
}

pub async fn count_chunks(conn: &mut SqliteConnection) -> Result<u64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM chunks")
        .fetch_one(conn)
        .await
        .map_err(storage_err("Failed to count chunks"))?;
    Ok(count.max(0) as u64)
}

pub async fn chunks_by_source(conn: &mut SqliteConnection) -> Result<Vec<(String, u64)>> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        "SELECT source_id, COUNT(*) FROM chunks GROUP BY source_id ORDER BY source_id",
    )
    .fetch_all(conn)
    .await
    .map_err(storage_err("Failed to group chunks by source"))?;
    Ok(rows.into_iter().map(|(s, n)| (s, n.max(0) as u64)).collect())
}

pub async fn chunks_by_type(conn: &mut SqliteConnection) -> Result<Vec<(String, u64)>> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        "SELECT chunk_type, COUNT(*) FROM chunks GROUP BY chunk_type ORDER BY chunk_type",
    )
    .fetch_all(conn)
    .await
    .map_err(storage_err("Failed to group chunks by type"))?;
    Ok(rows.into_iter().map(|(s, n)| (s, n.max(0) as u64)).collect())
}

pub async fn delete_all_chunks(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("DELETE FROM chunks")
        .execute(&mut *conn)
        .await
        .map_err(storage_err("Failed to clear chunks"))?;
    sqlx::query("DELETE FROM files_metadata")
        .execute(conn)
        .await
        .map_err(storage_err("Failed to clear file metadata"))?;
    Ok(())
}

pub async fn upsert_file_metadata(
    conn: &mut SqliteConnection,
    path: &str,
    last_modified: i64,
    file_size: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO files_metadata (path, last_modified, file_size) VALUES (?, ?, ?)",
    )
    .bind(path)
    .bind(last_modified)
    .bind(file_size)
    .execute(conn)
    .await
    .map_err(storage_err("Failed to upsert file metadata"))?;
    Ok(())
}

pub async fn remove_file_metadata(conn: &mut SqliteConnection, path: &str) -> Result<()> {
    sqlx::query("DELETE FROM files_metadata WHERE path = ?")
        .bind(path)
        .execute(conn)
        .await
        .map_err(storage_err("Failed to remove file metadata"))?;
    Ok(())
}

pub async fn get_tracked_files(conn: &mut SqliteConnection) -> Result<Vec<FileMetadata>> {
    let files = sqlx::query_as::<_, FileMetadata>(
        "SELECT path, last_modified, file_size FROM files_metadata ORDER BY path",
    )
    .fetch_all(conn)
    .await
    .map_err(storage_err("Failed to list tracked files"))?;
    Ok(files)
}
