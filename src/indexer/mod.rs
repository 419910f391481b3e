#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chunker::{clean_text_for_embedding, Chunker};
use crate::database::VectorDatabase;
use crate::inference::Embedder;
use crate::sources::{SourceCollector, SourceData};
use crate::Result;

/// Classified filesystem-vs-store diff produced by `detect_changes`.
#[derive(Debug, Default)]
pub struct UpdateInfo {
    pub new_files: Vec<SourceData>,
    pub modified_files: Vec<SourceData>,
    pub deleted_files: Vec<String>,
    pub unchanged: usize,
}

impl UpdateInfo {
    pub fn has_changes(&self) -> bool {
        !self.new_files.is_empty()
            || !self.modified_files.is_empty()
            || !self.deleted_files.is_empty()
    }
}

/// Reconciles the tracked-file set with the filesystem: deletes,
/// re-embeds, or adds affected chunks. Errors in one file's transaction
/// roll back that file only; the pass continues.
pub struct Updater {
    db: Arc<VectorDatabase>,
    chunker: Arc<Chunker>,
    embedder: Arc<dyn Embedder>,
    collector: Arc<SourceCollector>,
    batch_size: usize,
    prepend_phrase: String,
    semantic: bool,
}

impl Updater {
    pub fn new(
        db: Arc<VectorDatabase>,
        chunker: Arc<Chunker>,
        embedder: Arc<dyn Embedder>,
        collector: Arc<SourceCollector>,
        batch_size: usize,
        prepend_phrase: String,
        semantic: bool,
    ) -> Self {
        Self {
            db,
            chunker,
            embedder,
            collector,
            batch_size: batch_size.max(1),
            prepend_phrase,
            semantic,
        }
    }

    /// Full embedding pass over every configured source. Existing chunks
    /// for each source are replaced, so a re-run rebuilds rather than
    /// duplicates. Returns `(files, chunks)` processed.
    pub async fn embed_all(&self) -> Result<(usize, usize)> {
        let sources = self.collector.collect().await;
        let mut total_files = 0;
        let mut total_chunks = 0;

        for data in &sources {
            match self.replace_source(data).await {
                Ok(chunks) => {
                    total_files += 1;
                    total_chunks += chunks;
                    info!("Processed {}: {} chunks", data.uri, chunks);
                }
                Err(e) => {
                    error!("Error processing {}: {}", data.uri, e);
                }
            }
        }

        self.db.persist().await?;
        Ok((total_files, total_chunks))
    }

    /// Join the current source set against the tracked-file table and
    /// classify each file as new, modified, unchanged, or deleted.
    pub async fn detect_changes(&self, current: Vec<SourceData>) -> Result<UpdateInfo> {
        let tracked = self.db.get_tracked_files().await?;
        let tracked_map: std::collections::HashMap<&str, (i64, i64)> = tracked
            .iter()
            .map(|f| (f.path.as_str(), (f.last_modified, f.file_size)))
            .collect();

        let mut info = UpdateInfo::default();
        let mut seen = std::collections::HashSet::new();

        for data in current {
            seen.insert(data.uri.clone());
            match tracked_map.get(data.uri.as_str()) {
                None => info.new_files.push(data),
                Some(&(mtime, size)) => {
                    let (cur_mtime, cur_size) = crate::sources::stat_uri(&data.uri);
                    if cur_mtime != mtime || cur_size != size {
                        info.modified_files.push(data);
                    } else {
                        info.unchanged += 1;
                    }
                }
            }
        }

        for file in tracked {
            if !seen.contains(&file.path) {
                info.deleted_files.push(file.path);
            }
        }

        Ok(info)
    }

    /// Apply a detected diff in three phases: deletions, modifications,
    /// additions. Persists once at the end when anything changed.
    /// Returns the number of files touched.
    pub async fn update_database(&self, info: UpdateInfo) -> Result<usize> {
        let had_changes = info.has_changes();
        let mut touched = 0;

        for path in &info.deleted_files {
            match self.remove_source(path).await {
                Ok(chunks) => {
                    touched += 1;
                    debug!("Removed {} ({} chunks)", path, chunks);
                }
                Err(e) => error!("Error removing {}: {}", path, e),
            }
        }
        if !info.deleted_files.is_empty() {
            info!("Deletions: {} files", info.deleted_files.len());
        }

        for data in &info.modified_files {
            match self.replace_source(data).await {
                Ok(chunks) => {
                    touched += 1;
                    debug!("Re-embedded {} ({} chunks)", data.uri, chunks);
                }
                Err(e) => error!("Error re-embedding {}: {}", data.uri, e),
            }
        }
        if !info.modified_files.is_empty() {
            info!("Modifications: {} files", info.modified_files.len());
        }

        for data in &info.new_files {
            match self.add_source(data).await {
                Ok(chunks) => {
                    touched += 1;
                    debug!("Added {} ({} chunks)", data.uri, chunks);
                }
                Err(e) => error!("Error adding {}: {}", data.uri, e),
            }
        }
        if !info.new_files.is_empty() {
            info!("Additions: {} files", info.new_files.len());
        }

        if had_changes {
            self.db.persist().await?;
        }
        Ok(touched)
    }

    /// One full update pass: collect, diff, apply.
    pub async fn update(&self) -> Result<usize> {
        let current = self.collector.collect().await;
        let info = self.detect_changes(current).await?;
        if !info.has_changes() {
            debug!("No changes detected ({} files unchanged)", info.unchanged);
            return Ok(0);
        }
        self.update_database(info).await
    }

    async fn remove_source(&self, path: &str) -> Result<u64> {
        let deleted = self.db.delete_documents_by_source(path).await?;
        self.db.remove_file_metadata(path).await?;
        Ok(deleted)
    }

    async fn replace_source(&self, data: &SourceData) -> Result<usize> {
        self.db.delete_documents_by_source(&data.uri).await?;
        self.add_source(data).await
    }

    /// Chunk, embed, and insert one source as a single atomic batch.
    async fn add_source(&self, data: &SourceData) -> Result<usize> {
        let chunks = self.chunker.chunk(&data.content, &data.uri, self.semantic);
        if chunks.is_empty() {
            debug!("No chunks generated for {}", data.uri);
            return Ok(0);
        }

        let texts: Vec<String> = chunks
            .iter()
            .map(|c| clean_text_for_embedding(&c.text, &self.prepend_phrase))
            .collect();

        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            embeddings.extend(self.embedder.embed_batch(batch).await?);
        }

        self.db.add_documents(&chunks, &embeddings).await?;
        Ok(chunks.len())
    }
}

/// Background watcher: runs an update pass every `interval_secs`,
/// sleeping in one-second slices so cancellation lands within a slice.
pub struct Watcher {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Watcher {
    pub fn spawn(updater: Arc<Updater>, interval_secs: u64) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = tokio::spawn(async move {
            info!(
                "[Watch] Background monitoring started (interval: {}s)",
                interval_secs
            );
            'outer: loop {
                for _ in 0..interval_secs.max(1) {
                    if !flag.load(Ordering::Relaxed) {
                        break 'outer;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                if !flag.load(Ordering::Relaxed) {
                    break;
                }
                match updater.update().await {
                    Ok(0) => {}
                    Ok(n) => info!("[Watch] Update completed: {} files processed", n),
                    Err(e) => warn!("[Watch] Error during update: {}", e),
                }
            }
            info!("[Watch] Background monitoring stopped");
        });

        Self { running, handle }
    }

    /// Signal cooperative cancellation; the task exits within one
    /// sleep slice.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub async fn join(self) {
        self.stop();
        let _ = self.handle.await;
    }
}
