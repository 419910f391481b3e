use super::*;
use crate::chunker::Chunker;
use crate::config::{ChunkingSettings, DatabaseConfig, DistanceMetric, FilesConfig, SourceItem};
use crate::database::VectorDatabase;
use crate::tokenizer::TokenCounter;
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

const DIM: usize = 4;
const KEYWORDS: [&str; 4] = ["alpha", "omega", "zeta", "delta"];

/// Deterministic test embedder: one dimension per probe keyword.
struct StubEmbedder;

#[async_trait]
impl crate::inference::Embedder for StubEmbedder {
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

struct Fixture {
    _dir: TempDir,
    corpus: std::path::PathBuf,
    updater: Updater,
    db: Arc<VectorDatabase>,
}

fn write_file(dir: &Path, name: &str, content: &str) {
    let mut file = std::fs::File::create(dir.join(name)).unwrap();
    file.write_all(content.as_bytes()).unwrap();
}

async fn fixture(files: &[(&str, &str)]) -> Fixture {
    let dir = TempDir::new().unwrap();
    let corpus = dir.path().join("corpus");
    std::fs::create_dir_all(&corpus).unwrap();
    for (name, content) in files {
        write_file(&corpus, name, content);
    }

    let db_config = DatabaseConfig {
        sqlite_path: dir.path().join("db.sqlite").to_string_lossy().into_owned(),
        index_path: dir.path().join("db.usearch").to_string_lossy().into_owned(),
        vector_dim: DIM,
        max_elements: 1000,
        distance_metric: DistanceMetric::L2,
    };
    let db = Arc::new(VectorDatabase::open(&db_config).await.unwrap());

    let chunking = ChunkingSettings {
        nof_min_tokens: 1,
        nof_max_tokens: 100,
        overlap_percentage: 0.0,
        semantic: false,
    };
    let chunker = Arc::new(Chunker::new(Arc::new(TokenCounter::without_vocab()), &chunking));

    let collector = Arc::new(SourceCollector::new(
        vec![SourceItem::Directory {
            path: corpus.to_string_lossy().into_owned(),
            recursive: false,
            extensions: vec![".md".to_string()],
            exclude: vec![],
        }],
        FilesConfig::default(),
    ));

    let updater = Updater::new(
        Arc::clone(&db),
        chunker,
        Arc::new(StubEmbedder),
        collector,
        8,
        String::new(),
        false,
    );

    Fixture {
        _dir: dir,
        corpus,
        updater,
        db,
    }
}

#[tokio::test]
async fn embed_all_tracks_files() {
    let fx = fixture(&[("file1.md", "alpha beta gamma"), ("file2.md", "delta epsilon zeta")]).await;

    let (files, chunks) = fx.updater.embed_all().await.unwrap();
    assert_eq!(files, 2);
    assert!(chunks >= 2);

    let tracked = fx.db.get_tracked_files().await.unwrap();
    assert_eq!(tracked.len(), 2);
}

#[tokio::test]
async fn embed_all_rerun_does_not_duplicate() {
    let fx = fixture(&[("file1.md", "alpha beta gamma")]).await;

    fx.updater.embed_all().await.unwrap();
    let first = fx.db.get_stats().await.unwrap();
    fx.updater.embed_all().await.unwrap();
    let second = fx.db.get_stats().await.unwrap();

    assert_eq!(first.active_count, second.active_count);
    assert_eq!(first.total_chunks, second.total_chunks);
}

#[tokio::test]
async fn detect_changes_classifies_new() {
    let fx = fixture(&[("file1.md", "alpha beta gamma")]).await;

    let current = fx.updater.collector.collect().await;
    let info = fx.updater.detect_changes(current).await.unwrap();
    assert_eq!(info.new_files.len(), 1);
    assert!(info.modified_files.is_empty());
    assert!(info.deleted_files.is_empty());
}

#[tokio::test]
async fn detect_changes_classifies_unchanged() {
    let fx = fixture(&[("file1.md", "alpha beta gamma")]).await;
    fx.updater.embed_all().await.unwrap();

    let current = fx.updater.collector.collect().await;
    let info = fx.updater.detect_changes(current).await.unwrap();
    assert!(!info.has_changes());
    assert_eq!(info.unchanged, 1);
}

#[tokio::test]
async fn detect_changes_classifies_modified() {
    let fx = fixture(&[("file1.md", "alpha beta gamma")]).await;
    fx.updater.embed_all().await.unwrap();

    // Rewrite with different size so the join flags it.
    write_file(&fx.corpus, "file1.md", "alpha beta omega omega");

    let current = fx.updater.collector.collect().await;
    let info = fx.updater.detect_changes(current).await.unwrap();
    assert_eq!(info.modified_files.len(), 1);
    assert!(info.new_files.is_empty());
}

#[tokio::test]
async fn detect_changes_classifies_deleted() {
    let fx = fixture(&[("file1.md", "alpha beta gamma"), ("file2.md", "delta epsilon zeta")]).await;
    fx.updater.embed_all().await.unwrap();

    std::fs::remove_file(fx.corpus.join("file2.md")).unwrap();

    let current = fx.updater.collector.collect().await;
    let info = fx.updater.detect_changes(current).await.unwrap();
    assert_eq!(info.deleted_files.len(), 1);
    assert!(info.deleted_files[0].ends_with("file2.md"));
}

#[tokio::test]
async fn update_applies_modification_in_place() {
    let fx = fixture(&[("file1.md", "alpha beta gamma")]).await;
    fx.updater.embed_all().await.unwrap();
    let before = fx.db.get_stats().await.unwrap();

    // Same byte length as the original; only the mtime distinguishes it.
    tokio::time::sleep(Duration::from_millis(20)).await;
    write_file(&fx.corpus, "file1.md", "alpha beta omega");
    let touched = fx.updater.update().await.unwrap();
    assert_eq!(touched, 1);

    let after = fx.db.get_stats().await.unwrap();
    // Same chunk count; the old chunk is tombstoned, not active.
    assert_eq!(before.active_count, after.active_count);
    assert!(after.deleted_count > 0);

    let query = StubEmbedder.embed("omega").await.unwrap();
    let results = fx.db.search(&query, 1).await.unwrap();
    assert!(results[0].source_id.ends_with("file1.md"));
}

#[tokio::test]
async fn update_removes_deleted_file() {
    let fx = fixture(&[("file1.md", "alpha beta gamma"), ("file2.md", "delta epsilon zeta")]).await;
    fx.updater.embed_all().await.unwrap();

    std::fs::remove_file(fx.corpus.join("file2.md")).unwrap();
    fx.updater.update().await.unwrap();

    let tracked = fx.db.get_tracked_files().await.unwrap();
    assert_eq!(tracked.len(), 1);
    assert!(tracked[0].path.ends_with("file1.md"));

    let query = StubEmbedder.embed("zeta").await.unwrap();
    let results = fx.db.search(&query, 3).await.unwrap();
    for result in &results {
        assert!(!result.source_id.ends_with("file2.md"));
    }
}

#[tokio::test]
async fn update_with_no_changes_is_noop() {
    let fx = fixture(&[("file1.md", "alpha beta gamma")]).await;
    fx.updater.embed_all().await.unwrap();
    assert_eq!(fx.updater.update().await.unwrap(), 0);
}

#[tokio::test]
async fn watcher_cancels_within_a_slice() {
    let fx = fixture(&[("file1.md", "alpha beta gamma")]).await;
    let watcher = Watcher::spawn(Arc::new(fx.updater), 3600);

    let start = std::time::Instant::now();
    watcher.stop();
    tokio::time::timeout(Duration::from_secs(2), watcher.join())
        .await
        .expect("watcher did not stop within two seconds");
    assert!(start.elapsed() < Duration::from_secs(2));
}
