use super::*;
use crate::config::FilesConfig;
use std::io::Write;
use tempfile::TempDir;

fn write_file(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut file = fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    normalize_path(&path.to_string_lossy())
}

fn collector(sources: Vec<SourceItem>) -> SourceCollector {
    SourceCollector::new(sources, FilesConfig::default())
}

#[tokio::test]
async fn collects_single_file() {
    let dir = TempDir::new().unwrap();
    let path = write_file(dir.path(), "a.md", "alpha");

    let collector = collector(vec![SourceItem::File { path: path.clone() }]);
    let data = collector.collect().await;
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].content, "alpha");
    assert_eq!(data[0].uri, path);
}

#[tokio::test]
async fn missing_file_skipped_with_warning() {
    let collector = collector(vec![SourceItem::File {
        path: "/no/such/file.md".to_string(),
    }]);
    assert!(collector.collect().await.is_empty());
}

#[tokio::test]
async fn directory_extension_filter() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path(), "keep.rs", "fn main() {}");
    write_file(dir.path(), "skip.bin", "binary");

    let collector = collector(vec![SourceItem::Directory {
        path: dir.path().to_string_lossy().into_owned(),
        recursive: false,
        extensions: vec![".rs".to_string()],
        exclude: vec![],
    }]);
    let data = collector.collect().await;
    assert_eq!(data.len(), 1);
    assert!(data[0].uri.ends_with("keep.rs"));
}

#[tokio::test]
async fn directory_recursion() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path(), "top.rs", "top");
    write_file(dir.path(), "nested/deep.rs", "deep");

    let recursive = collector(vec![SourceItem::Directory {
        path: dir.path().to_string_lossy().into_owned(),
        recursive: true,
        extensions: vec![".rs".to_string()],
        exclude: vec![],
    }]);
    assert_eq!(recursive.collect().await.len(), 2);

    let flat = collector(vec![SourceItem::Directory {
        path: dir.path().to_string_lossy().into_owned(),
        recursive: false,
        extensions: vec![".rs".to_string()],
        exclude: vec![],
    }]);
    assert_eq!(flat.collect().await.len(), 1);
}

#[tokio::test]
async fn exclusion_patterns() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path(), "src/lib.rs", "lib");
    write_file(dir.path(), "target/debug/lib.rs", "build artifact");

    let collector = collector(vec![SourceItem::Directory {
        path: dir.path().to_string_lossy().into_owned(),
        recursive: true,
        extensions: vec![".rs".to_string()],
        exclude: vec!["*target*".to_string()],
    }]);
    let data = collector.collect().await;
    assert_eq!(data.len(), 1);
    assert!(data[0].uri.contains("src"));
}

#[tokio::test]
async fn global_exclude_applies_to_all_directories() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path(), "a.rs", "a");
    write_file(dir.path(), "a_test.rs", "test");

    let mut files = FilesConfig::default();
    files.global_exclude = vec!["*_test.rs".to_string()];
    let collector = SourceCollector::new(
        vec![SourceItem::Directory {
            path: dir.path().to_string_lossy().into_owned(),
            recursive: false,
            extensions: vec![".rs".to_string()],
            exclude: vec![],
        }],
        files,
    );
    let data = collector.collect().await;
    assert_eq!(data.len(), 1);
    assert!(data[0].uri.ends_with("a.rs"));
}

#[tokio::test]
async fn oversize_file_skipped() {
    let dir = TempDir::new().unwrap();
    let big = "x".repeat(2 * 1024 * 1024);
    write_file(dir.path(), "big.md", &big);

    let mut files = FilesConfig::default();
    files.max_file_size_mb = 1;
    let collector = SourceCollector::new(
        vec![SourceItem::Directory {
            path: dir.path().to_string_lossy().into_owned(),
            recursive: false,
            extensions: vec![],
            exclude: vec![],
        }],
        files,
    );
    assert!(collector.collect().await.is_empty());
}

#[tokio::test]
async fn fetch_reads_tracked_file() {
    let dir = TempDir::new().unwrap();
    let path = write_file(dir.path(), "doc.md", "document body");

    let collector = collector(vec![]);
    let data = collector.fetch(&path).await.unwrap();
    assert_eq!(data.content, "document body");
}

#[tokio::test]
async fn fetch_missing_file_is_not_found() {
    let collector = collector(vec![]);
    let err = collector.fetch("/no/such/doc.md").await.unwrap_err();
    assert!(matches!(err, RagError::NotFound(_)));
}

#[test]
fn pattern_matching_variants() {
    assert!(matches_pattern("src/target/debug/x.rs", "*target*"));
    assert!(matches_pattern("src/lib.min.js", "*.min.js"));
    assert!(matches_pattern("build/output.rs", "build*"));
    assert!(matches_pattern("a/generated/b.rs", "generated"));
    assert!(!matches_pattern("src/lib.rs", "*target*"));
}

#[test]
fn related_sources_by_stem() {
    let tracked = vec![
        "src/parser.rs".to_string(),
        "src/parser_test.rs".to_string(),
        "include/parser.h".to_string(),
        "src/lexer.rs".to_string(),
    ];
    let related = filter_related_sources(&tracked, "src/parser.rs");
    assert_eq!(
        related,
        vec!["src/parser_test.rs".to_string(), "include/parser.h".to_string()]
    );
}

#[test]
fn related_sources_excludes_self_and_unrelated() {
    let tracked = vec!["a.rs".to_string(), "b.rs".to_string()];
    let related = filter_related_sources(&tracked, "a.rs");
    assert!(related.is_empty());
}

#[test]
fn path_normalization_uses_forward_slashes() {
    assert_eq!(normalize_path("a\\b\\c.rs"), "a/b/c.rs");
}
