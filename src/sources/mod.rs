#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{FilesConfig, SourceItem};
use crate::{RagError, Result};

/// Content fetched from one source URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceData {
    pub content: String,
    pub uri: String,
}

/// Expands the configured source items into `(content, uri)` pairs and
/// serves on-demand fetches for the retrieval planner.
pub struct SourceCollector {
    sources: Vec<SourceItem>,
    files: FilesConfig,
    http: reqwest::Client,
}

impl SourceCollector {
    pub fn new(sources: Vec<SourceItem>, files: FilesConfig) -> Self {
        Self {
            sources,
            files,
            http: reqwest::Client::new(),
        }
    }

    /// Enumerate every configured source. Unreadable items are skipped
    /// with a warning rather than failing the whole pass.
    pub async fn collect(&self) -> Vec<SourceData> {
        let mut all = Vec::new();
        for source in &self.sources {
            match source {
                SourceItem::Directory {
                    path,
                    recursive,
                    extensions,
                    exclude,
                } => {
                    let extensions = if extensions.is_empty() {
                        &self.files.default_extensions
                    } else {
                        extensions
                    };
                    self.collect_directory(Path::new(path), *recursive, extensions, exclude, &mut all);
                }
                SourceItem::File { path } => {
                    if let Some(data) = self.read_file(Path::new(path)) {
                        all.push(data);
                    }
                }
                SourceItem::Url {
                    url,
                    headers,
                    timeout_ms,
                } => {
                    if let Some(data) = self.fetch_url(url, headers, *timeout_ms).await {
                        all.push(data);
                    }
                }
            }
        }
        debug!("Collected {} sources", all.len());
        all
    }

    /// Fetch a single source by URI, used when the planner promotes a
    /// search hit to a full source.
    pub async fn fetch(&self, uri: &str) -> Result<SourceData> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            self.fetch_url(uri, &HashMap::new(), 10_000)
                .await
                .ok_or_else(|| RagError::NotFound(format!("unreachable source: {}", uri)))
        } else {
            self.read_file(Path::new(uri))
                .ok_or_else(|| RagError::NotFound(format!("unreadable source: {}", uri)))
        }
    }

    fn collect_directory(
        &self,
        dir: &Path,
        recursive: bool,
        extensions: &[String],
        exclude: &[String],
        out: &mut Vec<SourceData>,
    ) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Unable to process resource {}: {}. Skipped.", dir.display(), e);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if recursive {
                    self.collect_directory(&path, recursive, extensions, exclude, out);
                }
                continue;
            }
            if !path.is_file() {
                continue;
            }
            let normalized = normalize_path(&path.to_string_lossy());
            if self.is_excluded(&normalized, exclude) {
                continue;
            }
            if !extensions.is_empty() && !has_valid_extension(&normalized, extensions) {
                continue;
            }
            if let Some(data) = self.read_file(&path) {
                out.push(data);
            }
        }
    }

    fn is_excluded(&self, normalized_path: &str, exclude: &[String]) -> bool {
        self.files
            .global_exclude
            .iter()
            .chain(exclude.iter())
            .any(|pattern| matches_pattern(normalized_path, pattern))
    }

    fn read_file(&self, path: &Path) -> Option<SourceData> {
        let max_bytes = self.files.max_file_size_mb.saturating_mul(1024 * 1024);
        if max_bytes > 0 {
            match fs::metadata(path) {
                Ok(meta) if meta.len() > max_bytes => {
                    warn!(
                        "File {} exceeds max allowed size of {} MB. Skipped.",
                        path.display(),
                        self.files.max_file_size_mb
                    );
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Unable to process resource {}: {}. Skipped.", path.display(), e);
                    return None;
                }
            }
        }

        match fs::read_to_string(path) {
            Ok(content) => Some(SourceData {
                content,
                uri: normalize_path(&path.to_string_lossy()),
            }),
            Err(e) => {
                warn!("Unable to process resource {}: {}. Skipped.", path.display(), e);
                None
            }
        }
    }

    async fn fetch_url(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        timeout_ms: u64,
    ) -> Option<SourceData> {
        let mut request = self
            .http
            .get(url)
            .timeout(Duration::from_millis(timeout_ms));
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(content) => Some(SourceData {
                    content,
                    uri: url.to_string(),
                }),
                Err(e) => {
                    warn!("Unable to read resource {}: {}. Skipped.", url, e);
                    None
                }
            },
            Ok(response) => {
                warn!(
                    "Unable to process resource {} (status {}). Skipped.",
                    url,
                    response.status()
                );
                None
            }
            Err(e) => {
                warn!("Unable to process resource {}: {}. Skipped.", url, e);
                None
            }
        }
    }
}

/// Tracked paths whose filename stem contains the stem of `uri`; used to
/// surface header/source pairs and related test files.
pub fn filter_related_sources(tracked: &[String], uri: &str) -> Vec<String> {
    let stem = file_stem(uri);
    if stem.is_empty() {
        return Vec::new();
    }
    tracked
        .iter()
        .filter(|path| path.as_str() != uri && file_stem(path).contains(&stem))
        .cloned()
        .collect()
}

fn file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// `(mtime, size)` for a path, or zeros for anything unstattable
/// (URLs, ad-hoc documents). Modification time is kept at nanosecond
/// resolution so a same-size rewrite within one second still registers
/// as a change.
pub fn stat_uri(uri: &str) -> (i64, i64) {
    match fs::metadata(uri) {
        Ok(meta) => {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0);
            (mtime, meta.len() as i64)
        }
        Err(_) => (0, 0),
    }
}

/// `*` prefix, suffix, and wrap-around substring matching against a
/// forward-slash-normalized path.
fn matches_pattern(path: &str, pattern: &str) -> bool {
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(rest), _) if rest.ends_with('*') => path.contains(&rest[..rest.len() - 1]),
        (Some(suffix), _) => path.ends_with(suffix),
        (_, Some(prefix)) => path.starts_with(prefix),
        _ => path.contains(pattern),
    }
}

fn has_valid_extension(path: &str, extensions: &[String]) -> bool {
    extensions.iter().any(|ext| path.ends_with(ext.as_str()))
}
