use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::config::DistanceMetric;
use crate::{RagError, Result};

// usearch::Index holds raw C++ pointers that are not Send/Sync from
// Rust's point of view; the underlying library is safe for concurrent
// reads with exclusive writes, which the store enforces via RwLock.
struct SendSyncIndex(Index);
unsafe impl Send for SendSyncIndex {}
unsafe impl Sync for SendSyncIndex {}

/// Sidecar state persisted next to the index file.
#[derive(Serialize, Deserialize, Default)]
struct SidecarState {
    tombstones: Vec<u64>,
}

/// HNSW index keyed by chunk row id, with store-side soft deletes.
///
/// Deleted labels stay in the index as tombstones and are skipped
/// during search; `compact` rebuilds from live entries to reclaim them.
pub struct AnnIndex {
    index: SendSyncIndex,
    tombstones: HashSet<u64>,
    dim: usize,
    metric: DistanceMetric,
    max_elements: usize,
    path: PathBuf,
}

fn index_options(dim: usize, metric: DistanceMetric) -> IndexOptions {
    IndexOptions {
        dimensions: dim,
        metric: match metric {
            DistanceMetric::L2 => MetricKind::L2sq,
            DistanceMetric::Cosine => MetricKind::Cos,
        },
        quantization: ScalarKind::F32,
        ..Default::default()
    }
}

fn new_index(dim: usize, metric: DistanceMetric, capacity: usize) -> Result<SendSyncIndex> {
    let index = Index::new(&index_options(dim, metric))
        .map_err(|e| RagError::Storage(e.to_string()))?;
    index
        .reserve(capacity)
        .map_err(|e| RagError::Storage(e.to_string()))?;
    Ok(SendSyncIndex(index))
}

impl AnnIndex {
    /// Load the index and tombstone sidecar from `path`, or start fresh
    /// when nothing is there or loading fails.
    pub fn open(
        path: &Path,
        dim: usize,
        metric: DistanceMetric,
        max_elements: usize,
    ) -> Result<Self> {
        let mut ann = Self {
            index: new_index(dim, metric, max_elements)?,
            tombstones: HashSet::new(),
            dim,
            metric,
            max_elements,
            path: path.to_path_buf(),
        };

        if path.exists() {
            match ann.index.0.load(&path.to_string_lossy()) {
                Ok(()) => {
                    ann.tombstones = ann.load_sidecar();
                    info!(
                        "Loaded existing index with {} vectors ({} tombstoned)",
                        ann.index.0.size(),
                        ann.tombstones.len()
                    );
                }
                Err(e) => {
                    warn!("Failed to load existing index: {}. Creating new one.", e);
                    ann.index = new_index(dim, metric, max_elements)?;
                    ann.tombstones.clear();
                }
            }
        }
        Ok(ann)
    }

    fn sidecar_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_owned();
        os.push(".meta.json");
        PathBuf::from(os)
    }

    fn load_sidecar(&self) -> HashSet<u64> {
        let path = self.sidecar_path();
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<SidecarState>(&content) {
                Ok(state) => state.tombstones.into_iter().collect(),
                Err(e) => {
                    warn!("Malformed index sidecar {}: {}. Ignoring.", path.display(), e);
                    HashSet::new()
                }
            },
            Err(_) => HashSet::new(),
        }
    }

    pub fn add(&mut self, key: u64, vector: &[f32]) -> Result<()> {
        let size = self.index.0.size();
        if size >= self.index.0.capacity() {
            self.index
                .0
                .reserve(size + self.max_elements.max(1))
                .map_err(|e| RagError::Storage(e.to_string()))?;
        }
        self.index
            .0
            .add(key, vector)
            .map_err(|e| RagError::Storage(e.to_string()))?;
        self.tombstones.remove(&key);
        Ok(())
    }

    pub fn tombstone(&mut self, key: u64) {
        if self.index.0.contains(key) {
            self.tombstones.insert(key);
        }
    }

    pub fn contains(&self, key: u64) -> bool {
        self.index.0.contains(key)
    }

    /// Nearest neighbours to `query`, tombstones skipped, as
    /// `(key, distance)` pairs in ascending distance order.
    pub fn search(&self, query: &[f32], count: usize) -> Result<Vec<(u64, f32)>> {
        let matches = self
            .index
            .0
            .filtered_search(query, count, |key| !self.tombstones.contains(&key))
            .map_err(|e| RagError::Storage(e.to_string()))?;

        Ok(matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .map(|(&key, &distance)| (key, distance))
            .collect())
    }

    pub fn get_vector(&self, key: u64) -> Result<Option<Vec<f32>>> {
        if !self.index.0.contains(key) {
            return Ok(None);
        }
        let mut buffer = vec![0.0f32; self.dim];
        match self.index.0.get(key, &mut buffer) {
            Ok(found) if found > 0 => Ok(Some(buffer)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("Failed to read vector for key {}: {}", key, e);
                Ok(None)
            }
        }
    }

    pub fn vector_count(&self) -> u64 {
        self.index.0.size() as u64
    }

    pub fn deleted_count(&self) -> u64 {
        self.tombstones.len() as u64
    }

    pub fn active_count(&self) -> u64 {
        self.vector_count().saturating_sub(self.deleted_count())
    }

    /// Map a raw index distance to a similarity score where higher is
    /// better: `1/(1+d)` for L2, `1-d` for cosine.
    pub fn similarity(&self, distance: f32) -> f32 {
        match self.metric {
            DistanceMetric::L2 => 1.0 / (1.0 + distance),
            DistanceMetric::Cosine => 1.0 - distance,
        }
    }

    /// Rebuild from the given live keys, discarding tombstones and any
    /// label not listed. Keys without a stored vector are skipped.
    pub fn compact(&mut self, live_keys: &[u64]) -> Result<()> {
        let fresh = new_index(self.dim, self.metric, live_keys.len().max(self.max_elements))?;

        let mut kept = 0u64;
        for &key in live_keys {
            if self.tombstones.contains(&key) {
                continue;
            }
            match self.get_vector(key)? {
                Some(vector) => {
                    fresh
                        .0
                        .add(key, &vector)
                        .map_err(|e| RagError::Storage(e.to_string()))?;
                    kept += 1;
                }
                None => warn!("Compaction: no vector stored for chunk {}", key),
            }
        }

        self.index = fresh;
        self.tombstones.clear();
        info!("Compacted index down to {} live vectors", kept);
        Ok(())
    }

    /// Drop everything and start from an empty index.
    pub fn clear(&mut self) -> Result<()> {
        self.index = new_index(self.dim, self.metric, self.max_elements)?;
        self.tombstones.clear();
        Ok(())
    }

    /// Flush the index and its tombstone sidecar to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.index
            .0
            .save(&self.path.to_string_lossy())
            .map_err(|e| RagError::Storage(e.to_string()))?;

        let state = SidecarState {
            tombstones: self.tombstones.iter().copied().collect(),
        };
        let json = serde_json::to_string(&state)
            .map_err(|e| RagError::Storage(e.to_string()))?;
        std::fs::write(self.sidecar_path(), json)?;
        Ok(())
    }
}
