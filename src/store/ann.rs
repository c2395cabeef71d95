//! Thin wrapper over the `usearch` HNSW index.
//!
//! Keyed by the store's own dense `vector_id`, not by chunk id — the
//! relational side is the source of truth for which ids are live.
//! Similarity scores are normalized to `[0, 1]` at this boundary so callers
//! above never deal with raw cosine distance or squared L2.

use crate::config::DistanceMetric;
use anyhow::{Context, Result};
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};
use usearch::Index;

const DEFAULT_CONNECTIVITY: usize = 16;
const DEFAULT_EXPANSION_ADD: usize = 128;
const DEFAULT_EXPANSION_SEARCH: usize = 64;

pub struct AnnIndex {
    index: Index,
    metric: DistanceMetric,
}

impl AnnIndex {
    pub fn new(dim: usize, metric: DistanceMetric, capacity: usize) -> Result<Self> {
        let options = IndexOptions {
            dimensions: dim,
            metric: to_metric_kind(metric),
            quantization: ScalarKind::F32,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
            multi: false,
        };
        let index = Index::new(&options).context("failed to create ANN index")?;
        index
            .reserve(capacity.max(1024))
            .context("failed to reserve ANN index capacity")?;
        Ok(Self { index, metric })
    }

    /// Load a persisted index from disk, falling back to an empty index of
    /// the given capacity if the file does not exist.
    pub fn load_or_new(path: &std::path::Path, dim: usize, metric: DistanceMetric, capacity: usize) -> Result<Self> {
        let mut this = Self::new(dim, metric, capacity)?;
        if path.exists() {
            this.index
                .load(&path.to_string_lossy())
                .with_context(|| format!("failed to load ANN index from {}", path.display()))?;
        }
        Ok(this)
    }

    pub fn add(&mut self, vector_id: u64, vector: &[f32]) -> Result<()> {
        if self.index.size() + 1 > self.index.capacity() {
            self.index
                .reserve((self.index.capacity() * 2).max(1024))
                .context("failed to grow ANN index capacity")?;
        }
        self.index
            .add(vector_id, vector)
            .with_context(|| format!("failed to add vector {vector_id} to ANN index"))
    }

    pub fn remove(&mut self, vector_id: u64) -> Result<()> {
        // usearch tolerates removing an absent key; tombstoning at the
        // relational layer is the real source of truth.
        let _ = self.index.remove(vector_id);
        Ok(())
    }

    /// Top-`k` nearest neighbors, returned as `(vector_id, similarity)` with
    /// similarity normalized into `[0, 1]` (higher is closer) regardless of
    /// the underlying distance metric.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f64)>> {
        if self.index.size() == 0 || k == 0 {
            return Ok(Vec::new());
        }
        let matches = self
            .index
            .search(query, k)
            .context("ANN search failed")?;
        Ok(matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .map(|(&id, &distance)| (id, self.to_similarity(distance)))
            .collect())
    }

    fn to_similarity(&self, distance: f32) -> f64 {
        match self.metric {
            // usearch's Cos metric returns 1 - cosine_similarity.
            DistanceMetric::Cosine => (1.0 - distance as f64).clamp(0.0, 1.0),
            // Squared L2 has no fixed upper bound; fold it into (0, 1] with
            // a monotonically decreasing transform so "closer" still means
            // "higher score" for callers that only compare scores.
            DistanceMetric::L2 => 1.0 / (1.0 + distance as f64),
        }
    }

    pub fn size(&self) -> usize {
        self.index.size()
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // write-to-temp, fsync, rename: usearch writes the whole file in one
        // call, so the atomicity is provided by renaming a sibling temp path
        // into place rather than truncating the live file in place.
        let tmp_path = path.with_extension("tmp");
        self.index
            .save(&tmp_path.to_string_lossy())
            .with_context(|| format!("failed to save ANN index to {}", tmp_path.display()))?;
        let file = std::fs::File::open(&tmp_path)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to install ANN index at {}", path.display()))?;
        Ok(())
    }
}

fn to_metric_kind(metric: DistanceMetric) -> MetricKind {
    match metric {
        DistanceMetric::Cosine => MetricKind::Cos,
        DistanceMetric::L2 => MetricKind::L2sq,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_add_and_search() {
        let mut index = AnnIndex::new(4, DistanceMetric::Cosine, 16).unwrap();
        index.add(0, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.add(1, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        index.add(2, &[0.0, 0.0, 1.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 0);
        assert!((results[0].1 - 1.0).abs() < 1e-3);
    }

    #[test]
    fn remove_then_search_excludes_removed_id() {
        let mut index = AnnIndex::new(2, DistanceMetric::Cosine, 16).unwrap();
        index.add(0, &[1.0, 0.0]).unwrap();
        index.add(1, &[0.0, 1.0]).unwrap();
        index.remove(0).unwrap();

        let results = index.search(&[1.0, 0.0], 2).unwrap();
        assert!(results.iter().all(|(id, _)| *id != 0));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.usearch");

        let mut index = AnnIndex::new(3, DistanceMetric::Cosine, 16).unwrap();
        index.add(7, &[1.0, 2.0, 3.0]).unwrap();
        index.save(&path).unwrap();

        let loaded = AnnIndex::load_or_new(&path, 3, DistanceMetric::Cosine, 16).unwrap();
        assert_eq!(loaded.size(), 1);
    }
}
