//! Incremental updater.
//!
//! Diffs the configured sources against tracked `file_metadata` rows and
//! applies the minimal set of store mutations: new and modified files are
//! re-chunked and re-embedded, deleted files are torn down. Keeps a process
//! lifetime `failure_counts`/`ignored` set so a persistently-broken file
//! doesn't get retried forever.

use crate::chunker::Chunker;
use crate::embedding::client::{EmbedKind, EmbeddingClient};
use crate::models::{now_unix, FileMetadata};
use crate::source::SourceCollector;
use crate::store::VectorStore;
use anyhow::Result;
use std::collections::{HashMap, HashSet};

const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Default, Clone)]
pub struct UpdateInfo {
    pub new_files: Vec<String>,
    pub modified_files: Vec<String>,
    pub deleted_files: Vec<String>,
    pub unchanged_files: Vec<String>,
}

pub struct IncrementalUpdater {
    collector: SourceCollector,
    chunker: Chunker,
    embedding: Option<EmbeddingClient>,
    batch_size: usize,
    failure_counts: HashMap<String, u32>,
    ignored: HashSet<String>,
}

impl IncrementalUpdater {
    pub fn new(collector: SourceCollector, chunker: Chunker, embedding: Option<EmbeddingClient>, batch_size: usize) -> Self {
        Self {
            collector,
            chunker,
            embedding,
            batch_size: batch_size.max(1),
            failure_counts: HashMap::new(),
            ignored: HashSet::new(),
        }
    }

    pub fn ignored_files(&self) -> &HashSet<String> {
        &self.ignored
    }

    /// Compare current source enumeration against tracked file metadata.
    /// Files in the ignore set are skipped entirely (treated as if they
    /// did not exist).
    pub async fn detect_changes(&self, store: &VectorStore) -> Result<UpdateInfo> {
        let current = self.collector.collect(false)?;
        let tracked = store.get_tracked_files().await?;
        let tracked_by_path: HashMap<&str, &FileMetadata> = tracked.iter().map(|f| (f.path.as_str(), f)).collect();

        let mut info = UpdateInfo::default();
        let mut seen = HashSet::new();

        for item in &current {
            if self.ignored.contains(&item.source_id) {
                continue;
            }
            seen.insert(item.source_id.clone());
            match tracked_by_path.get(item.source_id.as_str()) {
                None => info.new_files.push(item.source_id.clone()),
                Some(meta) => {
                    if meta.last_modified != item.last_modified || meta.file_size != item.file_size {
                        info.modified_files.push(item.source_id.clone());
                    } else {
                        info.unchanged_files.push(item.source_id.clone());
                    }
                }
            }
        }

        for meta in &tracked {
            if !seen.contains(&meta.path) && !self.ignored.contains(&meta.path) {
                info.deleted_files.push(meta.path.clone());
            }
        }

        Ok(info)
    }

    /// Apply a detected change set. Returns the number of files whose store
    /// state changed. Deletions run first, in one transaction that aborts
    /// the whole update on failure; modifications and new files each get
    /// their own transaction and a failure only skips that file.
    pub async fn apply(&mut self, info: &UpdateInfo, store: &VectorStore) -> Result<usize> {
        let mut updated = 0usize;
        let mut summary = Vec::new();

        if !info.deleted_files.is_empty() {
            match self.delete_all(&info.deleted_files, store).await {
                Ok(()) => {
                    for path in &info.deleted_files {
                        store.remove_file_metadata(path).await?;
                        updated += 1;
                        summary.push(format!("- {path}"));
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "deletion transaction rolled back, aborting update");
                    return Ok(updated);
                }
            }
        }

        for path in info.modified_files.iter().chain(info.new_files.iter()) {
            let is_new = info.new_files.contains(path);
            match self.ingest_one(path, store).await {
                Ok(true) => {
                    updated += 1;
                    self.failure_counts.remove(path);
                    summary.push(format!("{} {path}", if is_new { "+" } else { "*" }));
                }
                Ok(false) => {
                    // Empty content: skip silently, not a failure.
                }
                Err(err) => {
                    let count = self.failure_counts.entry(path.clone()).or_insert(0);
                    *count += 1;
                    tracing::warn!(path, error = %err, attempt = *count, "failed to ingest source");
                    if *count >= MAX_CONSECUTIVE_FAILURES {
                        tracing::error!(path, "giving up on source after repeated failures");
                        self.ignored.insert(path.clone());
                        self.failure_counts.remove(path);
                    }
                }
            }
        }

        if updated > 0 {
            store.persist().await?;
        }

        if !summary.is_empty() {
            tracing::info!(changes = %summary.join(", "), "incremental update applied");
        }

        Ok(updated)
    }

    /// Tear down every deleted source's chunk rows in one transaction, per
    /// spec §4.7: deletions abort as a unit, before any modification or new
    /// file is processed.
    async fn delete_all(&self, paths: &[String], store: &VectorStore) -> Result<()> {
        let mut tx = store.begin().await?;
        for path in paths {
            tx.delete_documents_by_source(path).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn ingest_one(&self, path: &str, store: &VectorStore) -> Result<bool> {
        let content = self.collector.fetch_source(path)?;
        if content.trim().is_empty() {
            return Ok(false);
        }

        let chunks = self.chunker.chunk(&content, path);
        if chunks.is_empty() {
            return Ok(false);
        }

        store.delete_documents_by_source(path).await?;

        let Some(embedding) = &self.embedding else {
            anyhow::bail!("embedding client not configured, cannot ingest '{path}'");
        };

        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = embedding.encode(&texts, EmbedKind::Document).await?;
            store.add_documents(batch, &vectors).await?;
        }

        let meta = FileMetadata {
            path: path.to_string(),
            last_modified: now_unix(),
            file_size: content.len() as i64,
            num_lines: content.lines().count() as i64,
        };
        store.upsert_file_metadata(&meta).await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkerConfig;
    use crate::config::{DatabaseConfig, DistanceMetric, SourceConfig, SourcePath, SourceKind};
    use crate::tokenizer::Tokenizer;
    use std::sync::Arc;

    fn store_config(dir: &std::path::Path) -> DatabaseConfig {
        DatabaseConfig {
            sqlite_path: dir.join("store.db"),
            index_path: dir.join("index.usearch"),
            vector_dim: 3,
            max_elements: 1024,
            distance_metric: DistanceMetric::Cosine,
        }
    }

    #[tokio::test]
    async fn detect_changes_classifies_new_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello world").unwrap();

        let store = VectorStore::open(&store_config(dir.path())).await.unwrap();
        let source_config = SourceConfig {
            paths: vec![SourcePath {
                kind: SourceKind::Directory,
                path: dir.path().to_string_lossy().to_string(),
                recursive: true,
                extensions: vec![".txt".to_string()],
                exclude: Vec::new(),
                url: None,
                headers: Default::default(),
                url_timeout_ms: 10_000,
            }],
            ..Default::default()
        };
        let collector = SourceCollector::new(source_config);
        let chunker = Chunker::new(Arc::new(Tokenizer::fallback()), ChunkerConfig::default());
        let updater = IncrementalUpdater::new(collector, chunker, None, 8);

        let info = updater.detect_changes(&store).await.unwrap();
        assert_eq!(info.new_files.len(), 1);
        assert!(info.modified_files.is_empty());
        assert!(info.deleted_files.is_empty());
    }

    #[tokio::test]
    async fn repeated_failures_quarantine_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(&store_config(dir.path())).await.unwrap();
        let collector = SourceCollector::new(SourceConfig::default());
        let chunker = Chunker::new(Arc::new(Tokenizer::fallback()), ChunkerConfig::default());
        // No embedding client configured: every ingest attempt fails.
        let mut updater = IncrementalUpdater::new(collector, chunker, None, 8);

        let info = UpdateInfo {
            new_files: vec!["missing/does-not-exist.txt".to_string()],
            ..Default::default()
        };

        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            let _ = updater.apply(&info, &store).await;
        }

        assert!(updater.ignored_files().contains("missing/does-not-exist.txt"));
    }
}
