//! Hybrid vector store: a SQLite relational store for chunk/file metadata
//! paired with a `usearch` HNSW ANN index, under one transactional
//! discipline.
//!
//! Writers (`add_document`, `delete_documents_by_source`, `compact`,
//! `clear`) are serialized against each other through `write_lock`; the ANN
//! index itself lives behind a `parking_lot::RwLock` so reads (`search`,
//! `get_stats`) never block on a writer holding the SQL transaction open —
//! they only block for the brief moment a writer applies its staged ANN
//! mutations at commit time.

mod ann;
mod schema;

use crate::config::{DatabaseConfig, DistanceMetric};
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{Chunk, ChunkType, ChunkUnit, FileMetadata, SearchResult, StoreStats};
use ann::AnnIndex;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is busy, try again")]
    Busy,
    #[error("vector has dimension {got}, expected {expected}")]
    DimensionMismatch { got: usize, expected: usize },
    #[error("store transaction failed: {0}")]
    Transaction(#[from] anyhow::Error),
}

pub struct VectorStore {
    pool: SqlitePool,
    index: Arc<RwLock<AnnIndex>>,
    index_path: PathBuf,
    vector_dim: usize,
    distance_metric: DistanceMetric,
    max_elements: usize,
    next_vector_id: AtomicI64,
    write_lock: Arc<Mutex<()>>,
}

/// A pending mutation to the ANN index, staged by a [`StoreTransaction`] and
/// only applied once the underlying SQL transaction has committed.
enum PendingOp {
    Insert { vector_id: u64, vector: Vec<f32> },
    Remove { vector_id: u64 },
}

/// One write transaction spanning both tables. Holds the SQL transaction
/// and the writer permit for its whole lifetime; dropping without calling
/// `commit` rolls back implicitly (via `sqlx::Transaction`'s `Drop`), but
/// callers should call `rollback` explicitly so the error is observable.
pub struct StoreTransaction {
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
    pending: Vec<PendingOp>,
    vector_dim: usize,
    index: Arc<RwLock<AnnIndex>>,
    next_vector_id: Arc<AtomicI64>,
    _writer_permit: OwnedMutexGuard<()>,
}

impl VectorStore {
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.sqlite_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.sqlite_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to open sqlite store")?;

        schema::run_migrations(&pool).await?;

        let live_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_rows WHERE deleted = 0")
            .fetch_one(&pool)
            .await?;
        let max_vector_id: Option<i64> =
            sqlx::query_scalar("SELECT MAX(vector_id) FROM chunk_rows WHERE deleted = 0")
                .fetch_one(&pool)
                .await?;

        let index = AnnIndex::load_or_new(
            &config.index_path,
            config.vector_dim,
            config.distance_metric,
            config.max_elements,
        )?;

        // Spec §9 open question: reconcile a crash between commit and
        // persist by rebuilding from live rows when the persisted ANN file
        // disagrees with the relational row count.
        let index = if index.size() as i64 != live_count {
            tracing::warn!(
                ann_size = index.size(),
                live_rows = live_count,
                "ANN index disagrees with live chunk rows, rebuilding from relational state"
            );
            Self::rebuild_index_from_rows(&pool, config.vector_dim, config.distance_metric, config.max_elements).await?
        } else {
            index
        };

        Ok(Self {
            pool,
            index: Arc::new(RwLock::new(index)),
            index_path: config.index_path.clone(),
            vector_dim: config.vector_dim,
            distance_metric: config.distance_metric,
            max_elements: config.max_elements,
            next_vector_id: AtomicI64::new(max_vector_id.map(|v| v + 1).unwrap_or(0)),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn rebuild_index_from_rows(
        pool: &SqlitePool,
        vector_dim: usize,
        metric: DistanceMetric,
        max_elements: usize,
    ) -> Result<AnnIndex> {
        let rows = sqlx::query("SELECT vector_id, embedding FROM chunk_rows WHERE deleted = 0")
            .fetch_all(pool)
            .await?;
        let mut index = AnnIndex::new(vector_dim, metric, rows.len().max(max_elements.min(1024)))?;
        for row in &rows {
            let vector_id: i64 = row.try_get("vector_id")?;
            let embedding: Vec<u8> = row.try_get("embedding")?;
            index.add(vector_id as u64, &blob_to_vec(&embedding))?;
        }
        Ok(index)
    }

    pub fn vector_dim(&self) -> usize {
        self.vector_dim
    }

    /// Begin a write transaction. Serialized against every other writer
    /// (including `compact`); readers are unaffected.
    pub async fn begin(&self) -> Result<StoreTransaction, StoreError> {
        let permit = self.write_lock.clone().lock_owned().await;
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Transaction(e.into()))?;
        Ok(StoreTransaction {
            tx: Some(tx),
            pending: Vec::new(),
            vector_dim: self.vector_dim,
            index: self.index.clone(),
            next_vector_id: Arc::new(AtomicI64::new(self.next_vector_id.load(Ordering::SeqCst))),
            _writer_permit: permit,
        })
    }

    /// Insert a single chunk + vector in its own transaction.
    pub async fn add_document(&self, chunk: &Chunk, vector: &[f32]) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        tx.add_document(chunk, vector).await?;
        self.finish(tx).await
    }

    /// Insert a batch of chunks + vectors in one transaction.
    pub async fn add_documents(&self, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            tx.add_document(chunk, vector).await?;
        }
        self.finish(tx).await
    }

    pub async fn delete_documents_by_source(&self, uri: &str) -> Result<usize, StoreError> {
        let mut tx = self.begin().await?;
        let n = tx.delete_documents_by_source(uri).await?;
        self.finish(tx).await?;
        Ok(n)
    }

    async fn finish(&self, tx: StoreTransaction) -> Result<(), StoreError> {
        let next_id = tx.next_vector_id.load(Ordering::SeqCst);
        tx.commit().await?;
        self.next_vector_id.fetch_max(next_id, Ordering::SeqCst);
        Ok(())
    }

    pub async fn remove_file_metadata(&self, uri: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM file_metadata WHERE path = ?")
            .bind(uri)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Transaction(e.into()))?;
        Ok(())
    }

    pub async fn upsert_file_metadata(&self, meta: &FileMetadata) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO file_metadata (path, last_modified, file_size, num_lines)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                last_modified = excluded.last_modified,
                file_size = excluded.file_size,
                num_lines = excluded.num_lines
            "#,
        )
        .bind(&meta.path)
        .bind(meta.last_modified)
        .bind(meta.file_size)
        .bind(meta.num_lines)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Transaction(e.into()))?;
        Ok(())
    }

    /// ANN top-`k` search, joined against live chunk rows, descending by
    /// similarity. Never returns a tombstoned row.
    pub async fn search(&self, query_vec: &[f32], k: usize) -> Result<Vec<SearchResult>, StoreError> {
        if query_vec.len() != self.vector_dim {
            return Err(StoreError::DimensionMismatch {
                got: query_vec.len(),
                expected: self.vector_dim,
            });
        }
        // Over-fetch to absorb tombstones the ANN index hasn't forgotten
        // about yet (removed lazily, reconciled at compact).
        let hits = {
            let index = self.index.read();
            index.search(query_vec, (k * 4).max(k + 8)).map_err(StoreError::Transaction)?
        };

        let mut results = Vec::with_capacity(k);
        for (vector_id, similarity) in hits {
            if results.len() >= k {
                break;
            }
            let row = sqlx::query(
                "SELECT chunk_id, doc_uri, text, token_count, start_pos, end_pos, unit, chunk_type \
                 FROM chunk_rows WHERE vector_id = ? AND deleted = 0",
            )
            .bind(vector_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Transaction(e.into()))?;

            let Some(row) = row else { continue };
            results.push(row_to_search_result(&row, similarity)?);
        }
        Ok(results)
    }

    pub async fn get_tracked_files(&self) -> Result<Vec<FileMetadata>, StoreError> {
        let rows = sqlx::query("SELECT path, last_modified, file_size, num_lines FROM file_metadata ORDER BY path")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Transaction(e.into()))?;
        rows.iter()
            .map(|row| {
                Ok(FileMetadata {
                    path: row.try_get("path").map_err(|e| StoreError::Transaction(e.into()))?,
                    last_modified: row.try_get("last_modified").map_err(|e| StoreError::Transaction(e.into()))?,
                    file_size: row.try_get("file_size").map_err(|e| StoreError::Transaction(e.into()))?,
                    num_lines: row.try_get("num_lines").map_err(|e| StoreError::Transaction(e.into()))?,
                })
            })
            .collect()
    }

    pub async fn get_chunk_counts_by_sources(&self) -> Result<HashMap<String, i64>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc_uri, COUNT(*) as n FROM chunk_rows WHERE deleted = 0 GROUP BY doc_uri",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Transaction(e.into()))?;

        let mut counts = HashMap::new();
        for row in rows {
            let uri: String = row.try_get("doc_uri").map_err(|e| StoreError::Transaction(e.into()))?;
            let n: i64 = row.try_get("n").map_err(|e| StoreError::Transaction(e.into()))?;
            counts.insert(uri, n);
        }
        Ok(counts)
    }

    pub async fn get_stats(&self) -> Result<StoreStats, StoreError> {
        let tracked_files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_metadata")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Transaction(e.into()))?;
        let live_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_rows WHERE deleted = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Transaction(e.into()))?;
        let tombstoned_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_rows WHERE deleted = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Transaction(e.into()))?;
        let vector_count = self.index.read().size();

        Ok(StoreStats {
            tracked_files,
            live_chunks,
            tombstoned_chunks,
            vector_count,
        })
    }

    /// Rewrite the ANN index with only live vectors, reassign dense ids,
    /// and drop tombstoned chunk rows. Exclusive: blocks every other
    /// writer, and briefly locks out readers while the index is swapped.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _permit = self.write_lock.clone().lock_owned().await;

        let rows = sqlx::query("SELECT chunk_id, vector_id, embedding FROM chunk_rows WHERE deleted = 0 ORDER BY vector_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Transaction(e.into()))?;

        let mut new_index = AnnIndex::new(self.vector_dim, self.distance_metric, rows.len().max(1024))
            .map_err(StoreError::Transaction)?;
        let mut remap = Vec::with_capacity(rows.len());
        for (new_id, row) in rows.iter().enumerate() {
            let chunk_id: String = row.try_get("chunk_id").map_err(|e| StoreError::Transaction(e.into()))?;
            let embedding: Vec<u8> = row.try_get("embedding").map_err(|e| StoreError::Transaction(e.into()))?;
            new_index
                .add(new_id as u64, &blob_to_vec(&embedding))
                .map_err(StoreError::Transaction)?;
            remap.push((chunk_id, new_id as i64));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Transaction(e.into()))?;
        for (chunk_id, new_id) in &remap {
            sqlx::query("UPDATE chunk_rows SET vector_id = ? WHERE chunk_id = ?")
                .bind(new_id)
                .bind(chunk_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Transaction(e.into()))?;
        }
        sqlx::query("DELETE FROM chunk_rows WHERE deleted = 1")
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Transaction(e.into()))?;
        tx.commit().await.map_err(|e| StoreError::Transaction(e.into()))?;

        *self.index.write() = new_index;
        self.next_vector_id.store(remap.len() as i64, Ordering::SeqCst);
        self.persist().await
    }

    /// Flush the relational WAL and write the ANN index atomically.
    pub async fn persist(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Transaction(e.into()))?;
        let index = self.index.read();
        index.save(&self.index_path).map_err(StoreError::Transaction)
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        let _permit = self.write_lock.clone().lock_owned().await;
        sqlx::query("DELETE FROM chunk_rows")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Transaction(e.into()))?;
        sqlx::query("DELETE FROM file_metadata")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Transaction(e.into()))?;
        *self.index.write() = AnnIndex::new(self.vector_dim, self.distance_metric, self.max_elements)
            .map_err(StoreError::Transaction)?;
        self.next_vector_id.store(0, Ordering::SeqCst);
        self.persist().await
    }
}

impl StoreTransaction {
    pub async fn add_document(&mut self, chunk: &Chunk, vector: &[f32]) -> Result<i64, StoreError> {
        if vector.len() != self.vector_dim {
            return Err(StoreError::DimensionMismatch {
                got: vector.len(),
                expected: self.vector_dim,
            });
        }
        let vector_id = self.next_vector_id.fetch_add(1, Ordering::SeqCst);

        let blob = vec_to_blob(vector);
        let unit = match chunk.unit {
            ChunkUnit::Char => "char",
            ChunkUnit::Line => "line",
        };
        let chunk_type = match chunk.chunk_type {
            ChunkType::Code => "code",
            ChunkType::Text => "text",
        };
        let tx = self.tx.as_mut().expect("transaction already finished");
        sqlx::query(
            r#"
            INSERT INTO chunk_rows
                (chunk_id, doc_uri, text, token_count, start_pos, end_pos, unit, chunk_type, vector_id, embedding, deleted)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(chunk_id) DO UPDATE SET
                text = excluded.text,
                token_count = excluded.token_count,
                start_pos = excluded.start_pos,
                end_pos = excluded.end_pos,
                unit = excluded.unit,
                chunk_type = excluded.chunk_type,
                vector_id = excluded.vector_id,
                embedding = excluded.embedding,
                deleted = 0
            "#,
        )
        .bind(&chunk.chunk_id)
        .bind(&chunk.doc_uri)
        .bind(&chunk.text)
        .bind(chunk.token_count as i64)
        .bind(chunk.start as i64)
        .bind(chunk.end as i64)
        .bind(unit)
        .bind(chunk_type)
        .bind(vector_id)
        .bind(&blob)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::Transaction(e.into()))?;

        self.pending.push(PendingOp::Insert {
            vector_id: vector_id as u64,
            vector: vector.to_vec(),
        });
        Ok(vector_id)
    }

    pub async fn delete_documents_by_source(&mut self, uri: &str) -> Result<usize, StoreError> {
        let tx = self.tx.as_mut().expect("transaction already finished");
        let rows = sqlx::query("SELECT vector_id FROM chunk_rows WHERE doc_uri = ? AND deleted = 0")
            .bind(uri)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| StoreError::Transaction(e.into()))?;

        for row in &rows {
            let vector_id: i64 = row.try_get("vector_id").map_err(|e| StoreError::Transaction(e.into()))?;
            self.pending.push(PendingOp::Remove {
                vector_id: vector_id as u64,
            });
        }

        sqlx::query("UPDATE chunk_rows SET deleted = 1 WHERE doc_uri = ? AND deleted = 0")
            .bind(uri)
            .execute(&mut **self.tx.as_mut().expect("transaction already finished"))
            .await
            .map_err(|e| StoreError::Transaction(e.into()))?;

        Ok(rows.len())
    }

    pub async fn commit(mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().expect("transaction already finished");
        tx.commit().await.map_err(|e| StoreError::Transaction(e.into()))?;

        let mut index = self.index.write();
        for op in self.pending.drain(..) {
            match op {
                PendingOp::Insert { vector_id, vector } => {
                    index.add(vector_id, &vector).map_err(StoreError::Transaction)?;
                }
                PendingOp::Remove { vector_id } => {
                    index.remove(vector_id).map_err(StoreError::Transaction)?;
                }
            }
        }
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().expect("transaction already finished");
        tx.rollback().await.map_err(|e| StoreError::Transaction(e.into()))?;
        self.pending.clear();
        Ok(())
    }
}

fn row_to_search_result(row: &sqlx::sqlite::SqliteRow, similarity: f64) -> Result<SearchResult, StoreError> {
    let unit: String = row.try_get("unit").map_err(|e| StoreError::Transaction(e.into()))?;
    let chunk_type: String = row.try_get("chunk_type").map_err(|e| StoreError::Transaction(e.into()))?;
    Ok(SearchResult {
        content: row.try_get("text").map_err(|e| StoreError::Transaction(e.into()))?,
        source_id: row.try_get("doc_uri").map_err(|e| StoreError::Transaction(e.into()))?,
        chunk_unit: Some(if unit == "line" { ChunkUnit::Line } else { ChunkUnit::Char }),
        chunk_type: Some(if chunk_type == "code" { ChunkType::Code } else { ChunkType::Text }),
        chunk_id: row.try_get("chunk_id").ok(),
        start: row.try_get::<i64, _>("start_pos").ok().map(|v| v as usize),
        end: row.try_get::<i64, _>("end_pos").ok().map(|v| v as usize),
        similarity_score: similarity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn test_config(dir: &std::path::Path) -> DatabaseConfig {
        DatabaseConfig {
            sqlite_path: dir.join("store.db"),
            index_path: dir.join("index.usearch"),
            vector_dim: 3,
            max_elements: 1024,
            distance_metric: DistanceMetric::Cosine,
        }
    }

    #[tokio::test]
    async fn add_then_search_returns_the_closest_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(&test_config(dir.path())).await.unwrap();

        let chunk = Chunk::new("file:///a.txt", 0, "hello world", 2, 0, 11, ChunkUnit::Char, ChunkType::Text);
        store.add_document(&chunk, &[1.0, 0.0, 0.0]).await.unwrap();

        let results = store.search(&[1.0, 0.0, 0.0], 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_id, "file:///a.txt");
        assert!(results[0].similarity_score > 0.99);
    }

    #[tokio::test]
    async fn delete_by_source_hides_future_search_hits() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(&test_config(dir.path())).await.unwrap();

        let chunk = Chunk::new("file:///a.txt", 0, "hello", 1, 0, 5, ChunkUnit::Char, ChunkType::Text);
        store.add_document(&chunk, &[1.0, 0.0, 0.0]).await.unwrap();
        let deleted = store.delete_documents_by_source("file:///a.txt").await.unwrap();
        assert_eq!(deleted, 1);

        let results = store.search(&[1.0, 0.0, 0.0], 5).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn compact_drops_tombstoned_rows_and_keeps_live_ones() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(&test_config(dir.path())).await.unwrap();

        let a = Chunk::new("file:///a.txt", 0, "a", 1, 0, 1, ChunkUnit::Char, ChunkType::Text);
        let b = Chunk::new("file:///b.txt", 0, "b", 1, 0, 1, ChunkUnit::Char, ChunkType::Text);
        store.add_document(&a, &[1.0, 0.0, 0.0]).await.unwrap();
        store.add_document(&b, &[0.0, 1.0, 0.0]).await.unwrap();
        store.delete_documents_by_source("file:///a.txt").await.unwrap();

        store.compact().await.unwrap();

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.live_chunks, 1);
        assert_eq!(stats.tombstoned_chunks, 0);
        assert_eq!(stats.vector_count, 1);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(&test_config(dir.path())).await.unwrap();
        let err = store.search(&[1.0, 0.0], 5).await.unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
    }
}
