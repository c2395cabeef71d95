//! Core data types shared across the ingestion and retrieval pipeline.
//!
//! These mirror the data model: a [`Chunk`] is the chunker's output and the
//! store's input; [`FileMetadata`] tracks what the updater has seen of a
//! source; [`SearchResult`] is what the retrieval planner and completion
//! client consume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The unit a chunk was split on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkUnit {
    Char,
    Line,
}

/// The content-type classification a chunk (and its source) was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Code,
    Text,
}

/// A bounded, token-counted slice of a source.
///
/// Produced by the chunker, consumed by the updater on the way into the
/// store. `chunk_id` is deterministic — `<doc_uri>_<ordinal>` — not random,
/// so re-chunking an unchanged source reproduces identical ids.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub doc_uri: String,
    pub chunk_id: String,
    pub text: String,
    pub raw: Option<String>,
    pub token_count: usize,
    pub start: usize,
    pub end: usize,
    pub unit: ChunkUnit,
    pub chunk_type: ChunkType,
}

impl Chunk {
    pub fn new(
        doc_uri: impl Into<String>,
        ordinal: usize,
        text: impl Into<String>,
        token_count: usize,
        start: usize,
        end: usize,
        unit: ChunkUnit,
        chunk_type: ChunkType,
    ) -> Self {
        let doc_uri = doc_uri.into();
        let chunk_id = format!("{doc_uri}_{ordinal}");
        Self {
            doc_uri,
            chunk_id,
            text: text.into(),
            raw: None,
            token_count,
            start,
            end,
            unit,
            chunk_type,
        }
    }
}

/// One row per ingested source, tracking what the updater last saw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub last_modified: i64,
    pub file_size: i64,
    pub num_lines: i64,
}

/// A raw item produced by the source collector before chunking.
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub source_id: String,
    pub is_url: bool,
    pub content: Option<String>,
    pub last_modified: i64,
    pub file_size: i64,
}

/// A result surfaced to the retrieval planner or the `/api/search` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub content: String,
    pub source_id: String,
    pub chunk_unit: Option<ChunkUnit>,
    pub chunk_type: Option<ChunkType>,
    /// The chunk id, or `None` for whole-source / injected content.
    pub chunk_id: Option<String>,
    pub start: Option<usize>,
    pub end: Option<usize>,
    pub similarity_score: f64,
}

impl SearchResult {
    /// A whole-source result (attachment or full-source injection), always
    /// scored 1.0 per spec.
    pub fn whole_source(source_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source_id: source_id.into(),
            chunk_unit: None,
            chunk_type: None,
            chunk_id: None,
            start: None,
            end: None,
            similarity_score: 1.0,
        }
    }
}

/// An inline attachment supplied with a chat request.
#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content: String,
}

/// A single chat message, OpenAI-shaped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Point-in-time counters and stats for `/api/stats` and `/metrics`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreStats {
    pub tracked_files: i64,
    pub live_chunks: i64,
    pub tombstoned_chunks: i64,
    pub vector_count: usize,
}

pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

pub fn to_iso(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|d| d.to_rfc3339())
        .unwrap_or_default()
}
