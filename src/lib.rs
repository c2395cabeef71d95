//! # ragline
//!
//! A local-first retrieval-augmented-generation service: collect sources,
//! chunk them, embed and index them in a hybrid SQLite + HNSW vector store,
//! and answer chat questions over them through a streaming HTTP facade (or
//! the equivalent CLI surface).
//!
//! ## Data flow
//!
//! ```text
//! Collector ─▶ Chunker ─▶ Embedding Client ─▶ Vector Store
//!                                                  │
//!   HTTP/CLI ─▶ Retrieval Planner ─▶ (Embedding Client, Vector Store,
//!                Source Collector) ─▶ Completion Client ─▶ SSE/stdout
//! ```
//!
//! The [`updater`] wraps ingestion for incremental re-sync; the
//! [`lifecycle`] watcher invokes it on a timer. The CLI (`src/main.rs`) is a
//! second front door onto the same components the [`http`] facade exposes.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | JSON configuration loading, `${VAR}` substitution, validation |
//! | [`models`] | Core data types: `Chunk`, `FileMetadata`, `SearchResult`, ... |
//! | [`tokenizer`] | WordPiece-style token count estimator |
//! | [`source`] | Directory/file/URL source collection and related-source lookup |
//! | [`chunker`] | Content-aware text/code chunking |
//! | [`embedding`] | Bespoke multi-API embedding client plus a pluggable provider abstraction |
//! | [`completion`] | Prompt assembly and SSE-streaming chat completions |
//! | [`store`] | Hybrid SQLite + HNSW vector store |
//! | [`updater`] | Incremental change detection and re-ingestion |
//! | [`planner`] | Chat context assembly (retrieval planning) |
//! | [`auth`] | Admin password storage and HS256 bearer tokens |
//! | [`lifecycle`] | Signal handling, the watcher loop, graceful shutdown |
//! | [`http`] | JSON/SSE HTTP facade (Axum) |
//!
//! ## Configuration
//!
//! ragline is configured via a JSON file (default: `config.json`, overridable
//! with `--config <path>`). See [`config`] for all available sections and
//! [`config::load_config`] for validation rules.

pub mod auth;
pub mod chunker;
pub mod completion;
pub mod config;
pub mod embedding;
pub mod http;
pub mod lifecycle;
pub mod models;
pub mod planner;
pub mod source;
pub mod store;
pub mod tokenizer;
pub mod updater;
