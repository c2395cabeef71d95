//! Relational schema for the two tables backing the store: tracked-file
//! metadata and chunk rows. Migrations are idempotent (`CREATE TABLE IF NOT
//! EXISTS`), matching the ambient crate's migration style.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_metadata (
            path TEXT PRIMARY KEY,
            last_modified INTEGER NOT NULL,
            file_size INTEGER NOT NULL,
            num_lines INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_rows (
            chunk_id TEXT PRIMARY KEY,
            doc_uri TEXT NOT NULL,
            text TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            start_pos INTEGER NOT NULL,
            end_pos INTEGER NOT NULL,
            unit TEXT NOT NULL,
            chunk_type TEXT NOT NULL,
            vector_id INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (doc_uri) REFERENCES file_metadata(path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_rows_doc_uri ON chunk_rows(doc_uri)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_rows_vector_id ON chunk_rows(vector_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_rows_deleted ON chunk_rows(deleted)")
        .execute(pool)
        .await?;

    Ok(())
}
