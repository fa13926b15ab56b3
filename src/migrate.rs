use sqlx::SqlitePool;

use crate::errors::Result;

/// Create the graph-store and vector-store schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Graph nodes, keyed by content-derived id.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            label TEXT,
            props TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Graph edges, keyed by (source, target, kind) so merges can never
    // duplicate a relationship.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS edges (
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 1.0,
            props TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (source_id, target_id, kind)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vector store: one row per chunk hash, upserts overwrite.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            chunk_id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_nodes_kind ON nodes(kind)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_edges_kind ON edges(kind)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id)")
        .execute(pool)
        .await?;

    Ok(())
}
