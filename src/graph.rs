//! Graph store abstraction and SQLite implementation.
//!
//! The pipeline only ever issues MERGE-style writes: nodes keyed by their
//! content-derived id, edges keyed by (source, target, kind). Re-running
//! any stage against the store converges instead of duplicating.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::errors::Result;

/// A node to merge, keyed by its stable id.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub id: String,
    pub kind: String,
    pub label: Option<String>,
    pub props: serde_json::Value,
}

/// An edge to merge, keyed by (source, target, kind).
#[derive(Debug, Clone)]
pub struct EdgeSpec {
    pub source_id: String,
    pub target_id: String,
    pub kind: String,
    pub weight: f64,
    pub props: serde_json::Value,
}

impl EdgeSpec {
    pub fn plain(source_id: &str, target_id: &str, kind: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            kind: kind.to_string(),
            weight: 1.0,
            props: serde_json::json!({}),
        }
    }
}

/// A chunk's structural source reference, as loaded into the graph.
#[derive(Debug, Clone)]
pub struct ChunkSource {
    pub chunk_id: String,
    pub source_message_id: String,
}

/// The graph database seen through the narrow interface the pipeline
/// needs: transactional merges plus the read queries the relationship
/// builder runs on.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Health check — verify the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Merge a batch of nodes in one transaction.
    async fn merge_nodes(&self, nodes: &[NodeSpec]) -> Result<()>;

    /// Merge a batch of edges in one transaction.
    async fn merge_edges(&self, edges: &[EdgeSpec]) -> Result<()>;

    async fn node_exists(&self, id: &str) -> Result<bool>;

    /// Every chunk node with the source-message reference it recorded.
    async fn chunk_sources(&self) -> Result<Vec<ChunkSource>>;

    /// (chat id, topic id) pairs via chunk membership, deduplicated.
    async fn chat_topics(&self) -> Result<Vec<(String, String)>>;

    async fn count_nodes(&self, kind: &str) -> Result<i64>;

    async fn count_edges(&self, kind: &str) -> Result<i64>;
}

/// SQLite-backed graph store over the `nodes`/`edges` tables.
pub struct SqliteGraphStore {
    pool: SqlitePool,
}

impl SqliteGraphStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn merge_nodes(&self, nodes: &[NodeSpec]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for node in nodes {
            sqlx::query(
                r#"
                INSERT INTO nodes (id, kind, label, props) VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    label = excluded.label,
                    props = excluded.props
                "#,
            )
            .bind(&node.id)
            .bind(&node.kind)
            .bind(&node.label)
            .bind(node.props.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn merge_edges(&self, edges: &[EdgeSpec]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for edge in edges {
            sqlx::query(
                r#"
                INSERT INTO edges (source_id, target_id, kind, weight, props)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(source_id, target_id, kind) DO UPDATE SET
                    weight = excluded.weight,
                    props = excluded.props
                "#,
            )
            .bind(&edge.source_id)
            .bind(&edge.target_id)
            .bind(&edge.kind)
            .bind(edge.weight)
            .bind(edge.props.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn node_exists(&self, id: &str) -> Result<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT id FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn chunk_sources(&self) -> Result<Vec<ChunkSource>> {
        let rows = sqlx::query("SELECT id, props FROM nodes WHERE kind = 'chunk' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut sources = Vec::with_capacity(rows.len());
        for row in rows {
            let chunk_id: String = row.get("id");
            let props: String = row.get("props");
            let props: serde_json::Value = serde_json::from_str(&props)?;
            let source_message_id = props
                .get("source_message_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            sources.push(ChunkSource {
                chunk_id,
                source_message_id,
            });
        }
        Ok(sources)
    }

    async fn chat_topics(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT p.target_id AS chat_id, t.target_id AS topic_id
            FROM edges p
            JOIN edges t ON t.source_id = p.source_id AND t.kind = 'IN_TOPIC'
            WHERE p.kind = 'PART_OF'
            ORDER BY chat_id, topic_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("chat_id"), row.get("topic_id")))
            .collect())
    }

    async fn count_nodes(&self, kind: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes WHERE kind = ?")
            .bind(kind)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_edges(&self, kind: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM edges WHERE kind = ?")
            .bind(kind)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
