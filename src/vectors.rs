//! Vector store writes.
//!
//! Vectors are keyed by the same chunk content hash used everywhere else,
//! so re-embedding an item overwrites rather than duplicates its entry.

use sqlx::SqlitePool;

use crate::embedding::vec_to_blob;
use crate::errors::Result;
use crate::models::EmbeddingRecord;

/// Upsert one embedding, keyed by chunk hash.
pub async fn upsert_vector(pool: &SqlitePool, record: &EmbeddingRecord) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO vectors (chunk_id, model, dims, embedding, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            embedding = excluded.embedding,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&record.chunk_id)
    .bind(&record.model)
    .bind(record.vector.len() as i64)
    .bind(vec_to_blob(&record.vector))
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn count_vectors(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    #[tokio::test]
    async fn test_upsert_overwrites_not_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = db::connect(&tmp.path().join("atlas.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();

        let mut record = EmbeddingRecord {
            chunk_id: "chunk_abc".into(),
            model: "mock-embedder".into(),
            vector: vec![1.0, 0.0],
        };
        upsert_vector(&pool, &record).await.unwrap();

        record.vector = vec![0.0, 1.0];
        upsert_vector(&pool, &record).await.unwrap();

        assert_eq!(count_vectors(&pool).await.unwrap(), 1);
        pool.close().await;
    }
}
