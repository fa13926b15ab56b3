//! Embedding stage: chunks stream → embeddings stream + vector store.
//!
//! The state store is keyed by chunk hash, so re-running after new
//! archives arrive embeds only the chunks that were not already sent to
//! the provider. Vector-store writes are upserts keyed by the same hash; a
//! forced re-embed overwrites rather than duplicates.

use anyhow::bail;
use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::errors::{PipelineError, Result};
use crate::models::{ChunkRecord, EmbeddingRecord};
use crate::runner::{ItemOutcome, Stage, StageOptions, StageRunner, Transform};
use crate::stream::{read_stream, StreamWriter};
use crate::vectors;

struct EmbedTransform {
    provider: Box<dyn EmbeddingProvider>,
    pool: SqlitePool,
    batch_size: usize,
}

#[async_trait]
impl Transform<ChunkRecord, EmbeddingRecord> for EmbedTransform {
    async fn process(&self, batch: &[ChunkRecord]) -> Result<Vec<ItemOutcome<EmbeddingRecord>>> {
        let mut outcomes = Vec::with_capacity(batch.len());

        // The provider has its own batch ceiling, independent of the
        // runner's.
        for sub in batch.chunks(self.batch_size.max(1)) {
            let texts: Vec<String> = sub.iter().map(|c| c.content.clone()).collect();
            let vectors = self.provider.embed(&texts).await?;
            if vectors.len() != sub.len() {
                return Err(PipelineError::Transform(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    sub.len()
                )));
            }
            for (chunk, vector) in sub.iter().zip(vectors.into_iter()) {
                let record = EmbeddingRecord {
                    chunk_id: chunk.id.clone(),
                    model: self.provider.model_name().to_string(),
                    vector,
                };
                vectors::upsert_vector(&self.pool, &record).await?;
                outcomes.push(ItemOutcome::Produced(record));
            }
        }

        Ok(outcomes)
    }
}

/// Run the embedding stage.
pub async fn run_embed(
    config: &Config,
    options: StageOptions,
    check_only: bool,
) -> anyhow::Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    if check_only {
        let provider = embedding::create_provider(&config.embedding)?;
        let pool = db::connect(&config.storage.db_path).await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        pool.close().await;
        println!("embed (check-only)");
        println!("  provider: {}", provider.model_name());
        println!("  vector store reachable");
        println!("ok");
        return Ok(());
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let model_name = provider.model_name().to_string();
    let pool = db::connect(&config.storage.db_path).await?;
    crate::migrate::run_migrations(&pool).await?;

    let dry_run = options.dry_run;
    let mut runner = StageRunner::new(config, Stage::Embed, options)?;
    let upstream = read_stream::<ChunkRecord>(&config.streams_dir(), "chunks")?;
    let transform = EmbedTransform {
        provider,
        pool: pool.clone(),
        batch_size: config.embedding.batch_size,
    };
    let key_fn = |chunk: &ChunkRecord| Ok((chunk.id.clone(), chunk.digest.clone()));

    let report = if dry_run {
        runner
            .run(upstream, key_fn, &transform, |_: &[EmbeddingRecord]| Ok(()), "dry-run")
            .await?
    } else {
        let mut writer = StreamWriter::open(&config.streams_dir(), "embeddings")?;
        let locator = writer.path().display().to_string();
        runner
            .run(
                upstream,
                key_fn,
                &transform,
                |batch: &[EmbeddingRecord]| writer.append_batch(batch),
                &locator,
            )
            .await?
    };

    pool.close().await;

    println!("embed{}", if dry_run { " (dry-run)" } else { "" });
    println!("  model: {}", model_name);
    println!("  chunks scanned: {}", report.scanned);
    println!("  already embedded: {}", report.skipped);
    println!("  embedded: {}", report.processed);
    if report.failed > 0 {
        println!("  failed: {}", report.failed);
    }
    println!("ok");
    Ok(())
}
