//! Positioning stage: embeddings stream → 2-D layout coordinates.
//!
//! Dimensionality reduction proper is an external concern; the pipeline
//! only needs the envelope — vector in, `(x, y)` out, deterministic for
//! equal input. The built-in implementation projects onto two fixed
//! pseudo-random axes derived from a seed string, which is stable across
//! runs and processes.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::embedding::vector_digest;
use crate::errors::Result;
use crate::models::{EmbeddingRecord, PositionRecord};
use crate::runner::{ItemOutcome, Stage, StageOptions, StageRunner, Transform};
use crate::stream::{read_stream, StreamWriter};

/// Capability interface for 2-D layout backends.
pub trait Positioner: Send + Sync {
    fn name(&self) -> &str;
    fn project(&self, vector: &[f32]) -> (f32, f32);
}

/// Deterministic random projection onto two seed-derived axes.
pub struct ProjectionPositioner {
    seed: String,
}

impl ProjectionPositioner {
    pub fn new(seed: &str) -> Self {
        Self {
            seed: seed.to_string(),
        }
    }

    fn axis(&self, tag: &str, dims: usize) -> Vec<f32> {
        let mut axis = Vec::with_capacity(dims);
        let mut seed = format!("{}/{}", self.seed, tag).into_bytes();
        while axis.len() < dims {
            let mut hasher = Sha256::new();
            hasher.update(&seed);
            let block = hasher.finalize();
            for word in block.chunks_exact(4) {
                if axis.len() >= dims {
                    break;
                }
                let raw = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                axis.push((raw % 2000) as f32 / 1000.0 - 1.0);
            }
            seed = block.to_vec();
        }
        axis
    }
}

impl Positioner for ProjectionPositioner {
    fn name(&self) -> &str {
        "seeded-projection"
    }

    fn project(&self, vector: &[f32]) -> (f32, f32) {
        let x_axis = self.axis("x", vector.len());
        let y_axis = self.axis("y", vector.len());
        let x: f32 = vector.iter().zip(x_axis.iter()).map(|(v, a)| v * a).sum();
        let y: f32 = vector.iter().zip(y_axis.iter()).map(|(v, a)| v * a).sum();
        (x, y)
    }
}

struct PositionTransform {
    positioner: Box<dyn Positioner>,
}

#[async_trait]
impl Transform<EmbeddingRecord, PositionRecord> for PositionTransform {
    async fn process(&self, batch: &[EmbeddingRecord]) -> Result<Vec<ItemOutcome<PositionRecord>>> {
        Ok(batch
            .iter()
            .map(|record| {
                let (x, y) = self.positioner.project(&record.vector);
                ItemOutcome::Produced(PositionRecord {
                    chunk_id: record.chunk_id.clone(),
                    x,
                    y,
                })
            })
            .collect())
    }
}

/// Run the positioning stage.
pub async fn run_position(
    config: &Config,
    options: StageOptions,
    check_only: bool,
) -> anyhow::Result<()> {
    if check_only {
        println!("position (check-only)");
        println!("  no external dependencies");
        println!("ok");
        return Ok(());
    }

    let transform = PositionTransform {
        positioner: Box::new(ProjectionPositioner::new("atlas-layout")),
    };
    let key_fn =
        |record: &EmbeddingRecord| Ok((record.chunk_id.clone(), vector_digest(&record.vector)));

    let dry_run = options.dry_run;
    let mut runner = StageRunner::new(config, Stage::Position, options)?;
    let upstream = read_stream::<EmbeddingRecord>(&config.streams_dir(), "embeddings")?;

    let report = if dry_run {
        runner
            .run(upstream, key_fn, &transform, |_: &[PositionRecord]| Ok(()), "dry-run")
            .await?
    } else {
        let mut writer = StreamWriter::open(&config.streams_dir(), "positions")?;
        let locator = writer.path().display().to_string();
        runner
            .run(
                upstream,
                key_fn,
                &transform,
                |batch: &[PositionRecord]| writer.append_batch(batch),
                &locator,
            )
            .await?
    };

    println!("position{}", if dry_run { " (dry-run)" } else { "" });
    println!("  embeddings scanned: {}", report.scanned);
    println!("  already positioned: {}", report.skipped);
    println!("  positioned: {}", report.processed);
    if report.failed > 0 {
        println!("  failed: {}", report.failed);
    }
    println!("ok");
    Ok(())
}
