//! Tagging stage: chunks stream → tags stream.
//!
//! Each chunk goes to the LLM provider as an `{id, content}` pair; the
//! provider answers per item, so one rejected chunk is logged and left for
//! the next run while the rest of its batch lands.

use anyhow::bail;
use async_trait::async_trait;

use crate::config::Config;
use crate::errors::Result;
use crate::llm::{self, LlmProvider, TagInput};
use crate::models::{ChunkRecord, TagRecord};
use crate::runner::{ItemOutcome, Stage, StageOptions, StageRunner, Transform};
use crate::stream::{read_stream, StreamWriter};

struct TagTransform {
    provider: Box<dyn LlmProvider>,
    batch_size: usize,
}

#[async_trait]
impl Transform<ChunkRecord, TagRecord> for TagTransform {
    async fn process(&self, batch: &[ChunkRecord]) -> Result<Vec<ItemOutcome<TagRecord>>> {
        let mut outcomes = Vec::with_capacity(batch.len());

        for sub in batch.chunks(self.batch_size.max(1)) {
            let inputs: Vec<TagInput> = sub
                .iter()
                .map(|chunk| TagInput {
                    id: chunk.id.clone(),
                    content: chunk.content.clone(),
                })
                .collect();
            let tagged = self.provider.tag(&inputs).await?;
            for (chunk, outcome) in sub.iter().zip(tagged.into_iter()) {
                outcomes.push(match outcome {
                    ItemOutcome::Produced(tags) => ItemOutcome::Produced(TagRecord {
                        chunk_id: chunk.id.clone(),
                        chat_id: chunk.chat_id.clone(),
                        tags,
                    }),
                    ItemOutcome::Failed { reason } => ItemOutcome::Failed { reason },
                });
            }
        }

        Ok(outcomes)
    }
}

/// Run the tagging stage.
pub async fn run_tag(
    config: &Config,
    options: StageOptions,
    check_only: bool,
) -> anyhow::Result<()> {
    if !config.llm.is_enabled() {
        bail!("LLM provider is disabled. Set [llm] provider in config.");
    }

    if check_only {
        let provider = llm::create_provider(&config.llm)?;
        println!("tag (check-only)");
        println!("  provider: {}", provider.name());
        println!("ok");
        return Ok(());
    }

    let provider = llm::create_provider(&config.llm)?;
    let provider_name = provider.name().to_string();

    let dry_run = options.dry_run;
    let mut runner = StageRunner::new(config, Stage::Tag, options)?;
    let upstream = read_stream::<ChunkRecord>(&config.streams_dir(), "chunks")?;
    let transform = TagTransform {
        provider,
        batch_size: config.llm.batch_size,
    };
    let key_fn = |chunk: &ChunkRecord| Ok((chunk.id.clone(), chunk.digest.clone()));

    let report = if dry_run {
        runner
            .run(upstream, key_fn, &transform, |_: &[TagRecord]| Ok(()), "dry-run")
            .await?
    } else {
        let mut writer = StreamWriter::open(&config.streams_dir(), "tags")?;
        let locator = writer.path().display().to_string();
        runner
            .run(
                upstream,
                key_fn,
                &transform,
                |batch: &[TagRecord]| writer.append_batch(batch),
                &locator,
            )
            .await?
    };

    println!("tag{}", if dry_run { " (dry-run)" } else { "" });
    println!("  provider: {}", provider_name);
    println!("  chunks scanned: {}", report.scanned);
    println!("  already tagged: {}", report.skipped);
    println!("  tagged: {}", report.processed);
    if report.failed > 0 {
        println!("  failed: {}", report.failed);
    }
    println!("ok");
    Ok(())
}
