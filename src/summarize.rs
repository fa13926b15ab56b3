//! Summarization stage: topic membership → generated topic summaries.
//!
//! A topic's identity here is content-addressed over its member set: the
//! state key is the fingerprint of {cluster id, sorted member chunk ids}.
//! When new chunks join a topic the fingerprint changes, the topic counts
//! as unseen, and a fresh summary is generated; the load stage keeps the
//! latest summary per cluster id.

use std::collections::HashMap;

use anyhow::bail;
use async_trait::async_trait;

use crate::config::Config;
use crate::errors::{PipelineError, Result};
use crate::hashing;
use crate::llm::{self, top_keywords, LlmProvider};
use crate::models::{AssignmentRecord, ChunkRecord, TopicSummary};
use crate::runner::{ItemOutcome, Stage, StageOptions, StageRunner, Transform};
use crate::stream::{read_all, StreamWriter};

/// Characters of member content sampled into the summarization prompt.
const SAMPLE_BUDGET: usize = 4000;

/// One topic awaiting summarization.
#[derive(Debug, Clone)]
struct TopicCandidate {
    cluster_id: i64,
    member_ids: Vec<String>,
    sample: String,
    keywords: Vec<String>,
}

struct SummarizeTransform {
    provider: Box<dyn LlmProvider>,
}

#[async_trait]
impl Transform<TopicCandidate, TopicSummary> for SummarizeTransform {
    async fn process(&self, batch: &[TopicCandidate]) -> Result<Vec<ItemOutcome<TopicSummary>>> {
        let mut outcomes = Vec::with_capacity(batch.len());
        for candidate in batch {
            match self.provider.summarize(&candidate.sample).await {
                Ok(summary) => {
                    let fingerprint = hashing::topic_fingerprint(
                        candidate.cluster_id,
                        &candidate.member_ids,
                    )?;
                    outcomes.push(ItemOutcome::Produced(TopicSummary {
                        cluster_id: candidate.cluster_id,
                        summary,
                        keywords: candidate.keywords.clone(),
                        size: candidate.member_ids.len(),
                        members_digest: fingerprint.digest,
                    }));
                }
                Err(e @ PipelineError::Unavailable(_)) => return Err(e),
                Err(e) => outcomes.push(ItemOutcome::Failed {
                    reason: e.to_string(),
                }),
            }
        }
        Ok(outcomes)
    }
}

/// Group current assignments into topic candidates. The last assignment
/// per chunk wins, so a forced re-cluster supersedes older rows in the
/// append-only stream.
fn collect_candidates(
    assignments: &[AssignmentRecord],
    chunks: &HashMap<String, String>,
    min_cluster_size: usize,
) -> Vec<TopicCandidate> {
    let mut latest: HashMap<&str, i64> = HashMap::new();
    for assignment in assignments {
        latest.insert(&assignment.chunk_id, assignment.cluster_id);
    }

    let mut members: HashMap<i64, Vec<String>> = HashMap::new();
    for (chunk_id, cluster_id) in latest {
        members
            .entry(cluster_id)
            .or_default()
            .push(chunk_id.to_string());
    }

    let mut candidates: Vec<TopicCandidate> = members
        .into_iter()
        .filter(|(_, ids)| ids.len() >= min_cluster_size)
        .map(|(cluster_id, mut member_ids)| {
            member_ids.sort_unstable();
            let mut sample = String::new();
            for id in &member_ids {
                if sample.len() >= SAMPLE_BUDGET {
                    break;
                }
                if let Some(content) = chunks.get(id) {
                    let remaining = SAMPLE_BUDGET - sample.len();
                    let mut take = content.len().min(remaining);
                    while !content.is_char_boundary(take) {
                        take -= 1;
                    }
                    sample.push_str(&content[..take]);
                    sample.push_str("\n\n");
                }
            }
            let keywords = top_keywords(&sample, 5);
            TopicCandidate {
                cluster_id,
                member_ids,
                sample,
                keywords,
            }
        })
        .collect();

    candidates.sort_by_key(|c| c.cluster_id);
    candidates
}

/// Run the summarization stage.
pub async fn run_summarize(
    config: &Config,
    options: StageOptions,
    check_only: bool,
) -> anyhow::Result<()> {
    if !config.llm.is_enabled() {
        bail!("LLM provider is disabled. Set [llm] provider in config.");
    }

    if check_only {
        let provider = llm::create_provider(&config.llm)?;
        println!("summarize (check-only)");
        println!("  provider: {}", provider.name());
        println!("ok");
        return Ok(());
    }

    let streams_dir = config.streams_dir();
    let assignments: Vec<AssignmentRecord> = read_all(&streams_dir, "assignments")?;
    let chunks: HashMap<String, String> = read_all::<ChunkRecord>(&streams_dir, "chunks")?
        .into_iter()
        .map(|chunk| (chunk.id, chunk.content))
        .collect();
    let candidates =
        collect_candidates(&assignments, &chunks, config.clustering.min_cluster_size);

    let transform = SummarizeTransform {
        provider: llm::create_provider(&config.llm)?,
    };
    let key_fn = |candidate: &TopicCandidate| {
        let fingerprint =
            hashing::topic_fingerprint(candidate.cluster_id, &candidate.member_ids)?;
        Ok((fingerprint.id, fingerprint.digest))
    };

    let dry_run = options.dry_run;
    let mut runner = StageRunner::new(config, Stage::Summarize, options)?;
    let upstream = candidates.into_iter().map(Ok);

    let report = if dry_run {
        runner
            .run(upstream, key_fn, &transform, |_: &[TopicSummary]| Ok(()), "dry-run")
            .await?
    } else {
        let mut writer = StreamWriter::open(&streams_dir, "summaries")?;
        let locator = writer.path().display().to_string();
        runner
            .run(
                upstream,
                key_fn,
                &transform,
                |batch: &[TopicSummary]| writer.append_batch(batch),
                &locator,
            )
            .await?
    };

    println!("summarize{}", if dry_run { " (dry-run)" } else { "" });
    println!("  topics scanned: {}", report.scanned);
    println!("  already summarized: {}", report.skipped);
    println!("  summarized: {}", report.processed);
    if report.failed > 0 {
        println!("  failed: {}", report.failed);
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(chunk: &str, chat: &str, cluster: i64) -> AssignmentRecord {
        AssignmentRecord {
            chunk_id: chunk.into(),
            chat_id: chat.into(),
            cluster_id: cluster,
        }
    }

    #[test]
    fn test_small_topics_filtered() {
        let assignments = vec![
            assignment("chunk_a", "chat_1", 0),
            assignment("chunk_b", "chat_1", 0),
            assignment("chunk_c", "chat_2", 1),
        ];
        let chunks: HashMap<String, String> = [
            ("chunk_a", "rust compiler errors"),
            ("chunk_b", "rust borrow checker"),
            ("chunk_c", "gardening tips"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let candidates = collect_candidates(&assignments, &chunks, 2);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].cluster_id, 0);
        assert_eq!(candidates[0].member_ids.len(), 2);
        assert!(candidates[0].keywords.contains(&"rust".to_string()));
    }

    #[test]
    fn test_last_assignment_wins() {
        let assignments = vec![
            assignment("chunk_a", "chat_1", 0),
            assignment("chunk_b", "chat_1", 0),
            // Re-clustered later: chunk_b moved to topic 1.
            assignment("chunk_b", "chat_1", 1),
            assignment("chunk_c", "chat_2", 1),
        ];
        let chunks = HashMap::new();
        let candidates = collect_candidates(&assignments, &chunks, 2);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].cluster_id, 1);
    }

    #[test]
    fn test_membership_change_changes_key() {
        let a = hashing::topic_fingerprint(0, &["chunk_a".into(), "chunk_b".into()]).unwrap();
        let b = hashing::topic_fingerprint(0, &["chunk_a".into(), "chunk_b".into(), "chunk_c".into()])
            .unwrap();
        assert_ne!(a.id, b.id);
    }
}
