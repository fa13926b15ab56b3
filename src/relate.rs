//! Relationship builder: derived edges over already-loaded graph state.
//!
//! Two independent derivations, both re-runnable to a fixed point:
//!
//! - **Structural linking** resolves each chunk's recorded source-message
//!   reference and merges a `HAS_CHUNK` edge from the message. Chunking
//!   and ingestion run independently and never see each other's keys;
//!   this pass reconnects their output inside the graph.
//! - **Similarity derivation** scores every unordered chat pair by
//!   Jaccard overlap of their topic sets and merges a `SIMILAR_TO` edge
//!   where the score clears the configured threshold.
//!
//! Neither derivation is authoritative: both can always be recomputed
//! from message/chunk/topic state, and recomputing refreshes edge
//! weights without changing edge counts.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::config::Config;
use crate::db;
use crate::errors::{PipelineError, Result};
use crate::graph::{EdgeSpec, GraphStore, SqliteGraphStore};
use crate::migrate;

/// Parse a composite message reference (`<chat_id>:<position>`).
///
/// This is the only place the id-composition scheme is interpreted. The
/// split is on the LAST `:` and both sides are validated; anything
/// ambiguous is a [`PipelineError::ReferenceResolution`], never a silent
/// wrong match.
pub fn parse_message_ref(reference: &str) -> Result<(String, usize)> {
    let (chat_id, position) = reference.rsplit_once(':').ok_or_else(|| {
        PipelineError::ReferenceResolution(format!("no separator in `{}`", reference))
    })?;
    if chat_id.is_empty() || !chat_id.starts_with("chat_") {
        return Err(PipelineError::ReferenceResolution(format!(
            "`{}` does not name a chat",
            reference
        )));
    }
    let position: usize = position.parse().map_err(|_| {
        PipelineError::ReferenceResolution(format!(
            "`{}` has a non-numeric position",
            reference
        ))
    })?;
    Ok((chat_id.to_string(), position))
}

/// Jaccard-style overlap of two topic sets:
/// |shared| / (|a| + |b| − |shared|).
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> (f64, usize) {
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    if union == 0 {
        return (0.0, 0);
    }
    (shared as f64 / union as f64, shared)
}

/// Derive the similarity edges for the given per-chat topic sets. Pairs
/// are enumerated once in canonical order (id(A) < id(B)), so no
/// self-edges and no duplicate unordered pairs.
pub fn similarity_edges(
    topic_sets: &BTreeMap<String, BTreeSet<String>>,
    threshold: f64,
) -> Vec<EdgeSpec> {
    let chats: Vec<(&String, &BTreeSet<String>)> = topic_sets.iter().collect();
    let mut edges = Vec::new();

    for (i, (chat_a, topics_a)) in chats.iter().enumerate() {
        for (chat_b, topics_b) in chats.iter().skip(i + 1) {
            let (score, shared) = jaccard(topics_a, topics_b);
            if score >= threshold && shared > 0 {
                edges.push(EdgeSpec {
                    source_id: (*chat_a).clone(),
                    target_id: (*chat_b).clone(),
                    kind: "SIMILAR_TO".into(),
                    weight: score,
                    props: serde_json::json!({ "shared_topics": shared }),
                });
            }
        }
    }

    edges
}

/// Counters for one relationship-builder run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LinkReport {
    pub chunks_seen: usize,
    pub links_merged: usize,
    pub unresolved: usize,
    pub pairs_scored: usize,
    pub similar_edges: usize,
}

/// Structural linking: message → chunk containment edges, merged in
/// bounded batches.
pub async fn link_structural(
    store: &dyn GraphStore,
    batch_size: usize,
) -> Result<LinkReport> {
    let sources = store.chunk_sources().await?;
    let mut report = LinkReport {
        chunks_seen: sources.len(),
        ..Default::default()
    };

    for batch in sources.chunks(batch_size.max(1)) {
        let mut edges = Vec::with_capacity(batch.len());
        for source in batch {
            match parse_message_ref(&source.source_message_id) {
                Ok(_) => {
                    if store.node_exists(&source.source_message_id).await? {
                        edges.push(EdgeSpec::plain(
                            &source.source_message_id,
                            &source.chunk_id,
                            "HAS_CHUNK",
                        ));
                    } else {
                        warn!(
                            chunk = %source.chunk_id,
                            reference = %source.source_message_id,
                            "source message not in graph, skipping link"
                        );
                        report.unresolved += 1;
                    }
                }
                Err(e) => {
                    warn!(chunk = %source.chunk_id, error = %e, "unresolvable source reference");
                    report.unresolved += 1;
                }
            }
        }
        report.links_merged += edges.len();
        store.merge_edges(&edges).await?;
    }

    Ok(report)
}

/// Similarity derivation: chat ↔ chat edges over shared topic membership.
pub async fn link_similarity(
    store: &dyn GraphStore,
    threshold: f64,
    batch_size: usize,
) -> Result<(usize, usize)> {
    let mut topic_sets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (chat_id, topic_id) in store.chat_topics().await? {
        topic_sets.entry(chat_id).or_default().insert(topic_id);
    }

    let n = topic_sets.len();
    let pairs_scored = n * n.saturating_sub(1) / 2;
    let edges = similarity_edges(&topic_sets, threshold);

    for batch in edges.chunks(batch_size.max(1)) {
        store.merge_edges(batch).await?;
    }

    Ok((pairs_scored, edges.len()))
}

/// Run the relationship builder: structural links, then similarity.
pub async fn run_link(config: &Config, check_only: bool) -> anyhow::Result<()> {
    let pool = db::connect(&config.storage.db_path).await?;

    if check_only {
        let store = SqliteGraphStore::new(pool);
        store.ping().await?;
        store.close().await;
        println!("link (check-only)");
        println!("  graph store reachable");
        println!("ok");
        return Ok(());
    }

    migrate::run_migrations(&pool).await?;
    let store = SqliteGraphStore::new(pool);

    let mut report = link_structural(&store, config.similarity.link_batch_size).await?;
    let (pairs_scored, similar_edges) = link_similarity(
        &store,
        config.similarity.threshold,
        config.similarity.link_batch_size,
    )
    .await?;
    report.pairs_scored = pairs_scored;
    report.similar_edges = similar_edges;

    let has_chunk = store.count_edges("HAS_CHUNK").await?;
    let similar_to = store.count_edges("SIMILAR_TO").await?;
    store.close().await;

    println!("link");
    println!("  chunks seen: {}", report.chunks_seen);
    println!("  links merged: {}", report.links_merged);
    if report.unresolved > 0 {
        println!("  unresolved references: {}", report.unresolved);
    }
    println!("  chat pairs scored: {}", report.pairs_scored);
    println!("  similar edges: {}", report.similar_edges);
    println!("  graph: {} HAS_CHUNK, {} SIMILAR_TO", has_chunk, similar_to);
    println!("ok");
    Ok(())
}
