//! Clustering stage: embeddings stream → topic assignments.
//!
//! The assigner is a deliberately plain greedy-centroid pass: a chunk
//! joins the existing topic whose centroid it is closest to (cosine, above
//! a configured threshold) or opens a new one. What matters to the
//! pipeline is the envelope, not the algorithm: assignments are keyed by
//! chunk hash, derived deterministically from stream order, and a re-run
//! only assigns chunks that have no recorded assignment yet — existing
//! topics are rebuilt from the assignments stream first, so new chunks
//! join old topics instead of fragmenting them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::Config;
use crate::embedding::{cosine_similarity, vector_digest};
use crate::errors::Result;
use crate::models::{AssignmentRecord, ChunkRecord, EmbeddingRecord};
use crate::runner::{ItemOutcome, Stage, StageOptions, StageRunner, Transform};
use crate::stream::{read_all, read_stream, StreamWriter};

/// Incremental centroid index over topics.
///
/// Centroids are vector sums; cosine against the sum equals cosine
/// against the mean, so no division is needed on the hot path.
pub struct ClusterIndex {
    centroids: BTreeMap<i64, (Vec<f32>, usize)>,
    next_id: i64,
}

impl ClusterIndex {
    pub fn new() -> Self {
        Self {
            centroids: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Rebuild from prior assignments so re-runs extend existing topics.
    pub fn from_assignments(
        assignments: &[AssignmentRecord],
        vectors: &HashMap<String, Vec<f32>>,
    ) -> Self {
        let mut index = Self::new();
        for assignment in assignments {
            if let Some(vector) = vectors.get(&assignment.chunk_id) {
                index.add_member(assignment.cluster_id, vector);
            }
        }
        index
    }

    fn add_member(&mut self, cluster_id: i64, vector: &[f32]) {
        let entry = self
            .centroids
            .entry(cluster_id)
            .or_insert_with(|| (vec![0.0; vector.len()], 0));
        if entry.0.len() == vector.len() {
            for (sum, v) in entry.0.iter_mut().zip(vector.iter()) {
                *sum += v;
            }
            entry.1 += 1;
        }
        self.next_id = self.next_id.max(cluster_id + 1);
    }

    /// Assign a vector: best existing centroid at or above the threshold,
    /// otherwise a fresh topic. Ties go to the lowest topic id, so the
    /// outcome depends only on input order.
    pub fn assign(&mut self, vector: &[f32], threshold: f32) -> i64 {
        let mut best: Option<(i64, f32)> = None;
        for (&id, (sum, _)) in &self.centroids {
            let score = cosine_similarity(vector, sum);
            if score >= threshold && best.map_or(true, |(_, s)| score > s) {
                best = Some((id, score));
            }
        }
        let id = match best {
            Some((id, _)) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };
        self.add_member(id, vector);
        id
    }

    pub fn topic_count(&self) -> usize {
        self.centroids.len()
    }
}

impl Default for ClusterIndex {
    fn default() -> Self {
        Self::new()
    }
}

struct ClusterTransform {
    index: Mutex<ClusterIndex>,
    chat_of: HashMap<String, String>,
    threshold: f32,
}

#[async_trait]
impl Transform<EmbeddingRecord, AssignmentRecord> for ClusterTransform {
    async fn process(
        &self,
        batch: &[EmbeddingRecord],
    ) -> Result<Vec<ItemOutcome<AssignmentRecord>>> {
        let mut index = self.index.lock().expect("cluster index poisoned");
        Ok(batch
            .iter()
            .map(|record| match self.chat_of.get(&record.chunk_id) {
                Some(chat_id) => {
                    let cluster_id = index.assign(&record.vector, self.threshold);
                    ItemOutcome::Produced(AssignmentRecord {
                        chunk_id: record.chunk_id.clone(),
                        chat_id: chat_id.clone(),
                        cluster_id,
                    })
                }
                None => ItemOutcome::Failed {
                    reason: "no chunk record for embedded id".into(),
                },
            })
            .collect())
    }
}

/// Run the clustering stage.
pub async fn run_cluster(
    config: &Config,
    options: StageOptions,
    check_only: bool,
) -> anyhow::Result<()> {
    if check_only {
        println!("cluster (check-only)");
        println!("  no external dependencies");
        println!("ok");
        return Ok(());
    }

    let streams_dir = config.streams_dir();

    // Prior state: vectors per chunk and the assignments already made.
    let mut vectors: HashMap<String, Vec<f32>> = HashMap::new();
    for record in read_all::<EmbeddingRecord>(&streams_dir, "embeddings")? {
        vectors.insert(record.chunk_id.clone(), record.vector);
    }
    let prior: Vec<AssignmentRecord> = read_all(&streams_dir, "assignments")?;
    let chat_of: HashMap<String, String> = read_all::<ChunkRecord>(&streams_dir, "chunks")?
        .into_iter()
        .map(|chunk| (chunk.id, chunk.chat_id))
        .collect();

    let transform = ClusterTransform {
        index: Mutex::new(ClusterIndex::from_assignments(&prior, &vectors)),
        chat_of,
        threshold: config.clustering.assign_threshold,
    };

    let dry_run = options.dry_run;
    let mut runner = StageRunner::new(config, Stage::Cluster, options)?;
    let upstream = read_stream::<EmbeddingRecord>(&streams_dir, "embeddings")?;
    let key_fn =
        |record: &EmbeddingRecord| Ok((record.chunk_id.clone(), vector_digest(&record.vector)));

    let report = if dry_run {
        runner
            .run(upstream, key_fn, &transform, |_: &[AssignmentRecord]| Ok(()), "dry-run")
            .await?
    } else {
        let mut writer = StreamWriter::open(&streams_dir, "assignments")?;
        let locator = writer.path().display().to_string();
        runner
            .run(
                upstream,
                key_fn,
                &transform,
                |batch: &[AssignmentRecord]| writer.append_batch(batch),
                &locator,
            )
            .await?
    };

    let topics = transform.index.lock().expect("cluster index poisoned").topic_count();

    println!("cluster{}", if dry_run { " (dry-run)" } else { "" });
    println!("  embeddings scanned: {}", report.scanned);
    println!("  already assigned: {}", report.skipped);
    println!("  assigned: {}", report.processed);
    println!("  topics: {}", topics);
    if report.failed > 0 {
        println!("  failed: {}", report.failed);
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_vectors_share_a_topic() {
        let mut index = ClusterIndex::new();
        let a = index.assign(&[1.0, 0.0, 0.05], 0.8);
        let b = index.assign(&[0.98, 0.0, 0.0], 0.8);
        assert_eq!(a, b);
        assert_eq!(index.topic_count(), 1);
    }

    #[test]
    fn test_distant_vector_opens_new_topic() {
        let mut index = ClusterIndex::new();
        let a = index.assign(&[1.0, 0.0], 0.8);
        let b = index.assign(&[0.0, 1.0], 0.8);
        assert_ne!(a, b);
        assert_eq!(index.topic_count(), 2);
    }

    #[test]
    fn test_assignment_deterministic_for_same_order() {
        let vectors = [
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.9, 0.1, 0.0],
            vec![0.0, 0.95, 0.1],
        ];
        let run = || {
            let mut index = ClusterIndex::new();
            vectors
                .iter()
                .map(|v| index.assign(v, 0.7))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_rebuild_extends_existing_topics() {
        let mut vectors = HashMap::new();
        vectors.insert("chunk_a".to_string(), vec![1.0, 0.0]);
        let prior = vec![AssignmentRecord {
            chunk_id: "chunk_a".into(),
            chat_id: "chat_x".into(),
            cluster_id: 7,
        }];
        let mut index = ClusterIndex::from_assignments(&prior, &vectors);

        // A nearby vector joins topic 7; a far one gets a fresh id above
        // the prior range.
        assert_eq!(index.assign(&[0.99, 0.01], 0.8), 7);
        assert_eq!(index.assign(&[0.0, 1.0], 0.8), 8);
    }

    #[test]
    fn test_vector_digest_tracks_content() {
        assert_eq!(vector_digest(&[1.0, 2.0]), vector_digest(&[1.0, 2.0]));
        assert_ne!(vector_digest(&[1.0, 2.0]), vector_digest(&[2.0, 1.0]));
    }
}
