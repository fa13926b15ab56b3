//! Stage orchestration: filter, transform, append, record.
//!
//! Every enrichment stage runs the same loop — read the upstream stream
//! lazily, fingerprint each item, drop the ones whose hash the stage's
//! state store already holds, hand the remainder to the external transform
//! in bounded batches, append what came back, and record state. The loop
//! owns the failure policy: one bad item is logged and skipped, a dead
//! dependency aborts the run.
//!
//! Per-item state machine: `Unseen → Processing → {Processed |
//! SkippedFailed}`. Only `Processed` is persisted, so a failed item is
//! retried by the next run.

use async_trait::async_trait;
use tracing::{error, warn};

use crate::config::Config;
use crate::errors::{PipelineError, Result};
use crate::state::{RunLock, StateStore};

/// One step of the enrichment pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Ingest,
    Chunk,
    Embed,
    Tag,
    Cluster,
    Summarize,
    Position,
    Load,
}

impl Stage {
    pub fn all() -> &'static [Stage] {
        &[
            Stage::Ingest,
            Stage::Chunk,
            Stage::Embed,
            Stage::Tag,
            Stage::Cluster,
            Stage::Summarize,
            Stage::Position,
            Stage::Load,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Chunk => "chunk",
            Stage::Embed => "embed",
            Stage::Tag => "tag",
            Stage::Cluster => "cluster",
            Stage::Summarize => "summarize",
            Stage::Position => "position",
            Stage::Load => "load",
        }
    }

    /// Name of the stage's output stream file, if it produces one. The
    /// load stage writes to the graph store instead.
    pub fn stream_name(&self) -> Option<&'static str> {
        match self {
            Stage::Ingest => Some("chats"),
            Stage::Chunk => Some("chunks"),
            Stage::Embed => Some("embeddings"),
            Stage::Tag => Some("tags"),
            Stage::Cluster => Some("assignments"),
            Stage::Summarize => Some("summaries"),
            Stage::Position => Some("positions"),
            Stage::Load => None,
        }
    }
}

/// Result of the external transform for one input item, aligned by index
/// with the batch it was called with.
#[derive(Debug)]
pub enum ItemOutcome<O> {
    Produced(O),
    Failed { reason: String },
}

/// A stage's external transform, invoked only on items the state store has
/// not seen.
///
/// Returning `Err` declares the whole call failed (transient errors are
/// retried by the implementation's own [`crate::retry::RetryPolicy`]
/// before surfacing here); per-item failures travel inside the outcome
/// vector so one rejected item cannot sink its batch.
#[async_trait]
pub trait Transform<I, O>: Send + Sync
where
    I: Send + Sync,
    O: Send,
{
    async fn process(&self, batch: &[I]) -> Result<Vec<ItemOutcome<O>>>;
}

/// Per-run stage options, mapped straight from CLI flags.
#[derive(Debug, Default, Clone)]
pub struct StageOptions {
    pub force: bool,
    pub clear_state: bool,
    pub dry_run: bool,
    pub limit: Option<usize>,
}

/// Counters reported after a stage run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StageReport {
    /// Upstream items read.
    pub scanned: usize,
    /// Items whose hash was already recorded.
    pub skipped: usize,
    /// Items newly processed and recorded (would-be count under
    /// `--dry-run`).
    pub processed: usize,
    /// Items that failed and were left unrecorded for the next run.
    pub failed: usize,
}

/// Runs one stage: holds the run lock, the state store, and the failure
/// policy. Construct per invocation; dropping releases the lock.
pub struct StageRunner {
    stage: Stage,
    state: StateStore,
    _lock: RunLock,
    batch_size: usize,
    systemic_threshold: u32,
    options: StageOptions,
}

impl StageRunner {
    pub fn new(config: &Config, stage: Stage, options: StageOptions) -> Result<Self> {
        let state_dir = config.state_dir();
        let lock = RunLock::acquire(&state_dir, stage.name())?;
        let mut state = StateStore::open(&state_dir, stage.name())?;
        if options.clear_state {
            state.clear()?;
        }
        if options.force {
            state.force_bypass();
        }
        Ok(Self {
            stage,
            state,
            _lock: lock,
            batch_size: config.pipeline.batch_size,
            systemic_threshold: config.pipeline.systemic_failure_threshold,
            options,
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Drive the stage to completion over a lazy upstream sequence.
    ///
    /// `key_fn` fingerprints an item as `(hash, digest)`; `sink` receives
    /// each batch of produced outputs before their state is recorded, so
    /// an interruption between the two leaves at worst an already-appended
    /// record whose re-derivation the next run absorbs via merge
    /// semantics.
    pub async fn run<I, O, T, K, S>(
        &mut self,
        upstream: impl IntoIterator<Item = Result<I>>,
        key_fn: K,
        transform: &T,
        mut sink: S,
        output_locator: &str,
    ) -> Result<StageReport>
    where
        I: Send + Sync,
        O: Send,
        T: Transform<I, O> + ?Sized,
        K: Fn(&I) -> Result<(String, String)>,
        S: FnMut(&[O]) -> Result<()>,
    {
        let mut report = StageReport::default();
        let mut keys: Vec<(String, String)> = Vec::with_capacity(self.batch_size);
        let mut items: Vec<I> = Vec::with_capacity(self.batch_size);
        let mut seen_this_run: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut consecutive_failures: u32 = 0;
        let mut queued = 0usize;

        for item in upstream {
            report.scanned += 1;
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    warn!(stage = self.stage.name(), error = %e, "unreadable upstream record, skipping");
                    report.failed += 1;
                    continue;
                }
            };

            let (hash, digest) = match key_fn(&item) {
                Ok(pair) => pair,
                Err(e @ PipelineError::MalformedEntity { .. }) => {
                    // Hard stop for this item: no defaulting, no state.
                    error!(stage = self.stage.name(), error = %e, "malformed entity");
                    report.failed += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            // A run may scan overlapping archives: the same hash seen
            // twice in one run is queued only once, even under --force.
            if self.state.has(&hash) || !seen_this_run.insert(hash.clone()) {
                report.skipped += 1;
                continue;
            }

            keys.push((hash, digest));
            items.push(item);
            queued += 1;

            if items.len() >= self.batch_size {
                self.process_batch(
                    &mut keys,
                    &mut items,
                    transform,
                    &mut sink,
                    output_locator,
                    &mut report,
                    &mut consecutive_failures,
                )
                .await?;
            }

            if let Some(limit) = self.options.limit {
                if queued >= limit {
                    break;
                }
            }
        }

        if !items.is_empty() {
            self.process_batch(
                &mut keys,
                &mut items,
                transform,
                &mut sink,
                output_locator,
                &mut report,
                &mut consecutive_failures,
            )
            .await?;
        }

        self.state.flush()?;
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_batch<I, O, T, S>(
        &mut self,
        keys: &mut Vec<(String, String)>,
        items: &mut Vec<I>,
        transform: &T,
        sink: &mut S,
        output_locator: &str,
        report: &mut StageReport,
        consecutive_failures: &mut u32,
    ) -> Result<()>
    where
        I: Send + Sync,
        O: Send,
        T: Transform<I, O> + ?Sized,
        S: FnMut(&[O]) -> Result<()>,
    {
        let batch_keys = std::mem::take(keys);
        let batch_items = std::mem::take(items);

        if self.options.dry_run {
            report.processed += batch_items.len();
            return Ok(());
        }

        let outcomes = match transform.process(&batch_items).await {
            Ok(outcomes) => outcomes,
            Err(e @ PipelineError::Unavailable(_)) => return Err(e),
            Err(e) if e.is_transient() => {
                // The whole call failed after the provider's own retries.
                // Leave every item unrecorded and keep going unless this
                // looks like an outage.
                warn!(
                    stage = self.stage.name(),
                    batch = batch_items.len(),
                    error = %e,
                    "transform batch failed, items left for next run"
                );
                report.failed += batch_items.len();
                *consecutive_failures += 1;
                if *consecutive_failures >= self.systemic_threshold {
                    return Err(PipelineError::Unavailable(format!(
                        "stage `{}`: {} consecutive batch failures, aborting",
                        self.stage.name(),
                        consecutive_failures
                    )));
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if outcomes.len() != batch_items.len() {
            return Err(PipelineError::Unavailable(format!(
                "stage `{}`: transform returned {} outcomes for {} items",
                self.stage.name(),
                outcomes.len(),
                batch_items.len()
            )));
        }

        *consecutive_failures = 0;

        let mut produced: Vec<O> = Vec::with_capacity(outcomes.len());
        let mut produced_keys: Vec<&(String, String)> = Vec::with_capacity(outcomes.len());
        for (outcome, key) in outcomes.into_iter().zip(batch_keys.iter()) {
            match outcome {
                ItemOutcome::Produced(output) => {
                    produced.push(output);
                    produced_keys.push(key);
                }
                ItemOutcome::Failed { reason } => {
                    warn!(
                        stage = self.stage.name(),
                        hash = %key.0,
                        reason = %reason,
                        "item failed, left for next run"
                    );
                    report.failed += 1;
                }
            }
        }

        if !produced.is_empty() {
            sink(&produced)?;
            for (hash, digest) in produced_keys {
                self.state.record(hash, digest, output_locator)?;
                report.processed += 1;
            }
        }

        // Durable checkpoint per batch: an interrupted run resumes here.
        self.state.flush()?;
        Ok(())
    }
}

/// An identity transform for stages whose work happens before the runner
/// (ingest normalization, chunk derivation): every unseen item passes
/// straight through to the sink.
pub struct PassThrough;

#[async_trait]
impl<I> Transform<I, I> for PassThrough
where
    I: Clone + Send + Sync,
{
    async fn process(&self, batch: &[I]) -> Result<Vec<ItemOutcome<I>>> {
        Ok(batch
            .iter()
            .cloned()
            .map(ItemOutcome::Produced)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: String,
        body: String,
    }

    fn item(id: &str) -> Item {
        Item {
            id: id.into(),
            body: format!("body of {}", id),
        }
    }

    fn key_fn(item: &Item) -> Result<(String, String)> {
        Ok((item.id.clone(), format!("digest-{}", item.id)))
    }

    fn test_config(root: &std::path::Path) -> Config {
        let mut config = Config::minimal(root);
        config.pipeline.batch_size = 4;
        config.pipeline.systemic_failure_threshold = 2;
        config
    }

    /// Transform that records how many items it was invoked with and can
    /// fail specific ids or whole calls.
    struct Probe {
        calls: AtomicUsize,
        items_seen: AtomicUsize,
        fail_ids: Vec<String>,
        fail_calls: Mutex<usize>,
    }

    impl Probe {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                items_seen: AtomicUsize::new(0),
                fail_ids: Vec::new(),
                fail_calls: Mutex::new(0),
            }
        }

        fn failing_ids(ids: &[&str]) -> Self {
            let mut probe = Self::new();
            probe.fail_ids = ids.iter().map(|s| s.to_string()).collect();
            probe
        }

        fn failing_calls(n: usize) -> Self {
            let probe = Self::new();
            *probe.fail_calls.lock().unwrap() = n;
            probe
        }
    }

    #[async_trait]
    impl Transform<Item, String> for Probe {
        async fn process(&self, batch: &[Item]) -> Result<Vec<ItemOutcome<String>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut remaining = self.fail_calls.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(PipelineError::Transform("call failed".into()));
                }
            }
            self.items_seen.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(batch
                .iter()
                .map(|item| {
                    if self.fail_ids.contains(&item.id) {
                        ItemOutcome::Failed {
                            reason: "rejected".into(),
                        }
                    } else {
                        ItemOutcome::Produced(item.body.clone())
                    }
                })
                .collect())
        }
    }

    fn upstream(ids: &[&str]) -> Vec<Result<Item>> {
        ids.iter().map(|id| Ok(item(id))).collect()
    }

    #[tokio::test]
    async fn test_dedup_invokes_transform_on_delta_only() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        // First run: all 6 items processed.
        let probe = Probe::new();
        let mut runner =
            StageRunner::new(&config, Stage::Embed, StageOptions::default()).unwrap();
        let report = runner
            .run(
                upstream(&["a", "b", "c", "d", "e", "f"]),
                key_fn,
                &probe,
                |_batch: &[String]| Ok(()),
                "embeddings.jsonl",
            )
            .await
            .unwrap();
        drop(runner);
        assert_eq!(report.processed, 6);
        assert_eq!(probe.items_seen.load(Ordering::SeqCst), 6);

        // Second run over a superset: only the 2 new items hit the
        // transform.
        let probe = Probe::new();
        let mut runner =
            StageRunner::new(&config, Stage::Embed, StageOptions::default()).unwrap();
        let report = runner
            .run(
                upstream(&["a", "b", "c", "d", "e", "f", "g", "h"]),
                key_fn,
                &probe,
                |_batch: &[String]| Ok(()),
                "embeddings.jsonl",
            )
            .await
            .unwrap();
        assert_eq!(report.scanned, 8);
        assert_eq!(report.skipped, 6);
        assert_eq!(report.processed, 2);
        assert_eq!(probe.items_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_duplicate_in_same_run_queued_once() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        // Overlapping archives in one run: "a" appears twice.
        let probe = Probe::new();
        let mut runner =
            StageRunner::new(&config, Stage::Ingest, StageOptions::default()).unwrap();
        let report = runner
            .run(
                upstream(&["a", "b", "a"]),
                key_fn,
                &probe,
                |_batch: &[String]| Ok(()),
                "chats.jsonl",
            )
            .await
            .unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.processed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(probe.items_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_isolation() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        let probe = Probe::failing_ids(&["c"]);
        let mut runner =
            StageRunner::new(&config, Stage::Tag, StageOptions::default()).unwrap();
        let ids: Vec<String> = (0..100).map(|i| format!("item{:03}", i)).collect();
        let mut ids_ref: Vec<&str> = ids.iter().map(String::as_str).collect();
        ids_ref[2] = "c";
        let report = runner
            .run(
                upstream(&ids_ref),
                key_fn,
                &probe,
                |_batch: &[String]| Ok(()),
                "tags.jsonl",
            )
            .await
            .unwrap();

        assert_eq!(report.processed, 99);
        assert_eq!(report.failed, 1);
        // The failed item is absent from state, eligible for retry.
        assert!(!runner.state().has("c"));
        assert!(runner.state().has("item000"));
    }

    #[tokio::test]
    async fn test_failed_item_retried_on_next_run() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        let probe = Probe::failing_ids(&["b"]);
        let mut runner =
            StageRunner::new(&config, Stage::Tag, StageOptions::default()).unwrap();
        runner
            .run(
                upstream(&["a", "b"]),
                key_fn,
                &probe,
                |_batch: &[String]| Ok(()),
                "tags.jsonl",
            )
            .await
            .unwrap();
        drop(runner);

        // Next run: b is unseen again and succeeds this time.
        let probe = Probe::new();
        let mut runner =
            StageRunner::new(&config, Stage::Tag, StageOptions::default()).unwrap();
        let report = runner
            .run(
                upstream(&["a", "b"]),
                key_fn,
                &probe,
                |_batch: &[String]| Ok(()),
                "tags.jsonl",
            )
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 1);
        assert!(runner.state().has("b"));
    }

    #[tokio::test]
    async fn test_force_reprocesses_without_clearing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        let probe = Probe::new();
        let mut runner =
            StageRunner::new(&config, Stage::Embed, StageOptions::default()).unwrap();
        runner
            .run(
                upstream(&["a", "b"]),
                key_fn,
                &probe,
                |_batch: &[String]| Ok(()),
                "embeddings.jsonl",
            )
            .await
            .unwrap();
        drop(runner);

        let probe = Probe::new();
        let options = StageOptions {
            force: true,
            ..Default::default()
        };
        let mut runner = StageRunner::new(&config, Stage::Embed, options).unwrap();
        let report = runner
            .run(
                upstream(&["a", "b"]),
                key_fn,
                &probe,
                |_batch: &[String]| Ok(()),
                "embeddings.jsonl",
            )
            .await
            .unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.skipped, 0);
        assert_eq!(probe.items_seen.load(Ordering::SeqCst), 2);
        // History preserved, not wiped.
        assert_eq!(runner.state().len(), 2);
    }

    #[tokio::test]
    async fn test_clear_state_wipes_before_running() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        let probe = Probe::new();
        let mut runner =
            StageRunner::new(&config, Stage::Embed, StageOptions::default()).unwrap();
        runner
            .run(
                upstream(&["a"]),
                key_fn,
                &probe,
                |_batch: &[String]| Ok(()),
                "embeddings.jsonl",
            )
            .await
            .unwrap();
        drop(runner);

        let options = StageOptions {
            clear_state: true,
            ..Default::default()
        };
        let runner = StageRunner::new(&config, Stage::Embed, options).unwrap();
        assert!(runner.state().is_empty());
    }

    #[tokio::test]
    async fn test_systemic_failure_aborts_run() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        // Threshold is 2; every call fails.
        let probe = Probe::failing_calls(usize::MAX);
        let mut runner =
            StageRunner::new(&config, Stage::Embed, StageOptions::default()).unwrap();
        let ids: Vec<String> = (0..12).map(|i| format!("x{}", i)).collect();
        let ids_ref: Vec<&str> = ids.iter().map(String::as_str).collect();
        let err = runner
            .run(
                upstream(&ids_ref),
                key_fn,
                &probe,
                |_batch: &[String]| Ok(()),
                "embeddings.jsonl",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Unavailable(_)));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_single_batch_failure_does_not_abort() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        // First call fails, later calls succeed; threshold 2 not reached.
        let probe = Probe::failing_calls(1);
        let mut runner =
            StageRunner::new(&config, Stage::Embed, StageOptions::default()).unwrap();
        let report = runner
            .run(
                upstream(&["a", "b", "c", "d", "e", "f", "g", "h"]),
                key_fn,
                &probe,
                |_batch: &[String]| Ok(()),
                "embeddings.jsonl",
            )
            .await
            .unwrap();
        assert_eq!(report.failed, 4);
        assert_eq!(report.processed, 4);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        let probe = Probe::new();
        let options = StageOptions {
            dry_run: true,
            ..Default::default()
        };
        let mut runner = StageRunner::new(&config, Stage::Embed, options).unwrap();
        let sank = AtomicUsize::new(0);
        let report = runner
            .run(
                upstream(&["a", "b", "c"]),
                key_fn,
                &probe,
                |batch: &[String]| {
                    sank.fetch_add(batch.len(), Ordering::SeqCst);
                    Ok(())
                },
                "embeddings.jsonl",
            )
            .await
            .unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert_eq!(sank.load(Ordering::SeqCst), 0);
        assert!(runner.state().is_empty());
    }

    #[tokio::test]
    async fn test_limit_bounds_new_work() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        let probe = Probe::new();
        let options = StageOptions {
            limit: Some(3),
            ..Default::default()
        };
        let mut runner = StageRunner::new(&config, Stage::Embed, options).unwrap();
        let report = runner
            .run(
                upstream(&["a", "b", "c", "d", "e"]),
                key_fn,
                &probe,
                |_batch: &[String]| Ok(()),
                "embeddings.jsonl",
            )
            .await
            .unwrap();
        assert_eq!(report.processed, 3);
    }

    #[tokio::test]
    async fn test_malformed_item_skipped_without_state() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        let probe = Probe::new();
        let mut runner =
            StageRunner::new(&config, Stage::Ingest, StageOptions::default()).unwrap();
        let report = runner
            .run(
                upstream(&["a", "", "b"]),
                |item: &Item| {
                    if item.id.is_empty() {
                        Err(PipelineError::MalformedEntity {
                            entity: "chat",
                            field: "messages",
                        })
                    } else {
                        key_fn(item)
                    }
                },
                &probe,
                |_batch: &[String]| Ok(()),
                "chats.jsonl",
            )
            .await
            .unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(runner.state().len(), 2);
    }
}
