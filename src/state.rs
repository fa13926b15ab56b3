//! Per-stage processed-hash index.
//!
//! One store per stage, persisted as a JSON file under `<data_dir>/state/`.
//! The store answers "has this content hash already produced output?" so a
//! re-run only processes the delta. Entries record the full content digest
//! alongside the truncated id: recording the same hash with a different
//! digest is a hashing bug upstream and fails loudly instead of being
//! silently ignored.
//!
//! Flushes write the whole index to a temp file and rename it into place,
//! so a crash mid-flush leaves the previous consistent index rather than a
//! torn file.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{PipelineError, Result};

/// One processed-hash entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageStateRecord {
    /// Full 256-bit digest of the content the hash was derived from.
    pub digest: String,
    pub processed_at: DateTime<Utc>,
    pub output_locator: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    entries: BTreeMap<String, StageStateRecord>,
}

/// The persisted "already produced" index for one stage.
pub struct StateStore {
    stage: String,
    path: PathBuf,
    entries: BTreeMap<String, StageStateRecord>,
    force_bypass: bool,
    dirty: bool,
}

impl StateStore {
    /// Open (or create) the state index for a stage.
    pub fn open(state_dir: &Path, stage: &str) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(format!("{}.json", stage));
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<StateFile>(&content)?.entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            stage: stage.to_string(),
            path,
            entries,
            force_bypass: false,
            dirty: false,
        })
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether this hash has already produced output for this stage.
    /// Always false while force-bypass is active.
    pub fn has(&self, hash: &str) -> bool {
        if self.force_bypass {
            return false;
        }
        self.entries.contains_key(hash)
    }

    /// Run-scoped override: `has` answers false for everything without
    /// mutating the underlying index, enabling full reprocessing while
    /// preserving history.
    pub fn force_bypass(&mut self) {
        self.force_bypass = true;
    }

    /// Mark a hash as processed. Idempotent for identical arguments;
    /// recording the same hash with a different digest is a
    /// [`PipelineError::StateConflict`].
    pub fn record(&mut self, hash: &str, digest: &str, output_locator: &str) -> Result<()> {
        if let Some(existing) = self.entries.get(hash) {
            if existing.digest != digest {
                return Err(PipelineError::StateConflict {
                    stage: self.stage.clone(),
                    hash: hash.to_string(),
                });
            }
            // Same content re-recorded (force-bypass rerun): refresh the
            // locator and timestamp.
        }
        self.entries.insert(
            hash.to_string(),
            StageStateRecord {
                digest: digest.to_string(),
                processed_at: Utc::now(),
                output_locator: output_locator.to_string(),
            },
        );
        self.dirty = true;
        Ok(())
    }

    /// Wipe all records for this stage. Other stages' stores are untouched.
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.dirty = true;
        self.flush()
    }

    /// Durably persist the index: write to a sibling temp file, fsync, and
    /// rename over the previous index.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let file = StateFile {
            entries: self.entries.clone(),
        };
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            serde_json::to_writer(&mut tmp, &file)?;
            tmp.write_all(b"\n")?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        self.dirty = false;
        Ok(())
    }
}

/// Exclusive per-stage run lock.
///
/// Concurrent runs of the same stage would interleave state writes, so a
/// run holds a lock file for its duration. The file is removed on drop; a
/// crashed run leaves it behind and the operator removes it by hand (the
/// error message names the path).
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(state_dir: &Path, stage: &str) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(format!("{}.lock", stage));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(PipelineError::StageLocked(format!(
                    "{} (lock file: {})",
                    stage,
                    path.display()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_store_has_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::open(tmp.path(), "embed").unwrap();
        assert!(!store.has("chunk_abc"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_record_then_has() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(tmp.path(), "embed").unwrap();
        store.record("chunk_abc", "ff00", "embeddings.jsonl").unwrap();
        assert!(store.has("chunk_abc"));
        assert!(!store.has("chunk_def"));
    }

    #[test]
    fn test_record_idempotent_for_identical_args() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(tmp.path(), "embed").unwrap();
        store.record("chunk_abc", "ff00", "embeddings.jsonl").unwrap();
        store.record("chunk_abc", "ff00", "embeddings.jsonl").unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_record_conflicting_digest_fails_loudly() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(tmp.path(), "embed").unwrap();
        store.record("chunk_abc", "ff00", "embeddings.jsonl").unwrap();
        let err = store
            .record("chunk_abc", "00ff", "embeddings.jsonl")
            .unwrap_err();
        assert!(matches!(err, PipelineError::StateConflict { .. }));
    }

    #[test]
    fn test_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut store = StateStore::open(tmp.path(), "embed").unwrap();
            store.record("chunk_abc", "ff00", "embeddings.jsonl").unwrap();
            store.flush().unwrap();
        }
        let store = StateStore::open(tmp.path(), "embed").unwrap();
        assert!(store.has("chunk_abc"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_force_bypass_does_not_mutate() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut store = StateStore::open(tmp.path(), "embed").unwrap();
            store.record("chunk_abc", "ff00", "embeddings.jsonl").unwrap();
            store.flush().unwrap();
        }
        {
            let mut store = StateStore::open(tmp.path(), "embed").unwrap();
            store.force_bypass();
            assert!(!store.has("chunk_abc"));
        }
        // Entry is still there for a normal run.
        let store = StateStore::open(tmp.path(), "embed").unwrap();
        assert!(store.has("chunk_abc"));
    }

    #[test]
    fn test_clear_wipes_only_this_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let mut embed = StateStore::open(tmp.path(), "embed").unwrap();
        let mut tag = StateStore::open(tmp.path(), "tag").unwrap();
        embed.record("chunk_abc", "ff00", "embeddings.jsonl").unwrap();
        tag.record("chunk_abc", "ff00", "tags.jsonl").unwrap();
        embed.flush().unwrap();
        tag.flush().unwrap();

        embed.clear().unwrap();

        let embed = StateStore::open(tmp.path(), "embed").unwrap();
        let tag = StateStore::open(tmp.path(), "tag").unwrap();
        assert!(!embed.has("chunk_abc"));
        assert!(tag.has("chunk_abc"));
    }

    #[test]
    fn test_run_lock_excludes_second_acquirer() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = RunLock::acquire(tmp.path(), "embed").unwrap();
        let err = RunLock::acquire(tmp.path(), "embed").unwrap_err();
        assert!(matches!(err, PipelineError::StageLocked(_)));
        drop(lock);
        // Released on drop; a new run can acquire.
        RunLock::acquire(tmp.path(), "embed").unwrap();
    }
}
