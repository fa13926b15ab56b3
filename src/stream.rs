//! Append-only JSONL stream files, one per stage.
//!
//! A stage's stream is the authoritative record of everything it has ever
//! produced, separate from the state store's "ever attempted" index.
//! Records are one JSON object per line; writers only append, and readers
//! tolerate the file being re-opened mid-pipeline.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::Result;

/// Path of a stage's stream file under the streams directory.
pub fn stream_path(streams_dir: &Path, stage: &str) -> PathBuf {
    streams_dir.join(format!("{}.jsonl", stage))
}

/// Appends JSONL records to one stage's stream, flushing durably per batch.
pub struct StreamWriter {
    path: PathBuf,
    file: File,
}

impl StreamWriter {
    pub fn open(streams_dir: &Path, stage: &str) -> Result<Self> {
        std::fs::create_dir_all(streams_dir)?;
        let path = stream_path(streams_dir, stage);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a batch of records and flush to disk before returning, so an
    /// interrupted run never loses records it reported as written.
    pub fn append_batch<T: Serialize>(&mut self, records: &[T]) -> Result<()> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        self.file.write_all(&buf)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Lazily iterate a stage's stream. A missing file reads as empty — the
/// stage simply has not produced anything yet.
pub fn read_stream<T: DeserializeOwned>(
    streams_dir: &Path,
    stage: &str,
) -> Result<impl Iterator<Item = Result<T>>> {
    let path = stream_path(streams_dir, stage);
    let reader = match File::open(&path) {
        Ok(file) => Some(BufReader::new(file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    let lines = reader.map(|r| r.lines()).into_iter().flatten();
    Ok(lines.filter_map(|line| match line {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(serde_json::from_str::<T>(&line).map_err(Into::into)),
        Err(e) => Some(Err(e.into())),
    }))
}

/// Read a whole stream into memory. Used where a stage genuinely needs the
/// full upstream set (clustering, relationship building).
pub fn read_all<T: DeserializeOwned>(streams_dir: &Path, stage: &str) -> Result<Vec<T>> {
    read_stream(streams_dir, stage)?.collect()
}
