//! Error types for the enrichment pipeline.
//!
//! The taxonomy separates per-item failures (contained, retried, skipped)
//! from systemic ones (propagated to the process exit code). Stage code
//! returns [`PipelineError`]; the CLI command layer wraps it in `anyhow`.

/// Alias for Results returning [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Top-level error type for the pipeline core.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A required field was absent or empty when hashing an entity.
    /// Fatal for that item — never silently defaulted.
    #[error("malformed {entity}: missing required field `{field}`")]
    MalformedEntity { entity: &'static str, field: &'static str },

    /// The same hash was recorded twice with different source content.
    /// Signals a hashing bug upstream; must stop the run.
    #[error("state conflict in stage `{stage}`: hash {hash} recorded with different content")]
    StateConflict { stage: String, hash: String },

    /// A single external call failed in a way worth retrying.
    #[error("transform failed: {0}")]
    Transform(String),

    /// An external dependency is unreachable after retries. Aborts the
    /// batch and surfaces to the operator.
    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    /// The relationship builder could not resolve a structural reference.
    /// Logged and skipped; the batch continues.
    #[error("unresolvable reference: {0}")]
    ReferenceResolution(String),

    /// Another run of the same stage holds the run-lock.
    #[error("stage `{0}` is locked by another run")]
    StageLocked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

impl PipelineError {
    /// Whether a bounded retry is worthwhile before demoting the item
    /// to the skip-and-continue policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transform(_))
    }
}
