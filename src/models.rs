//! Core data models used throughout Chat Atlas.
//!
//! These types are the records that flow through the stage streams. Each
//! carries its content-derived id (and, where it is the unit of stage
//! state, the full digest) so downstream stages can key their own state
//! without re-deriving identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A normalized conversation, the output of the ingest stage.
///
/// `id` and `digest` are pure functions of the normalized message content;
/// `title` and timestamps are carried for display but never hashed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: String,
    pub digest: String,
    pub title: String,
    pub created_at: Option<DateTime<Utc>>,
    pub messages: Vec<MessageRecord>,
}

/// One message within a chat.
///
/// A message is never independently hashed for global identity: its id is
/// composite, `<chat_id>:<position>`, relative to its parent chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub role: String,
    pub text: String,
    pub position: usize,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A contiguous window of one chat's messages, the chunking stage's unit
/// of tagging and embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// `chunk_<16 hex>` — fingerprint of {content, chat id, first source
    /// message id, role}.
    pub id: String,
    pub digest: String,
    pub chat_id: String,
    /// Composite id of the first message this chunk was derived from.
    pub source_message_id: String,
    /// Role of the first message in the window.
    pub role: String,
    pub content: String,
    /// Number of messages folded into this chunk.
    pub message_count: usize,
}

/// An embedding vector for one chunk, keyed by the chunk's content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub model: String,
    pub vector: Vec<f32>,
}

/// Labels attached to a chunk by the tagging stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRecord {
    pub chunk_id: String,
    pub chat_id: String,
    pub tags: Vec<String>,
}

/// A chunk's topic membership, produced by the clustering stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub chunk_id: String,
    pub chat_id: String,
    pub cluster_id: i64,
}

/// A generated summary for one topic.
///
/// `members_digest` fingerprints the member set; membership changes give
/// the topic a new digest and re-trigger summarization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSummary {
    pub cluster_id: i64,
    pub summary: String,
    pub keywords: Vec<String>,
    pub size: usize,
    pub members_digest: String,
}

/// 2-D layout coordinates for one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub chunk_id: String,
    pub x: f32,
    pub y: f32,
}

/// Compose the id of a message from its parent chat and position.
///
/// This format is the contract consumed by `relate::parse_message_ref`;
/// change both together or not at all.
pub fn message_id(chat_id: &str, position: usize) -> String {
    format!("{}:{}", chat_id, position)
}

/// The node id a topic gets in the graph store.
pub fn topic_node_id(cluster_id: i64) -> String {
    format!("topic_{}", cluster_id)
}
