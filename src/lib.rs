//! # Chat Atlas
//!
//! An incremental, content-addressed enrichment pipeline for exported
//! chat archives. Archives are ingested into normalized chats, chunked,
//! embedded, tagged, clustered into topics, summarized, positioned in
//! 2-D, and loaded into a graph store — and every stage can be re-run
//! indefinitely over new, possibly overlapping exports without
//! duplicating a chat, message, chunk, or derived relationship, and
//! without repeating expensive embedding or LLM calls on content already
//! processed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────────┐   ┌──────────┐
//! │ Archives │──▶│ Stages (JSONL streams + state)│──▶│  SQLite   │
//! │ json/zip │   │ ingest→chunk→embed→tag→...    │   │ graph+vec │
//! └──────────┘   └───────────────────────────────┘   └────┬─────┘
//!                                                         │
//!                                                   ┌─────▼─────┐
//!                                                   │   link     │
//!                                                   │ HAS_CHUNK  │
//!                                                   │ SIMILAR_TO │
//!                                                   └───────────┘
//! ```
//!
//! Three pieces carry the multi-run correctness invariants:
//!
//! - [`hashing`] — deterministic, content-only identity for every chat,
//!   chunk, and topic, independent of archive origin or processing time.
//! - [`state`] — one persisted processed-hash index per stage, so a
//!   re-run only processes the delta.
//! - [`relate`] — recomputable, merge-semantics derivation of
//!   message→chunk containment and chat↔chat topic similarity.
//!
//! Everything else (embedding, tagging, summarization, layout) is a
//! replaceable external transform behind a capability trait, selected by
//! configuration.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Stream record types |
//! | [`hashing`] | Canonical content fingerprints |
//! | [`state`] | Per-stage processed-hash index |
//! | [`stream`] | Append-only JSONL stream files |
//! | [`runner`] | Stage orchestration and failure policy |
//! | [`retry`] | Bounded-retry policy for external calls |
//! | [`ingest`] | Archive parsing and chat normalization |
//! | [`chunk`] | Message-window chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Tagging/summarization provider abstraction |
//! | [`cluster`] | Incremental topic assignment |
//! | [`summarize`] | Topic summarization |
//! | [`position`] | 2-D layout projection |
//! | [`graph`] | Graph store (merge-only writes) |
//! | [`vectors`] | Vector store upserts |
//! | [`load`] | Stream → graph loading |
//! | [`relate`] | Derived relationships (HAS_CHUNK, SIMILAR_TO) |
//! | [`status`] | Per-stage progress report |

pub mod chunk;
pub mod cluster;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod errors;
pub mod graph;
pub mod hashing;
pub mod ingest;
pub mod llm;
pub mod load;
pub mod migrate;
pub mod models;
pub mod position;
pub mod relate;
pub mod retry;
pub mod runner;
pub mod state;
pub mod status;
pub mod stream;
pub mod summarize;
pub mod tag_cmd;
pub mod vectors;

pub use errors::{PipelineError, Result};
