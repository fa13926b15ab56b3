//! # Chat Atlas CLI (`atlas`)
//!
//! The `atlas` binary drives the enrichment pipeline one stage per
//! invocation, in downstream order:
//!
//! ```bash
//! atlas init                          # create data dirs and graph schema
//! atlas ingest ./export.zip           # archives -> chats stream
//! atlas chunk                         # chats -> chunks
//! atlas embed                         # chunks -> embeddings + vectors
//! atlas tag                           # chunks -> tags
//! atlas cluster                       # embeddings -> topic assignments
//! atlas summarize                     # topics -> summaries
//! atlas position                      # embeddings -> 2-D coordinates
//! atlas load                          # streams -> graph nodes
//! atlas link                          # derived HAS_CHUNK / SIMILAR_TO
//! atlas status                        # per-stage progress
//! ```
//!
//! Every stage command accepts `--force` (reprocess regardless of prior
//! state, without mutating it), `--clear-state` (wipe this stage's state
//! index first), `--dry-run` (report would-be counts), `--limit N`, and
//! `--check-only` (verify external dependencies without processing).
//! Re-running any command over already-processed data is cheap: items
//! whose content hash is already recorded never reach the external
//! services again.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use chat_atlas::config;
use chat_atlas::runner::StageOptions;

/// Chat Atlas — an incremental enrichment pipeline for exported chat
/// archives.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/atlas.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "atlas",
    about = "Chat Atlas — incremental, content-addressed enrichment for exported chat archives",
    version,
    long_about = "Chat Atlas ingests exported chat archives and pushes each chat through a \
    chain of enrichment stages (chunking, embedding, tagging, clustering, summarization, \
    positioning, graph loading). Stages track processed content by hash, so re-running over \
    overlapping exports never duplicates records or repeats expensive external calls."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/atlas.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every stage command.
#[derive(Args, Debug, Clone, Default)]
struct StageArgs {
    /// Reprocess all items regardless of prior state, without mutating
    /// the state index for items it would otherwise skip.
    #[arg(long)]
    force: bool,

    /// Wipe this stage's state index before running.
    #[arg(long)]
    clear_state: bool,

    /// Report would-be counts without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Maximum number of new items to process this run.
    #[arg(long)]
    limit: Option<usize>,

    /// Verify external dependencies and exit without processing.
    #[arg(long)]
    check_only: bool,
}

impl StageArgs {
    fn options(&self) -> StageOptions {
        StageOptions {
            force: self.force,
            clear_state: self.clear_state,
            dry_run: self.dry_run,
            limit: self.limit,
        }
    }
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize data directories and the graph-store schema.
    ///
    /// Idempotent — running it multiple times is safe.
    Init,

    /// Show per-stage state and stream counts.
    Status,

    /// Ingest a chat export archive.
    ///
    /// The path may be a JSON export file, a directory of them, or a
    /// `.zip` bundle. Conversations are normalized and content-hashed;
    /// a conversation already ingested from an earlier (overlapping)
    /// archive is skipped.
    Ingest {
        /// Archive path: `.json` file, directory, or `.zip` bundle.
        archive: PathBuf,

        #[command(flatten)]
        stage: StageArgs,
    },

    /// Split ingested chats into message-window chunks.
    Chunk {
        #[command(flatten)]
        stage: StageArgs,
    },

    /// Embed chunks and upsert vectors into the vector store.
    Embed {
        #[command(flatten)]
        stage: StageArgs,
    },

    /// Tag chunks via the configured LLM provider.
    Tag {
        #[command(flatten)]
        stage: StageArgs,
    },

    /// Assign chunks to topics by embedding similarity.
    Cluster {
        #[command(flatten)]
        stage: StageArgs,
    },

    /// Generate summaries for topics whose membership changed.
    Summarize {
        #[command(flatten)]
        stage: StageArgs,
    },

    /// Project chunk embeddings to 2-D layout coordinates.
    Position {
        #[command(flatten)]
        stage: StageArgs,
    },

    /// Merge stream records into the graph store.
    Load {
        #[command(flatten)]
        stage: StageArgs,
    },

    /// Derive HAS_CHUNK and SIMILAR_TO relationships in the graph.
    ///
    /// Always recomputable: merges by key, so repeated runs refresh
    /// weights without changing edge counts.
    Link {
        /// Verify the graph store is reachable and exit.
        #[arg(long)]
        check_only: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            std::fs::create_dir_all(cfg.streams_dir())?;
            std::fs::create_dir_all(cfg.state_dir())?;
            let pool = chat_atlas::db::connect(&cfg.storage.db_path).await?;
            chat_atlas::migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Initialized data directories and graph schema.");
        }
        Commands::Status => {
            chat_atlas::status::run_status(&cfg).await?;
        }
        Commands::Ingest { archive, stage } => {
            chat_atlas::ingest::run_ingest(&cfg, &archive, stage.options(), stage.check_only)
                .await?;
        }
        Commands::Chunk { stage } => {
            chat_atlas::chunk::run_chunk(&cfg, stage.options(), stage.check_only).await?;
        }
        Commands::Embed { stage } => {
            chat_atlas::embed_cmd::run_embed(&cfg, stage.options(), stage.check_only).await?;
        }
        Commands::Tag { stage } => {
            chat_atlas::tag_cmd::run_tag(&cfg, stage.options(), stage.check_only).await?;
        }
        Commands::Cluster { stage } => {
            chat_atlas::cluster::run_cluster(&cfg, stage.options(), stage.check_only).await?;
        }
        Commands::Summarize { stage } => {
            chat_atlas::summarize::run_summarize(&cfg, stage.options(), stage.check_only).await?;
        }
        Commands::Position { stage } => {
            chat_atlas::position::run_position(&cfg, stage.options(), stage.check_only).await?;
        }
        Commands::Load { stage } => {
            chat_atlas::load::run_load(&cfg, stage.options(), stage.check_only).await?;
        }
        Commands::Link { check_only } => {
            chat_atlas::relate::run_link(&cfg, check_only).await?;
        }
    }

    Ok(())
}
