//! Per-stage status report.

use std::collections::HashSet;

use crate::config::Config;
use crate::graph::{GraphStore, SqliteGraphStore};
use crate::runner::Stage;
use crate::state::StateStore;
use crate::stream::read_stream;
use crate::db;

/// The field that identifies a record in each stream.
fn key_field(stream: &str) -> &'static str {
    match stream {
        "chats" | "chunks" => "id",
        "summaries" => "cluster_id",
        _ => "chunk_id",
    }
}

fn distinct_records(config: &Config, stream: &str) -> anyhow::Result<usize> {
    let field = key_field(stream);
    let mut seen: HashSet<String> = HashSet::new();
    for record in read_stream::<serde_json::Value>(&config.streams_dir(), stream)? {
        let record = record?;
        if let Some(key) = record.get(field) {
            seen.insert(key.to_string());
        }
    }
    Ok(seen.len())
}

/// Print the state-store and stream counts for every stage, plus graph
/// totals when the store exists.
pub async fn run_status(config: &Config) -> anyhow::Result<()> {
    println!("{:<12} {:>10} {:>10}", "STAGE", "STATE", "RECORDS");
    for stage in Stage::all() {
        let state = StateStore::open(&config.state_dir(), stage.name())?;
        let records = match stage.stream_name() {
            Some(stream) => distinct_records(config, stream)?.to_string(),
            None => "-".to_string(),
        };
        println!("{:<12} {:>10} {:>10}", stage.name(), state.len(), records);
    }

    if config.storage.db_path.exists() {
        let pool = db::connect(&config.storage.db_path).await?;
        let store = SqliteGraphStore::new(pool);
        println!();
        println!(
            "graph: {} chats, {} messages, {} chunks, {} topics",
            store.count_nodes("chat").await?,
            store.count_nodes("message").await?,
            store.count_nodes("chunk").await?,
            store.count_nodes("topic").await?,
        );
        println!(
            "edges: {} HAS_CHUNK, {} IN_TOPIC, {} SIMILAR_TO",
            store.count_edges("HAS_CHUNK").await?,
            store.count_edges("IN_TOPIC").await?,
            store.count_edges("SIMILAR_TO").await?,
        );
        store.close().await;
    }

    Ok(())
}
