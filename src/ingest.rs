//! Archive ingestion: export bundles → normalized chat stream.
//!
//! An archive is a batch input unit — a single JSON export, a directory of
//! them, or a `.zip` bundle. Archives are read once per run and never
//! persisted; what survives is the `chats` stream, keyed by content hash,
//! so the same conversation arriving in two overlapping exports lands
//! exactly once no matter how often ingestion re-runs.
//!
//! Two export layouts are understood: a flat `{"conversations": [...]}`
//! (or bare array) where each conversation carries a `messages` list, and
//! the mapping-tree layout where messages hang off a parent/children node
//! graph and are collected in tree order.

use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context};
use chrono::{DateTime, TimeZone, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::Config;
use crate::errors::{PipelineError, Result};
use crate::hashing;
use crate::models::{message_id, ChatRecord, MessageRecord};
use crate::runner::{PassThrough, Stage, StageOptions, StageRunner};
use crate::stream::StreamWriter;

/// A conversation as it appears in an export, before normalization.
#[derive(Debug, Clone)]
struct RawChat {
    title: String,
    created_at: Option<DateTime<Utc>>,
    messages: Vec<RawMessage>,
}

#[derive(Debug, Clone)]
struct RawMessage {
    role: String,
    text: String,
    timestamp: Option<DateTime<Utc>>,
}

/// Run the ingest stage over one archive path.
pub async fn run_ingest(
    config: &Config,
    archive: &Path,
    options: StageOptions,
    check_only: bool,
) -> anyhow::Result<()> {
    if !archive.exists() {
        bail!("Archive path does not exist: {}", archive.display());
    }

    if check_only {
        let docs = load_archive_documents(config, archive)?;
        println!("ingest {} (check-only)", archive.display());
        println!("  archive readable: {} document(s)", docs.len());
        println!("ok");
        return Ok(());
    }

    let docs = load_archive_documents(config, archive)?;
    let mut chats: Vec<Result<ChatRecord>> = Vec::new();
    for (origin, doc) in &docs {
        for conversation in conversations_in(doc) {
            match parse_conversation(conversation) {
                Some(raw) => chats.push(chat_from_raw(raw)),
                None => {
                    warn!(origin = %origin, "unrecognized conversation payload, skipping");
                    chats.push(Err(PipelineError::MalformedEntity {
                        entity: "chat",
                        field: "messages",
                    }));
                }
            }
        }
    }

    let dry_run = options.dry_run;
    let mut runner = StageRunner::new(config, Stage::Ingest, options)?;
    let key_fn = |chat: &ChatRecord| Ok((chat.id.clone(), chat.digest.clone()));

    let report = if dry_run {
        runner
            .run(chats, key_fn, &PassThrough, |_: &[ChatRecord]| Ok(()), "dry-run")
            .await?
    } else {
        let mut writer = StreamWriter::open(&config.streams_dir(), "chats")?;
        let locator = writer.path().display().to_string();
        runner
            .run(
                chats,
                key_fn,
                &PassThrough,
                |batch: &[ChatRecord]| writer.append_batch(batch),
                &locator,
            )
            .await?
    };

    if dry_run {
        println!("ingest {} (dry-run)", archive.display());
    } else {
        println!("ingest {}", archive.display());
    }
    println!("  archives read: {}", docs.len());
    println!("  chats scanned: {}", report.scanned);
    println!("  already ingested: {}", report.skipped);
    println!("  new chats: {}", report.processed);
    if report.failed > 0 {
        println!("  failed: {}", report.failed);
    }
    println!("ok");
    Ok(())
}

/// Read every JSON document the archive path yields: the file itself, all
/// matching files under a directory, or all matching entries in a zip
/// bundle.
fn load_archive_documents(config: &Config, archive: &Path) -> anyhow::Result<Vec<(String, Value)>> {
    let mut docs = Vec::new();

    if archive.is_dir() {
        let include = build_globset(&config.ingest.include_globs)?;
        for entry in WalkDir::new(archive) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(archive)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            if !include.is_match(&rel) {
                continue;
            }
            let content = std::fs::read_to_string(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            match serde_json::from_str(&content) {
                Ok(value) => docs.push((rel, value)),
                Err(e) => warn!(file = %rel, error = %e, "skipping unparseable archive file"),
            }
        }
        // Deterministic ordering regardless of directory walk order.
        docs.sort_by(|a, b| a.0.cmp(&b.0));
    } else if archive.extension().is_some_and(|ext| ext == "zip") {
        let file = std::fs::File::open(archive)
            .with_context(|| format!("Failed to open {}", archive.display()))?;
        let mut bundle = zip::ZipArchive::new(file)?;
        let mut names: Vec<String> = bundle
            .file_names()
            .filter(|name| name.ends_with(".json"))
            .map(|name| name.to_string())
            .collect();
        names.sort();
        for name in names {
            let mut entry = bundle.by_name(&name)?;
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            match serde_json::from_str(&content) {
                Ok(value) => docs.push((name, value)),
                Err(e) => warn!(entry = %name, error = %e, "skipping unparseable bundle entry"),
            }
        }
    } else {
        let content = std::fs::read_to_string(archive)
            .with_context(|| format!("Failed to read {}", archive.display()))?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("Archive is not valid JSON: {}", archive.display()))?;
        docs.push((archive.display().to_string(), value));
    }

    Ok(docs)
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// The conversation objects inside one export document.
fn conversations_in(doc: &Value) -> Vec<&Value> {
    match doc {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("conversations") {
                items.iter().collect()
            } else if map.contains_key("messages") || map.contains_key("mapping") {
                vec![doc]
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    }
}

fn parse_conversation(value: &Value) -> Option<RawChat> {
    let title = value
        .get("title")
        .and_then(|t| t.as_str())
        .unwrap_or("Untitled")
        .to_string();
    let created_at = value
        .get("create_time")
        .or_else(|| value.get("created_at"))
        .and_then(parse_timestamp);

    let messages = if let Some(mapping) = value.get("mapping").and_then(|m| m.as_object()) {
        walk_mapping(mapping)
    } else if let Some(items) = value.get("messages").and_then(|m| m.as_array()) {
        items.iter().filter_map(parse_message).collect()
    } else {
        return None;
    };

    Some(RawChat {
        title,
        created_at,
        messages,
    })
}

fn parse_message(value: &Value) -> Option<RawMessage> {
    let role = value
        .get("role")
        .and_then(|r| r.as_str())
        .or_else(|| {
            value
                .get("author")
                .and_then(|a| a.get("role"))
                .and_then(|r| r.as_str())
        })?
        .to_string();

    let text = if let Some(text) = value.get("text").and_then(|t| t.as_str()) {
        text.to_string()
    } else if let Some(content) = value.get("content") {
        match content {
            Value::String(s) => s.clone(),
            Value::Object(obj) => obj
                .get("parts")
                .and_then(|p| p.as_array())
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p.as_str())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default(),
            _ => String::new(),
        }
    } else {
        String::new()
    };

    let timestamp = value
        .get("create_time")
        .or_else(|| value.get("timestamp"))
        .and_then(parse_timestamp);

    Some(RawMessage {
        role,
        text,
        timestamp,
    })
}

/// Collect messages from a mapping-tree export in tree order: start at
/// the parentless root, descend children in listed order.
fn walk_mapping(mapping: &serde_json::Map<String, Value>) -> Vec<RawMessage> {
    let root = mapping
        .iter()
        .find(|(_, node)| node.get("parent").map_or(true, |p| p.is_null()))
        .map(|(id, _)| id.clone());

    let mut messages = Vec::new();
    let mut stack: Vec<String> = root.into_iter().collect();

    while let Some(node_id) = stack.pop() {
        let Some(node) = mapping.get(&node_id) else {
            continue;
        };
        if let Some(message) = node.get("message").filter(|m| !m.is_null()) {
            if let Some(raw) = parse_message(message) {
                messages.push(raw);
            }
        }
        if let Some(children) = node.get("children").and_then(|c| c.as_array()) {
            for child in children.iter().rev() {
                if let Some(id) = child.as_str() {
                    stack.push(id.to_string());
                }
            }
        }
    }

    messages
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            Utc.timestamp_opt(secs as i64, 0).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

/// Normalize a raw conversation into a content-addressed [`ChatRecord`].
fn chat_from_raw(raw: RawChat) -> Result<ChatRecord> {
    let kept: Vec<RawMessage> = raw
        .messages
        .into_iter()
        .filter(|m| !hashing::normalize_text(&m.text).is_empty())
        .collect();

    let pairs: Vec<(String, String)> = kept
        .iter()
        .map(|m| (m.role.clone(), m.text.clone()))
        .collect();
    let fingerprint = hashing::chat_fingerprint(&pairs)?;

    let messages = kept
        .into_iter()
        .enumerate()
        .map(|(position, m)| MessageRecord {
            id: message_id(&fingerprint.id, position),
            role: hashing::normalize_role(&m.role),
            text: hashing::normalize_text(&m.text),
            position,
            timestamp: m.timestamp,
        })
        .collect();

    Ok(ChatRecord {
        id: fingerprint.id,
        digest: fingerprint.digest,
        title: raw.title,
        created_at: raw.created_at,
        messages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_export(title: &str, messages: &[(&str, &str)]) -> Value {
        serde_json::json!({
            "conversations": [{
                "title": title,
                "create_time": 1700000000.0,
                "messages": messages
                    .iter()
                    .map(|(role, text)| serde_json::json!({"role": role, "text": text}))
                    .collect::<Vec<_>>(),
            }]
        })
    }

    #[test]
    fn test_flat_export_parses() {
        let doc = flat_export("Rust help", &[("user", "hi"), ("assistant", "hello")]);
        let convs = conversations_in(&doc);
        assert_eq!(convs.len(), 1);
        let raw = parse_conversation(convs[0]).unwrap();
        assert_eq!(raw.title, "Rust help");
        assert_eq!(raw.messages.len(), 2);
        assert_eq!(raw.messages[0].role, "user");
    }

    #[test]
    fn test_bare_array_export_parses() {
        let doc = serde_json::json!([
            {"title": "A", "messages": [{"role": "user", "text": "one"}]},
            {"title": "B", "messages": [{"role": "user", "text": "two"}]},
        ]);
        assert_eq!(conversations_in(&doc).len(), 2);
    }

    #[test]
    fn test_mapping_export_walks_tree_order() {
        let doc = serde_json::json!({
            "title": "Mapped",
            "mapping": {
                "root": {"parent": null, "message": null, "children": ["n1"]},
                "n1": {
                    "parent": "root",
                    "message": {"author": {"role": "user"}, "content": {"parts": ["first"]}},
                    "children": ["n2"],
                },
                "n2": {
                    "parent": "n1",
                    "message": {"author": {"role": "assistant"}, "content": {"parts": ["second"]}},
                    "children": [],
                },
            },
        });
        let raw = parse_conversation(&doc).unwrap();
        assert_eq!(raw.messages.len(), 2);
        assert_eq!(raw.messages[0].text, "first");
        assert_eq!(raw.messages[1].text, "second");
        assert_eq!(raw.messages[1].role, "assistant");
    }

    #[test]
    fn test_chat_from_raw_assigns_composite_message_ids() {
        let raw = parse_conversation(
            flat_export("T", &[("user", "alpha"), ("assistant", "beta")])
                .get("conversations")
                .unwrap()
                .get(0)
                .unwrap(),
        )
        .unwrap();
        let chat = chat_from_raw(raw).unwrap();
        assert_eq!(chat.messages[0].id, format!("{}:0", chat.id));
        assert_eq!(chat.messages[1].id, format!("{}:1", chat.id));
    }

    #[test]
    fn test_chat_from_raw_drops_empty_messages() {
        let raw = RawChat {
            title: "T".into(),
            created_at: None,
            messages: vec![
                RawMessage {
                    role: "system".into(),
                    text: "   ".into(),
                    timestamp: None,
                },
                RawMessage {
                    role: "user".into(),
                    text: "real".into(),
                    timestamp: None,
                },
            ],
        };
        let chat = chat_from_raw(raw).unwrap();
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].position, 0);
    }

    #[test]
    fn test_same_conversation_same_id_across_exports() {
        // Same messages, different titles and timestamps.
        let a = chat_from_raw(
            parse_conversation(
                flat_export("Export A", &[("user", "hi"), ("assistant", "hello")])
                    .get("conversations")
                    .unwrap()
                    .get(0)
                    .unwrap(),
            )
            .unwrap(),
        )
        .unwrap();
        let mut doc_b = flat_export("Export B renamed", &[("user", "hi"), ("assistant", "hello")]);
        doc_b["conversations"][0]["create_time"] = serde_json::json!(1800000000.0);
        let b = chat_from_raw(
            parse_conversation(doc_b.get("conversations").unwrap().get(0).unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn test_empty_conversation_is_malformed() {
        let raw = RawChat {
            title: "T".into(),
            created_at: None,
            messages: vec![],
        };
        assert!(chat_from_raw(raw).is_err());
    }
}
