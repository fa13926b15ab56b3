//! Message-window chunker.
//!
//! Splits each chat's message sequence into contiguous windows bounded by
//! a configurable character budget, preserving message boundaries where
//! possible. A single oversized message is hard-split at whitespace. Each
//! chunk's identity is the fingerprint of {content, chat id, first source
//! message id, role} — reproducible from the chat alone, so re-chunking
//! yields the same ids in the same order.

use async_trait::async_trait;

use crate::config::Config;
use crate::errors::Result;
use crate::hashing;
use crate::models::{ChatRecord, ChunkRecord};
use crate::runner::{ItemOutcome, Stage, StageOptions, StageRunner, Transform};
use crate::stream::{read_stream, StreamWriter};

/// Derive the chunk windows for one chat.
pub fn chunk_chat(chat: &ChatRecord, max_chars: usize) -> Result<Vec<ChunkRecord>> {
    let mut chunks = Vec::new();
    let mut window: Vec<&crate::models::MessageRecord> = Vec::new();
    let mut window_len = 0usize;

    for message in &chat.messages {
        // Oversized message: flush the window, then hard-split.
        if message.text.len() > max_chars {
            flush_window(chat, &mut window, &mut window_len, &mut chunks)?;
            for piece in split_text(&message.text, max_chars) {
                chunks.push(make_chunk(chat, &[message], &piece)?);
            }
            continue;
        }

        let would_be = if window.is_empty() {
            message.text.len()
        } else {
            window_len + 2 + message.text.len()
        };
        if would_be > max_chars && !window.is_empty() {
            flush_window(chat, &mut window, &mut window_len, &mut chunks)?;
        }

        window_len = if window.is_empty() {
            message.text.len()
        } else {
            window_len + 2 + message.text.len()
        };
        window.push(message);
    }

    flush_window(chat, &mut window, &mut window_len, &mut chunks)?;

    // A chat with literally repeated content can produce identical
    // windows; keep the first so no two persisted chunks share an id.
    let mut seen = std::collections::HashSet::new();
    chunks.retain(|chunk| seen.insert(chunk.id.clone()));
    Ok(chunks)
}

fn flush_window<'a>(
    chat: &ChatRecord,
    window: &mut Vec<&'a crate::models::MessageRecord>,
    window_len: &mut usize,
    chunks: &mut Vec<ChunkRecord>,
) -> Result<()> {
    if window.is_empty() {
        return Ok(());
    }
    let content = window
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let messages = std::mem::take(window);
    *window_len = 0;
    chunks.push(make_chunk(chat, &messages, &content)?);
    Ok(())
}

fn make_chunk(
    chat: &ChatRecord,
    messages: &[&crate::models::MessageRecord],
    content: &str,
) -> Result<ChunkRecord> {
    let first = messages[0];
    let fingerprint = hashing::chunk_fingerprint(content, &chat.id, &first.id, &first.role)?;
    Ok(ChunkRecord {
        id: fingerprint.id,
        digest: fingerprint.digest,
        chat_id: chat.id.clone(),
        source_message_id: first.id.clone(),
        role: first.role.clone(),
        content: content.to_string(),
        message_count: messages.len(),
    })
}

/// Hard-split text at the budget, preferring newline then space
/// boundaries.
fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            pieces.push(remaining.trim().to_string());
            break;
        }
        let mut split_at = max_chars;
        while !remaining.is_char_boundary(split_at) {
            split_at -= 1;
        }
        let cut = remaining[..split_at]
            .rfind('\n')
            .or_else(|| remaining[..split_at].rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or(split_at);
        pieces.push(remaining[..cut].trim().to_string());
        remaining = &remaining[cut..];
    }
    pieces.retain(|p| !p.is_empty());
    pieces
}

/// Transform wrapping the chunker for the stage runner: one chat in, its
/// chunk set out.
struct ChunkTransform {
    max_chars: usize,
}

#[async_trait]
impl Transform<ChatRecord, Vec<ChunkRecord>> for ChunkTransform {
    async fn process(&self, batch: &[ChatRecord]) -> Result<Vec<ItemOutcome<Vec<ChunkRecord>>>> {
        Ok(batch
            .iter()
            .map(|chat| match chunk_chat(chat, self.max_chars) {
                Ok(chunks) => ItemOutcome::Produced(chunks),
                Err(e) => ItemOutcome::Failed {
                    reason: e.to_string(),
                },
            })
            .collect())
    }
}

/// Run the chunking stage: chats stream → chunks stream, keyed by chat id.
pub async fn run_chunk(
    config: &Config,
    options: StageOptions,
    check_only: bool,
) -> anyhow::Result<()> {
    if check_only {
        println!("chunk (check-only)");
        println!("  no external dependencies");
        println!("ok");
        return Ok(());
    }

    let dry_run = options.dry_run;
    let mut runner = StageRunner::new(config, Stage::Chunk, options)?;
    let upstream = read_stream::<ChatRecord>(&config.streams_dir(), "chats")?;
    let transform = ChunkTransform {
        max_chars: config.chunking.max_chars,
    };
    let key_fn = |chat: &ChatRecord| Ok((chat.id.clone(), chat.digest.clone()));

    let mut chunks_written = 0usize;
    let report = if dry_run {
        runner
            .run(upstream, key_fn, &transform, |_: &[Vec<ChunkRecord>]| Ok(()), "dry-run")
            .await?
    } else {
        let mut writer = StreamWriter::open(&config.streams_dir(), "chunks")?;
        let locator = writer.path().display().to_string();
        runner
            .run(
                upstream,
                key_fn,
                &transform,
                |batch: &[Vec<ChunkRecord>]| {
                    let flat: Vec<ChunkRecord> = batch.iter().flatten().cloned().collect();
                    chunks_written += flat.len();
                    writer.append_batch(&flat)
                },
                &locator,
            )
            .await?
    };

    println!("chunk{}", if dry_run { " (dry-run)" } else { "" });
    println!("  chats scanned: {}", report.scanned);
    println!("  already chunked: {}", report.skipped);
    println!("  chats processed: {}", report.processed);
    if !dry_run {
        println!("  chunks written: {}", chunks_written);
    }
    if report.failed > 0 {
        println!("  failed: {}", report.failed);
    }
    println!("ok");
    Ok(())
}
