//! Canonical, content-only entity identity.
//!
//! Every stage records its output under a fingerprint computed here, so an
//! entity gets the same id no matter which archive it arrived in or when it
//! was reprocessed. Volatile metadata (timestamps, file provenance, titles)
//! never participates in a fingerprint.
//!
//! The canonical form is JSON with object keys written in sorted order and
//! no insignificant whitespace; the digest is SHA-256. Human-facing ids are
//! an entity-type prefix plus the first 16 hex characters of the digest —
//! enough bits that collisions are negligible at expected corpus sizes. The
//! full digest is kept alongside the id in stage state records and used to
//! detect conflicts.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::{PipelineError, Result};

/// Hex characters kept in a human-facing id.
const ID_HEX_LEN: usize = 16;

/// A content fingerprint: the truncated human-facing id and the full digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// `<entity>_<16 hex chars>` — the id used everywhere downstream.
    pub id: String,
    /// Full 64-hex-char SHA-256 digest, used for conflict detection.
    pub digest: String,
}

/// Serialize a JSON value canonically: object keys sorted, no extra
/// whitespace. Arrays keep their order — order is semantic for message
/// sequences.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Digest a canonical value under an entity-type prefix.
pub fn fingerprint_value(entity: &str, value: &Value) -> Fingerprint {
    let canonical = canonical_json(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());
    Fingerprint {
        id: format!("{}_{}", entity, &digest[..ID_HEX_LEN]),
        digest,
    }
}

/// Normalize a message role for hashing: ASCII-lowercased, trimmed.
pub fn normalize_role(role: &str) -> String {
    role.trim().to_ascii_lowercase()
}

/// Normalize message text for hashing: surrounding whitespace trimmed,
/// Windows line endings folded.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

/// Fingerprint a chat from its normalized (role, text) message sequence.
///
/// The same logical conversation yields the same id regardless of file
/// origin, export time, or title edits.
pub fn chat_fingerprint(messages: &[(String, String)]) -> Result<Fingerprint> {
    if messages.is_empty() {
        return Err(PipelineError::MalformedEntity {
            entity: "chat",
            field: "messages",
        });
    }
    let items: Vec<Value> = messages
        .iter()
        .map(|(role, text)| {
            serde_json::json!({
                "role": normalize_role(role),
                "text": normalize_text(text),
            })
        })
        .collect();
    Ok(fingerprint_value("chat", &Value::Array(items)))
}

/// Fingerprint a chunk from {content, chat id, first source message id,
/// role}. Reproducible from this tuple alone — no random or run-dependent
/// component.
pub fn chunk_fingerprint(
    content: &str,
    chat_id: &str,
    source_message_id: &str,
    role: &str,
) -> Result<Fingerprint> {
    if content.trim().is_empty() {
        return Err(PipelineError::MalformedEntity {
            entity: "chunk",
            field: "content",
        });
    }
    if chat_id.is_empty() {
        return Err(PipelineError::MalformedEntity {
            entity: "chunk",
            field: "chat_id",
        });
    }
    if source_message_id.is_empty() {
        return Err(PipelineError::MalformedEntity {
            entity: "chunk",
            field: "source_message_id",
        });
    }
    let value = serde_json::json!({
        "content": content,
        "chat_id": chat_id,
        "source_message_id": source_message_id,
        "role": normalize_role(role),
    });
    Ok(fingerprint_value("chunk", &value))
}

/// Fingerprint a topic from its member chunk ids. Membership changes
/// produce a new digest, which is what re-triggers summarization.
pub fn topic_fingerprint(cluster_id: i64, member_ids: &[String]) -> Result<Fingerprint> {
    if member_ids.is_empty() {
        return Err(PipelineError::MalformedEntity {
            entity: "topic",
            field: "members",
        });
    }
    let mut sorted: Vec<&str> = member_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let value = serde_json::json!({
        "cluster_id": cluster_id,
        "members": sorted,
    });
    Ok(fingerprint_value("topic", &value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(r, t)| (r.to_string(), t.to_string()))
            .collect()
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = serde_json::json!({"b": 1, "a": {"d": 2, "c": 3}});
        assert_eq!(canonical_json(&value), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn test_canonical_json_preserves_array_order() {
        let value = serde_json::json!([3, 1, 2]);
        assert_eq!(canonical_json(&value), "[3,1,2]");
    }

    #[test]
    fn test_chat_fingerprint_ignores_volatile_metadata() {
        // Same conversation, different surrounding whitespace and role case.
        let a = chat_fingerprint(&msgs(&[("user", "hello"), ("assistant", "hi there")])).unwrap();
        let b = chat_fingerprint(&msgs(&[("User", "  hello  "), ("ASSISTANT", "hi there\n")]))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_chat_fingerprint_differs_on_content() {
        let a = chat_fingerprint(&msgs(&[("user", "hello")])).unwrap();
        let b = chat_fingerprint(&msgs(&[("user", "goodbye")])).unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn test_chat_fingerprint_order_sensitive() {
        let a = chat_fingerprint(&msgs(&[("user", "one"), ("user", "two")])).unwrap();
        let b = chat_fingerprint(&msgs(&[("user", "two"), ("user", "one")])).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_empty_chat_is_malformed() {
        let err = chat_fingerprint(&[]).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MalformedEntity { entity: "chat", .. }
        ));
    }

    #[test]
    fn test_id_format() {
        let fp = chat_fingerprint(&msgs(&[("user", "hello")])).unwrap();
        assert!(fp.id.starts_with("chat_"));
        assert_eq!(fp.id.len(), "chat_".len() + 16);
        assert_eq!(fp.digest.len(), 64);
        assert!(fp.digest.starts_with(fp.id.trim_start_matches("chat_")));
    }

    #[test]
    fn test_chunk_fingerprint_reproducible() {
        let a = chunk_fingerprint("some content", "chat_abc", "chat_abc:0", "user").unwrap();
        let b = chunk_fingerprint("some content", "chat_abc", "chat_abc:0", "user").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_chunk_fingerprint_requires_fields() {
        assert!(chunk_fingerprint("", "chat_abc", "chat_abc:0", "user").is_err());
        assert!(chunk_fingerprint("content", "", "chat_abc:0", "user").is_err());
        assert!(chunk_fingerprint("content", "chat_abc", "", "user").is_err());
    }

    #[test]
    fn test_topic_fingerprint_membership_order_independent() {
        let a = topic_fingerprint(3, &["chunk_b".into(), "chunk_a".into()]).unwrap();
        let b = topic_fingerprint(3, &["chunk_a".into(), "chunk_b".into()]).unwrap();
        assert_eq!(a, b);
    }
}
