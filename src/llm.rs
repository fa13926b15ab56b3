//! LLM tagging and summarization providers.
//!
//! Tagging and summarization are external transforms with the same
//! envelope as embedding: batches of `{id, content}` in, per-item results
//! or failures out, idempotent by content. The provider is picked by
//! `llm.provider` in configuration:
//!
//! - **[`OpenAiLlm`]** — chat-completions API with timeout and bounded
//!   retry.
//! - **[`MockLlm`]** — keyword-frequency tags and extractive summaries;
//!   deterministic and offline.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::LlmConfig;
use crate::errors::{PipelineError, Result};
use crate::retry::RetryPolicy;
use crate::runner::ItemOutcome;

/// One unit of tagging work.
#[derive(Debug, Clone)]
pub struct TagInput {
    pub id: String,
    pub content: String,
}

/// Capability interface for LLM-backed enrichment.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Tag a batch. Outcomes align by index with the input batch; an item
    /// the model rejects comes back as `Failed`, not as an error for the
    /// whole call.
    async fn tag(&self, items: &[TagInput]) -> Result<Vec<ItemOutcome<Vec<String>>>>;

    /// Produce a short summary of one topic's sampled content.
    async fn summarize(&self, content: &str) -> Result<String>;
}

/// Instantiate the provider selected by configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Box<dyn LlmProvider>> {
    match config.provider.as_str() {
        "mock" => Ok(Box::new(MockLlm::new(config.max_tags))),
        "openai" => Ok(Box::new(OpenAiLlm::new(config)?)),
        "disabled" => Err(PipelineError::Unavailable("llm provider is disabled".into())),
        other => Err(PipelineError::Unavailable(format!(
            "unknown llm provider: {}",
            other
        ))),
    }
}

// ============ Keyword extraction ============

/// Lowercased alphanumeric words, stopwords and short tokens removed.
pub fn extract_keywords(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .filter(|w| !is_stopword(w))
        .collect()
}

/// The `n` most frequent keywords, ties broken alphabetically so output
/// is stable across runs.
pub fn top_keywords(text: &str, n: usize) -> Vec<String> {
    let mut counts: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
    for word in extract_keywords(text) {
        *counts.entry(word).or_insert(0) += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(w, _)| w).collect()
}

fn is_stopword(word: &str) -> bool {
    matches!(
        word,
        "the" | "and"
            | "for"
            | "that"
            | "this"
            | "with"
            | "from"
            | "have"
            | "has"
            | "are"
            | "was"
            | "were"
            | "been"
            | "you"
            | "your"
            | "not"
            | "but"
            | "can"
            | "what"
            | "how"
            | "about"
            | "would"
            | "could"
            | "should"
            | "there"
            | "their"
            | "they"
            | "will"
            | "when"
            | "which"
            | "like"
            | "just"
            | "into"
            | "also"
            | "some"
            | "more"
            | "then"
            | "than"
            | "them"
            | "its"
            | "out"
            | "use"
            | "using"
            | "does"
            | "each"
            | "want"
            | "need"
            | "here"
    )
}

// ============ Mock provider ============

/// Offline provider: tags are the most frequent keywords, summaries are
/// extractive. Equal content always yields equal output.
pub struct MockLlm {
    max_tags: usize,
}

impl MockLlm {
    pub fn new(max_tags: usize) -> Self {
        Self { max_tags }
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    fn name(&self) -> &str {
        "mock-llm"
    }

    async fn tag(&self, items: &[TagInput]) -> Result<Vec<ItemOutcome<Vec<String>>>> {
        Ok(items
            .iter()
            .map(|item| {
                let tags = top_keywords(&item.content, self.max_tags);
                if tags.is_empty() {
                    ItemOutcome::Failed {
                        reason: "no taggable content".into(),
                    }
                } else {
                    ItemOutcome::Produced(tags)
                }
            })
            .collect())
    }

    async fn summarize(&self, content: &str) -> Result<String> {
        let keywords = top_keywords(content, 4);
        let lead: String = content
            .split_whitespace()
            .take(24)
            .collect::<Vec<_>>()
            .join(" ");
        if keywords.is_empty() {
            Ok(lead)
        } else {
            Ok(format!("{} [{}]", lead, keywords.join(", ")))
        }
    }
}

// ============ OpenAI provider ============

/// Provider calling `POST /v1/chat/completions` with a JSON response
/// contract. Requires `OPENAI_API_KEY`.
pub struct OpenAiLlm {
    model: String,
    max_tags: usize,
    timeout: Duration,
    retry: RetryPolicy,
}

impl OpenAiLlm {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            PipelineError::Unavailable("llm.model required for openai provider".into())
        })?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(PipelineError::Unavailable(
                "OPENAI_API_KEY environment variable not set".into(),
            ));
        }
        Ok(Self {
            model,
            max_tags: config.max_tags,
            timeout: Duration::from_secs(config.timeout_secs),
            retry: RetryPolicy::exponential(config.max_retries, Duration::from_secs(1)),
        })
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| PipelineError::Unavailable("OPENAI_API_KEY not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| PipelineError::Unavailable(e.to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.0,
        });

        let resp = client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Transform(format!("llm request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(PipelineError::Transform(format!(
                    "llm API error {}: {}",
                    status, text
                )))
            } else {
                Err(PipelineError::Unavailable(format!(
                    "llm API error {}: {}",
                    status, text
                )))
            };
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| PipelineError::Transform(e.to_string()))?;
        json.pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| PipelineError::Transform("empty llm response".into()))
    }
}

#[async_trait]
impl LlmProvider for OpenAiLlm {
    fn name(&self) -> &str {
        &self.model
    }

    async fn tag(&self, items: &[TagInput]) -> Result<Vec<ItemOutcome<Vec<String>>>> {
        let mut user = String::from(
            "Assign up to N topical tags to each item. Reply with a JSON object \
             mapping item id to an array of lowercase tag strings.\n",
        );
        user.push_str(&format!("N = {}\n", self.max_tags));
        for item in items {
            user.push_str(&format!("--- id: {}\n{}\n", item.id, item.content));
        }

        let raw = self
            .retry
            .run(|_| self.complete("You label chat excerpts with topical tags.", &user))
            .await?;

        let parsed: serde_json::Value = serde_json::from_str(raw.trim()).map_err(|e| {
            PipelineError::Transform(format!("llm tag response was not JSON: {}", e))
        })?;

        Ok(items
            .iter()
            .map(|item| {
                match parsed.get(&item.id).and_then(|v| v.as_array()) {
                    Some(tags) if !tags.is_empty() => ItemOutcome::Produced(
                        tags.iter()
                            .filter_map(|t| t.as_str())
                            .take(self.max_tags)
                            .map(|t| t.to_lowercase())
                            .collect(),
                    ),
                    _ => ItemOutcome::Failed {
                        reason: "missing from llm response".into(),
                    },
                }
            })
            .collect())
    }

    async fn summarize(&self, content: &str) -> Result<String> {
        let user = format!(
            "Summarize the common theme of these chat excerpts in one or two \
             sentences:\n\n{}",
            content
        );
        self.retry
            .run(|_| self.complete("You summarize groups of related chat excerpts.", &user))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_keywords_filters_stopwords() {
        let words = extract_keywords("How would you deploy the Kubernetes cluster?");
        assert!(words.contains(&"deploy".to_string()));
        assert!(words.contains(&"kubernetes".to_string()));
        assert!(!words.contains(&"would".to_string()));
        assert!(!words.contains(&"the".to_string()));
    }

    #[test]
    fn test_top_keywords_ranked_and_stable() {
        let text = "rust rust rust cargo cargo tokio";
        assert_eq!(top_keywords(text, 2), vec!["rust", "cargo"]);
        // Ties break alphabetically.
        let text = "zeta alpha";
        assert_eq!(top_keywords(text, 2), vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_mock_tags_deterministic() {
        let llm = MockLlm::new(3);
        let items = vec![TagInput {
            id: "chunk_a".into(),
            content: "Deploying kubernetes clusters with helm charts".into(),
        }];
        let a = llm.tag(&items).await.unwrap();
        let b = llm.tag(&items).await.unwrap();
        match (&a[0], &b[0]) {
            (ItemOutcome::Produced(x), ItemOutcome::Produced(y)) => assert_eq!(x, y),
            _ => panic!("expected produced outcomes"),
        }
    }

    #[tokio::test]
    async fn test_mock_tags_empty_content_fails_item() {
        let llm = MockLlm::new(3);
        let items = vec![TagInput {
            id: "chunk_a".into(),
            content: "a b c".into(),
        }];
        let out = llm.tag(&items).await.unwrap();
        assert!(matches!(out[0], ItemOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_mock_summary_mentions_keywords() {
        let llm = MockLlm::new(3);
        let summary = llm
            .summarize("Kubernetes deployment strategies. Kubernetes rollouts and canary releases.")
            .await
            .unwrap();
        assert!(summary.contains("kubernetes"));
    }
}
