//! Embedding provider abstraction and implementations.
//!
//! The pipeline treats embedding as a replaceable external transform: a
//! batch of texts in, one vector per text out, idempotent by content.
//! Which implementation runs is a configuration decision
//! (`embedding.provider`), not a branch in orchestration code:
//!
//! - **[`OpenAiEmbedder`]** — calls the OpenAI embeddings API with
//!   timeout, bounded retry, and backoff.
//! - **[`MockEmbedder`]** — deterministic hash-derived vectors; lets the
//!   full pipeline run offline and reproducibly.
//!
//! Also provides the vector utilities shared with the vector store:
//! [`vec_to_blob`], [`blob_to_vec`], [`cosine_similarity`].

use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;
use crate::errors::{PipelineError, Result};
use crate::retry::RetryPolicy;

/// Capability interface for embedding backends.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier recorded alongside each vector.
    fn model_name(&self) -> &str;

    /// Vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Instantiate the provider selected by configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "mock" => Ok(Box::new(MockEmbedder::new(config.dims.unwrap_or(64)))),
        "openai" => Ok(Box::new(OpenAiEmbedder::new(config)?)),
        "disabled" => Err(PipelineError::Unavailable(
            "embedding provider is disabled".into(),
        )),
        other => Err(PipelineError::Unavailable(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Mock provider ============

/// Deterministic offline embedder: expands the SHA-256 of the text into a
/// normalized vector. Equal content always embeds identically, which is
/// exactly the property the pipeline's dedup contract relies on.
pub struct MockEmbedder {
    dims: usize,
}

impl MockEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    fn model_name(&self) -> &str {
        "mock-embedder"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = Vec::with_capacity(self.dims);
                let mut seed = text.as_bytes().to_vec();
                while vector.len() < self.dims {
                    let mut hasher = Sha256::new();
                    hasher.update(&seed);
                    let block = hasher.finalize();
                    for word in block.chunks_exact(4) {
                        if vector.len() >= self.dims {
                            break;
                        }
                        let raw = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                        vector.push((raw % 2000) as f32 / 1000.0 - 1.0);
                    }
                    seed = block.to_vec();
                }
                normalize(&mut vector);
                vector
            })
            .collect())
    }
}

fn normalize(vector: &mut [f32]) {
    let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for v in vector {
            *v /= magnitude;
        }
    }
}

// ============ OpenAI provider ============

/// Embedding provider calling `POST /v1/embeddings`.
///
/// Requires `OPENAI_API_KEY` in the environment. Rate limits and server
/// errors are transient (retried per the policy); other client errors are
/// systemic and abort the stage.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    timeout: Duration,
    retry: RetryPolicy,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            PipelineError::Unavailable("embedding.model required for openai provider".into())
        })?;
        let dims = config.dims.ok_or_else(|| {
            PipelineError::Unavailable("embedding.dims required for openai provider".into())
        })?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(PipelineError::Unavailable(
                "OPENAI_API_KEY environment variable not set".into(),
            ));
        }
        Ok(Self {
            model,
            dims,
            timeout: Duration::from_secs(config.timeout_secs),
            retry: RetryPolicy::exponential(config.max_retries, Duration::from_secs(1)),
        })
    }

    async fn call_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| PipelineError::Unavailable("OPENAI_API_KEY not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| PipelineError::Unavailable(e.to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Transform(format!("embedding request failed: {}", e)))?;

        let status = resp.status();
        if status.is_success() {
            let json: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| PipelineError::Transform(e.to_string()))?;
            return parse_embedding_response(&json);
        }

        let text = resp.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            Err(PipelineError::Transform(format!(
                "embedding API error {}: {}",
                status, text
            )))
        } else {
            Err(PipelineError::Unavailable(format!(
                "embedding API error {}: {}",
                status, text
            )))
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.retry.run(|_| self.call_once(texts)).await
    }
}

fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json.get("data").and_then(|d| d.as_array()).ok_or_else(|| {
        PipelineError::Transform("invalid embedding response: missing data array".into())
    })?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                PipelineError::Transform("invalid embedding response: missing embedding".into())
            })?;
        embeddings.push(
            embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }
    Ok(embeddings)
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Full digest of a vector's encoded bytes. Stages downstream of
/// embedding use this as the content fingerprint their state is derived
/// from.
pub fn vector_digest(vector: &[f32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(vec_to_blob(vector));
    hex::encode(hasher.finalize())
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched
/// vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn test_mock_embedder_deterministic() {
        let embedder = MockEmbedder::new(64);
        let a = embedder.embed(&["hello world".to_string()]).await.unwrap();
        let b = embedder.embed(&["hello world".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
    }

    #[tokio::test]
    async fn test_mock_embedder_distinguishes_content() {
        let embedder = MockEmbedder::new(64);
        let out = embedder
            .embed(&["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert_ne!(out[0], out[1]);
    }

    #[tokio::test]
    async fn test_mock_embedder_normalized() {
        let embedder = MockEmbedder::new(32);
        let out = embedder.embed(&["some text".to_string()]).await.unwrap();
        let magnitude: f32 = out[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_create_provider_rejects_disabled() {
        let config = crate::config::EmbeddingConfig {
            provider: "disabled".into(),
            ..Default::default()
        };
        assert!(create_provider(&config).is_err());
    }
}
