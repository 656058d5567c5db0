//! Embedding provider abstraction and implementations.
//!
//! The engine never computes embeddings itself. It consumes an [`Embedder`]
//! and normalizes whatever comes back into a
//! [`UnitVector`](crate::vector::UnitVector) before storing or comparing it.
//!
//! Provided adapters:
//! - **[`DisabledEmbedder`]**: always fails with [`EmbeddingError::Disabled`];
//!   nodes are stored without embeddings.
//! - **[`OpenAiEmbedder`]**: `POST https://api.openai.com/v1/embeddings`.
//! - **[`OllamaEmbedder`]**: `POST {url}/api/embeddings` against a local Ollama.
//!
//! Use [`create_embedder`] to pick one from configuration.
//!
//! # Retry Strategy
//!
//! The HTTP adapters use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;

/// Errors returned by an [`Embedder`].
#[derive(Debug, Clone, Error)]
pub enum EmbeddingError {
    #[error("embedding provider is disabled")]
    Disabled,

    #[error("embedding provider rejected credentials: {0}")]
    Auth(String),

    #[error("embedding provider rate limited the request: {0}")]
    RateLimited(String),

    #[error("embedding provider server error: {0}")]
    Server(String),

    #[error("embedding provider unreachable: {0}")]
    Network(String),

    #[error("embedding provider rejected the input: {0}")]
    Rejected(String),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

impl EmbeddingError {
    /// True for failures that will affect every subsequent request too.
    ///
    /// Consecutive systemic failures trip the ingestion circuit breaker.
    /// [`Rejected`](Self::Rejected) and
    /// [`InvalidResponse`](Self::InvalidResponse) are tied to one input.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            EmbeddingError::Disabled
                | EmbeddingError::Auth(_)
                | EmbeddingError::RateLimited(_)
                | EmbeddingError::Server(_)
                | EmbeddingError::Network(_)
        )
    }
}

/// A text embedding backend.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Vector dimensionality the model produces. `0` when disabled.
    fn dims(&self) -> usize;

    /// Embed one text. The result is raw, not yet normalized.
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError>;
}

// ============ Disabled ============

/// Used when `embedding.provider = "disabled"`.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
}

// ============ OpenAI ============

const OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";

/// Calls the OpenAI embeddings API. Requires `OPENAI_API_KEY`.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
            dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let request = self
            .client
            .post(OPENAI_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);

        let json = send_with_retry(request, self.max_retries).await?;
        parse_openai_response(&json)
    }
}

/// Extracts `data[0].embedding`.
fn parse_openai_response(
    json: &serde_json::Value,
) -> std::result::Result<Vec<f32>, EmbeddingError> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing data[0].embedding".into()))?;

    parse_float_array(embedding)
}

// ============ Ollama ============

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Calls a local Ollama server's `/api/embeddings` endpoint.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;

        let base = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/embeddings", base.trim_end_matches('/')),
            model,
            dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": text,
        });

        let request = self.client.post(&self.endpoint).json(&body);
        let json = send_with_retry(request, self.max_retries).await?;

        let embedding = json
            .get("embedding")
            .ok_or_else(|| EmbeddingError::InvalidResponse("missing embedding".into()))?;
        parse_float_array(embedding)
    }
}

// ============ Shared transport ============

/// Send a JSON request with retry/backoff and return the decoded body.
async fn send_with_retry(
    request: reqwest::RequestBuilder,
    max_retries: u32,
) -> std::result::Result<serde_json::Value, EmbeddingError> {
    let mut last_err = EmbeddingError::Network("no attempt made".into());

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(attempt, delay_secs = delay.as_secs(), "Retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let Some(req) = request.try_clone() else {
            return Err(EmbeddingError::InvalidResponse(
                "request body cannot be replayed".into(),
            ));
        };

        match req.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response
                        .json::<serde_json::Value>()
                        .await
                        .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()));
                }

                let body_text = response.text().await.unwrap_or_default();
                let message = format!("{}: {}", status, body_text);

                if status.as_u16() == 429 {
                    last_err = EmbeddingError::RateLimited(message);
                    continue;
                }
                if status.is_server_error() {
                    last_err = EmbeddingError::Server(message);
                    continue;
                }

                // Client error (not 429), no retry
                return Err(match status.as_u16() {
                    401 | 403 => EmbeddingError::Auth(message),
                    _ => EmbeddingError::Rejected(message),
                });
            }
            Err(e) => {
                last_err = EmbeddingError::Network(e.to_string());
                continue;
            }
        }
    }

    warn!(retries = max_retries, error = %last_err, "Embedding request failed after retries");
    Err(last_err)
}

fn parse_float_array(
    value: &serde_json::Value,
) -> std::result::Result<Vec<f32>, EmbeddingError> {
    let items = value
        .as_array()
        .ok_or_else(|| EmbeddingError::InvalidResponse("embedding is not an array".into()))?;

    items
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbeddingError::InvalidResponse("non-numeric component".into()))
        })
        .collect()
}

/// Create the [`Embedder`] named by `config.provider`.
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"openai"` | [`OpenAiEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
