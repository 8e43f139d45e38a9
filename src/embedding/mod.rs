//! HTTP embedding providers.
//!
//! Concrete [`Embedder`] implementations selected by
//! [`EmbeddingProviderKind`]:
//! - **[`OllamaEmbedder`]** calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`OpenAIEmbedder`]** calls `POST /v1/embeddings` on the OpenAI API.
//!
//! `disabled` has no embedder; the engine then runs keyword-only.
//!
//! # Retry Strategy
//!
//! Both providers share [`post_with_retry`]:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use inkwell_rag_core::embedding::Embedder;

/// Build the embedder for `config`, or `None` when embeddings are disabled.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Option<Arc<dyn Embedder>>> {
    match config.provider {
        EmbeddingProviderKind::Disabled => Ok(None),
        EmbeddingProviderKind::Ollama => Ok(Some(Arc::new(OllamaEmbedder::new(config)?))),
        EmbeddingProviderKind::OpenAI => Ok(Some(Arc::new(OpenAIEmbedder::new(config)?))),
    }
}

/// Shared HTTP settings for a provider.
#[derive(Debug, Clone)]
struct HttpSettings {
    model: String,
    dims: usize,
    base_url: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl HttpSettings {
    fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let provider = config.provider.as_str();
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for {} provider", provider))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for {} provider", provider))?;
        let base_url = config
            .base_url()
            .ok_or_else(|| anyhow!("embedding.url required for {} provider", provider))?
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            base_url,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            client,
        })
    }

    fn check_dims(&self, vectors: &[Vec<f32>], expected: usize) -> Result<()> {
        if vectors.len() != expected {
            bail!(
                "embedding response has {} vectors for {} inputs",
                vectors.len(),
                expected
            );
        }
        if let Some(v) = vectors.iter().find(|v| v.len() != self.dims) {
            bail!(
                "embedding model '{}' returned {} dims, expected {}",
                self.model,
                v.len(),
                self.dims
            );
        }
        Ok(())
    }
}

/// POST `body` to `url`, retrying transient failures with exponential backoff.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    label: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(provider = label, attempt, ?delay, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json().await?);
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow!("{} connection error at {}: {}", label, url, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} embedding failed after retries", label)))
}

fn parse_vector(value: &serde_json::Value, label: &str) -> Result<Vec<f32>> {
    Ok(value
        .as_array()
        .ok_or_else(|| anyhow!("Invalid {} response: embedding is not an array", label))?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ Ollama ============

/// Embedder backed by a local Ollama instance (`POST {url}/api/embed`).
pub struct OllamaEmbedder {
    http: HttpSettings,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            http: HttpSettings::from_config(config)?,
        })
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(|v| parse_vector(v, "Ollama"))
        .collect()
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.http.model
    }

    fn dims(&self) -> usize {
        self.http.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.http.base_url);
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.http.batch_size) {
            let body = serde_json::json!({
                "model": self.http.model,
                "input": batch,
            });
            let json =
                post_with_retry(&self.http.client, &url, None, &body, self.http.max_retries, "Ollama")
                    .await?;
            let vectors = parse_ollama_response(&json)?;
            self.http.check_dims(&vectors, batch.len())?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

// ============ OpenAI ============

/// Embedder backed by the OpenAI embeddings API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIEmbedder {
    http: HttpSettings,
    api_key: String,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let env = config
            .provider
            .capabilities()
            .api_key_env
            .unwrap_or("OPENAI_API_KEY");
        let api_key =
            std::env::var(env).map_err(|_| anyhow!("{} environment variable not set", env))?;
        Ok(Self {
            http: HttpSettings::from_config(config)?,
            api_key,
        })
    }
}

/// Extract `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, parse_vector(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.http.model
    }

    fn dims(&self) -> usize {
        self.http.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.http.base_url);
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.http.batch_size) {
            let body = serde_json::json!({
                "model": self.http.model,
                "input": batch,
            });
            let json = post_with_retry(
                &self.http.client,
                &url,
                Some(&self.api_key),
                &body,
                self.http.max_retries,
                "OpenAI",
            )
            .await?;
            let vectors = parse_openai_response(&json)?;
            self.http.check_dims(&vectors, batch.len())?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_has_no_embedder() {
        assert!(create_embedder(&EmbeddingConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_ollama_embedder_from_config() {
        let config = EmbeddingConfig {
            provider: EmbeddingProviderKind::Ollama,
            model: Some("nomic-embed-text".to_string()),
            dims: Some(768),
            ..EmbeddingConfig::default()
        };
        let embedder = create_embedder(&config).unwrap().unwrap();
        assert_eq!(embedder.model_name(), "nomic-embed-text");
        assert_eq!(embedder.dims(), 768);
    }

    #[test]
    fn test_missing_model_is_an_error() {
        let config = EmbeddingConfig {
            provider: EmbeddingProviderKind::Ollama,
            dims: Some(8),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({"embeddings": [[0.1, 0.2], [0.3, 0.4]]});
        let v = parse_ollama_response(&json).unwrap();
        assert_eq!(v.len(), 2);
        assert!((v[1][0] - 0.3).abs() < 1e-6);
        assert!(parse_ollama_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({"data": [
            {"index": 1, "embedding": [2.0]},
            {"index": 0, "embedding": [1.0]},
        ]});
        let v = parse_openai_response(&json).unwrap();
        assert_eq!(v, vec![vec![1.0], vec![2.0]]);
    }

    #[tokio::test]
    async fn test_unreachable_ollama_fails_without_retries() {
        let config = EmbeddingConfig {
            provider: EmbeddingProviderKind::Ollama,
            model: Some("m".to_string()),
            dims: Some(2),
            url: Some("http://127.0.0.1:9".to_string()),
            max_retries: 0,
            timeout_secs: 2,
            ..EmbeddingConfig::default()
        };
        let embedder = OllamaEmbedder::new(&config).unwrap();
        let err = embedder.embed(&["x".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("Ollama"));
    }
}
