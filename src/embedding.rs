//! Embedding clients for the [`Embedder`] trait.
//!
//! - **[`OpenAiEmbedder`]** calls an OpenAI-compatible `/embeddings`
//!   endpoint with the session credential, batching and retrying with
//!   backoff.
//! - **[`DisabledEmbedder`]** fails every call; selected with
//!   `provider = "disabled"` so a misconfigured run stops at the first
//!   embedding instead of at startup.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 401/403 → [`CapabilityError::Auth`], never retried
//! - other 4xx → fail immediately
//! - network errors → retry
//!
//! Backoff doubles from 1s and caps at 32s. See [`crate::http`].

use async_trait::async_trait;
use docchat_core::embedding::Embedder;
use docchat_core::CapabilityError;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::http::{build_client, endpoint, send_with_retry};

/// OpenAI embeddings API client.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    url: String,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: SecretString) -> Result<Self, CapabilityError> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            api_key,
            model: config.model.clone(),
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            url: endpoint(&config.base_url, "embeddings"),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = send_with_retry(self.max_retries, || {
            self.client
                .post(&self.url)
                .bearer_auth(self.api_key.expose_secret())
                .json(&body)
        })
        .await?;

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CapabilityError::Other(format!("invalid embeddings response: {e}")))?;
        let vectors = parse_openai_response(&json)?;

        if vectors.len() != texts.len() {
            return Err(CapabilityError::Other(format!(
                "embeddings response has {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
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

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            debug!(model = %self.model, batch = batch.len(), "embedding batch");
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }
}

/// Parse the OpenAI embeddings API response JSON.
///
/// Entries are placed by their `index` field when present, so the result
/// lines up with the request's `input` order.
pub fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, CapabilityError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| CapabilityError::Other("invalid embeddings response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| CapabilityError::Other("invalid embeddings response: missing embedding".into()))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vec)| vec).collect())
}

/// Embedder that refuses every call.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed_documents(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        Err(CapabilityError::Other(
            "embeddings are disabled; set [embedding] provider = \"openai\"".into(),
        ))
    }
}
