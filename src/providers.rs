//! Builds the OpenAI-backed clients for a session credential.

use std::sync::Arc;

use docchat_core::embedding::Embedder;
use docchat_core::llm::ChatModel;
use docchat_core::session::CapabilityFactory;
use docchat_core::PipelineError;
use secrecy::{ExposeSecret, SecretString};

use crate::config::{EmbeddingConfig, LlmConfig};
use crate::embedding::{DisabledEmbedder, OpenAiEmbedder};
use crate::llm::OpenAiChatModel;

/// [`CapabilityFactory`] for OpenAI-compatible endpoints.
pub struct OpenAiCapabilities {
    embedding: EmbeddingConfig,
    llm: LlmConfig,
}

impl OpenAiCapabilities {
    pub fn new(embedding: EmbeddingConfig, llm: LlmConfig) -> Self {
        Self { embedding, llm }
    }
}

fn copy_secret(credential: &SecretString) -> SecretString {
    SecretString::new(credential.expose_secret().clone())
}

impl CapabilityFactory for OpenAiCapabilities {
    fn chat_model(&self, credential: &SecretString) -> Result<Arc<dyn ChatModel>, PipelineError> {
        let model = OpenAiChatModel::new(&self.llm, copy_secret(credential))
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok(Arc::new(model))
    }

    fn embedder(&self, credential: &SecretString) -> Result<Arc<dyn Embedder>, PipelineError> {
        if !self.embedding.is_enabled() {
            return Ok(Arc::new(DisabledEmbedder));
        }
        let embedder = OpenAiEmbedder::new(&self.embedding, copy_secret(credential))
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok(Arc::new(embedder))
    }
}
