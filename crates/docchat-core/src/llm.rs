//! Chat model capability.
//!
//! [`ChatModel`] is the seam between the pipeline and whatever answers
//! prompts. The OpenAI-compatible HTTP client lives in the `docchat` app
//! crate; tests use [`crate::testing::ScriptedChatModel`].

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::CapabilityError;

/// Stream of answer fragments, in generation order.
pub type FragmentStream = BoxStream<'static, Result<String, CapabilityError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    Human,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Human,
            content: content.into(),
        }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Ai,
            content: content.into(),
        }
    }
}

/// A language model that answers a list of chat messages.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier, for logs.
    fn model_name(&self) -> &str;

    /// Return the whole completion at once.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CapabilityError>;

    /// Return the completion as it is generated.
    ///
    /// Errors that happen before the first fragment (bad credential,
    /// unreachable service) are returned directly; errors mid-stream arrive
    /// as stream items. The default implementation yields the result of
    /// [`complete`](ChatModel::complete) as a single fragment.
    async fn stream(&self, messages: &[ChatMessage]) -> Result<FragmentStream, CapabilityError> {
        let text = self.complete(messages).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }
}
