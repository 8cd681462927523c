//! OpenAI-compatible chat completions client.
//!
//! `complete` posts a non-streaming request and reads
//! `choices[0].message.content`. `stream` posts with `"stream": true` and
//! decodes the server-sent events as they arrive: each `data:` line carries
//! a JSON chunk whose `choices[0].delta.content` is the next fragment, and
//! `data: [DONE]` ends the stream.

use async_stream::stream;
use async_trait::async_trait;
use docchat_core::llm::{ChatMessage, ChatModel, ChatRole, FragmentStream};
use docchat_core::CapabilityError;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::debug;

use crate::config::LlmConfig;
use crate::http::{build_client, endpoint, send_with_retry};

pub struct OpenAiChatModel {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    temperature: f32,
    max_retries: u32,
    url: String,
}

impl OpenAiChatModel {
    pub fn new(config: &LlmConfig, api_key: SecretString) -> Result<Self, CapabilityError> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_retries: config.max_retries,
            url: endpoint(&config.base_url, "chat/completions"),
        })
    }

    fn request_body(&self, messages: &[ChatMessage], stream: bool) -> Value {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": wire_role(m.role),
                    "content": m.content,
                })
            })
            .collect();
        serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": messages,
            "stream": stream,
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, CapabilityError> {
        send_with_retry(self.max_retries, || {
            self.client
                .post(&self.url)
                .bearer_auth(self.api_key.expose_secret())
                .json(body)
        })
        .await
    }
}

fn wire_role(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::Human => "user",
        ChatRole::Ai => "assistant",
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CapabilityError> {
        debug!(model = %self.model, messages = messages.len(), "chat completion");
        let response = self.post(&self.request_body(messages, false)).await?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| CapabilityError::Other(format!("invalid chat response: {e}")))?;
        parse_completion(&json)
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<FragmentStream, CapabilityError> {
        debug!(model = %self.model, messages = messages.len(), "chat stream");
        let response = self.post(&self.request_body(messages, true)).await?;
        let mut bytes = response.bytes_stream();

        let fragments = stream! {
            let mut lines = LineBuffer::default();
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(CapabilityError::Transient(format!("stream interrupted: {e}")));
                        break 'read;
                    }
                };
                for line in lines.push(&chunk) {
                    match parse_sse_line(&line) {
                        Ok(SseEvent::Delta(text)) => {
                            yield Ok(text);
                        }
                        Ok(SseEvent::Done) => break 'read,
                        Ok(SseEvent::Skip) => {}
                        Err(e) => {
                            yield Err(e);
                            break 'read;
                        }
                    }
                }
            }
        };
        Ok(fragments.boxed())
    }
}

/// Read `choices[0].message.content` from a non-streaming response.
pub fn parse_completion(json: &Value) -> Result<String, CapabilityError> {
    json["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| CapabilityError::Other("invalid chat response: missing message content".into()))
}

/// One decoded server-sent-events line.
#[derive(Debug, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Done,
    /// Comments, blank keep-alives, role-only deltas, non-data fields.
    Skip,
}

/// Decode one SSE line of a chat completions stream.
pub fn parse_sse_line(line: &str) -> Result<SseEvent, CapabilityError> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseEvent::Skip);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let json: Value = serde_json::from_str(data)
        .map_err(|e| CapabilityError::Other(format!("invalid stream chunk: {e}")))?;
    if let Some(message) = json["error"]["message"].as_str() {
        return Err(CapabilityError::Other(message.to_string()));
    }

    match json["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => Ok(SseEvent::Delta(text.to_string())),
        _ => Ok(SseEvent::Skip),
    }
}

/// Splits a byte stream into complete lines. A line is only decoded once
/// its newline has arrived, so multi-byte characters split across network
/// chunks come out intact.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }
}
