//! Deterministic test doubles for the capability traits.
//!
//! Compiled for this crate's unit tests and, behind the `test-utils`
//! feature, for downstream integration tests. Nothing here talks to the
//! network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use secrecy::SecretString;
use sha2::{Digest, Sha256};

use crate::embedding::Embedder;
use crate::error::{CapabilityError, PipelineError};
use crate::llm::{ChatMessage, ChatModel, FragmentStream};
use crate::session::CapabilityFactory;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bag-of-words embedder: every lowercase word adds 1.0 to a bucket chosen
/// by hashing the word. Texts sharing words end up close together.
pub struct FakeEmbedder {
    model: String,
    dims: usize,
    document_calls: AtomicUsize,
    embedded_texts: AtomicUsize,
    query_calls: AtomicUsize,
    failure: Mutex<Option<CapabilityError>>,
}

impl FakeEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            model: "fake-embedding".to_string(),
            dims: dims.max(1),
            document_calls: AtomicUsize::new(0),
            embedded_texts: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            failure: Mutex::new(None),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Make every following call fail with `err`.
    pub fn fail_with(&self, err: CapabilityError) {
        *lock(&self.failure) = Some(err);
    }

    /// Undo [`fail_with`](Self::fail_with).
    pub fn recover(&self) {
        *lock(&self.failure) = None;
    }

    /// Number of `embed_documents` calls.
    pub fn document_calls(&self) -> usize {
        self.document_calls.load(Ordering::SeqCst)
    }

    /// Number of texts embedded through `embed_documents`.
    pub fn embedded_texts(&self) -> usize {
        self.embedded_texts.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.document_calls() + self.query_calls()
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let digest = Sha256::digest(word.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let slot = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            vector[slot] += 1.0;
        }
        vector
    }

    fn check(&self) -> Result<(), CapabilityError> {
        match lock(&self.failure).as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        self.document_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.embedded_texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.vector_for(text))
    }
}

type Responder = dyn Fn(&[ChatMessage]) -> Result<String, CapabilityError> + Send + Sync;

/// Chat model whose replies come from a closure over the prompt.
///
/// `stream` splits the reply into word-sized fragments.
pub struct ScriptedChatModel {
    responder: Box<Responder>,
    calls: AtomicUsize,
    last: Mutex<Vec<ChatMessage>>,
    fail_stream_after: Option<usize>,
}

impl ScriptedChatModel {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&[ChatMessage]) -> Result<String, CapabilityError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
            last: Mutex::new(Vec::new()),
            fail_stream_after: None,
        }
    }

    /// Always reply with `text`.
    pub fn replying(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| Ok(text.clone()))
    }

    /// Streams emit `n` fragments, then a transient error.
    pub fn fail_stream_after(mut self, n: usize) -> Self {
        self.fail_stream_after = Some(n);
        self
    }

    /// Calls to `complete` and `stream` together.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages of the most recent call.
    pub fn last_messages(&self) -> Vec<ChatMessage> {
        lock(&self.last).clone()
    }

    fn respond(&self, messages: &[ChatMessage]) -> Result<String, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last) = messages.to_vec();
        (self.responder)(messages)
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CapabilityError> {
        self.respond(messages)
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<FragmentStream, CapabilityError> {
        let text = self.respond(messages)?;
        let mut items: Vec<Result<String, CapabilityError>> =
            text.split_inclusive(' ').map(|f| Ok(f.to_string())).collect();
        if let Some(n) = self.fail_stream_after {
            items.truncate(n);
            items.push(Err(CapabilityError::Transient("stream interrupted".into())));
        }
        Ok(stream::iter(items).boxed())
    }
}

/// [`CapabilityFactory`] handing out shared fakes and counting builds.
pub struct FakeCapabilities {
    pub embedder: Arc<FakeEmbedder>,
    pub model: Arc<ScriptedChatModel>,
    builds: AtomicUsize,
}

impl FakeCapabilities {
    pub fn new(embedder: FakeEmbedder, model: ScriptedChatModel) -> Self {
        Self {
            embedder: Arc::new(embedder),
            model: Arc::new(model),
            builds: AtomicUsize::new(0),
        }
    }

    /// Number of clients built so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Capability calls made by the built clients.
    pub fn capability_calls(&self) -> usize {
        self.embedder.total_calls() + self.model.calls()
    }
}

impl CapabilityFactory for FakeCapabilities {
    fn chat_model(&self, _credential: &SecretString) -> Result<Arc<dyn ChatModel>, PipelineError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(self.model.clone() as Arc<dyn ChatModel>)
    }

    fn embedder(&self, _credential: &SecretString) -> Result<Arc<dyn Embedder>, PipelineError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(self.embedder.clone() as Arc<dyn Embedder>)
    }
}
