//! Credential gate and the per-conversation session.
//!
//! A [`Session`] is the explicit context object of one interaction loop. It
//! owns everything the loop needs between questions: the credential gate,
//! the active source and its retriever, conversational memory, and the
//! rendered message history. Capability clients are built from the
//! credential through a [`CapabilityFactory`], so the session never knows
//! which service sits behind them.
//!
//! # Gate states
//!
//! ```text
//! NoCredential --enter(ok shape)--> Ready --reject--> Rejected
//!      |                              ^                  |
//!      +--enter(bad shape)--> CredentialEntered          |
//!                                     ^------enter-------+
//! ```
//!
//! `clear()` returns to `NoCredential` from anywhere. Nothing reaches a
//! capability unless the gate is `Ready`.

use std::sync::Arc;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{CacheBackedEmbedder, CacheStats, DEFAULT_BATCH_SIZE};
use crate::chunk::{ChunkingOptions, TextSplitter};
use crate::embedding::Embedder;
use crate::error::PipelineError;
use crate::index::{fingerprint, Retriever, VectorIndex};
use crate::llm::{ChatMessage, ChatModel};
use crate::memory::{ConversationMemory, MemoryMode, DEFAULT_MAX_TOKENS};
use crate::models::{DocumentSource, Role, SessionMessage, SynthesizedAnswer};
use crate::store::ByteStore;
use crate::synthesis::{AnswerSynthesizer, FragmentSink, Strategy, SynthesisOptions};

/// Default shape of an acceptable credential.
pub const DEFAULT_CREDENTIAL_PATTERN: &str = r"^sk-\S+$";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    NoCredential,
    /// A credential was entered but does not have the expected shape.
    CredentialEntered,
    Ready,
    /// The service rejected the credential at call time.
    Rejected { reason: String },
}

pub struct CredentialGate {
    state: GateState,
    credential: Option<SecretString>,
    pattern: Regex,
}

impl Default for CredentialGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialGate {
    pub fn new() -> Self {
        Self {
            state: GateState::NoCredential,
            credential: None,
            pattern: default_pattern(),
        }
    }

    /// Gate with a custom credential shape.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] when `pattern` is not a valid regex.
    pub fn with_pattern(pattern: &str) -> Result<Self, PipelineError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| PipelineError::Config(format!("invalid credential pattern: {e}")))?;
        Ok(Self {
            pattern,
            ..Self::new()
        })
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == GateState::Ready
    }

    pub fn credential(&self) -> Option<&SecretString> {
        self.credential.as_ref()
    }

    /// Capture a credential and check its shape.
    pub fn enter(&mut self, raw: &str) -> Result<(), PipelineError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            self.clear();
            return Err(PipelineError::Credential("no API key entered".into()));
        }

        self.credential = Some(SecretString::new(trimmed.to_string()));
        if self.pattern.is_match(trimmed) {
            self.state = GateState::Ready;
            Ok(())
        } else {
            self.state = GateState::CredentialEntered;
            Err(PipelineError::Credential(
                "the API key does not have the expected shape".into(),
            ))
        }
    }

    /// The service refused the credential.
    pub fn reject(&mut self, reason: impl Into<String>) {
        self.state = GateState::Rejected {
            reason: reason.into(),
        };
    }

    pub fn clear(&mut self) {
        self.state = GateState::NoCredential;
        self.credential = None;
    }

    /// `Ok` when ready, otherwise the credential error explaining why not.
    fn require_ready(&self) -> Result<&SecretString, PipelineError> {
        match (&self.state, &self.credential) {
            (GateState::Ready, Some(credential)) => Ok(credential),
            (GateState::Rejected { reason }, _) => Err(PipelineError::Credential(format!(
                "the API key was rejected: {reason}"
            ))),
            (GateState::CredentialEntered, _) => Err(PipelineError::Credential(
                "the API key does not have the expected shape".into(),
            )),
            _ => Err(PipelineError::Credential("no API key entered".into())),
        }
    }
}

fn default_pattern() -> Regex {
    Regex::new(DEFAULT_CREDENTIAL_PATTERN).expect("static regex")
}

/// Builds capability clients for a credential.
pub trait CapabilityFactory: Send + Sync {
    fn chat_model(&self, credential: &SecretString) -> Result<Arc<dyn ChatModel>, PipelineError>;
    fn embedder(&self, credential: &SecretString) -> Result<Arc<dyn Embedder>, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub chunking: ChunkingOptions,
    pub top_k: usize,
    pub strategy: Strategy,
    pub synthesis: SynthesisOptions,
    pub memory_max_tokens: usize,
    pub memory_mode: MemoryMode,
    pub embed_batch_size: usize,
}

impl SessionOptions {
    pub fn new(chunking: ChunkingOptions, strategy: Strategy) -> Self {
        Self {
            chunking,
            top_k: 4,
            strategy,
            synthesis: SynthesisOptions::default(),
            memory_max_tokens: DEFAULT_MAX_TOKENS,
            memory_mode: MemoryMode::Window,
            embed_batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Outcome of [`Session::load_sources`].
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub sources: usize,
    pub chunks: usize,
    /// The sources matched the active index, which was kept as is.
    pub reused: bool,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[derive(Clone)]
struct Clients {
    model: Arc<dyn ChatModel>,
    embedder: Arc<dyn Embedder>,
}

struct ActiveSource {
    fingerprint: String,
    sources: usize,
    chunks: usize,
    retriever: Retriever,
}

pub struct Session {
    gate: CredentialGate,
    factory: Arc<dyn CapabilityFactory>,
    store: Arc<dyn ByteStore>,
    options: SessionOptions,
    splitter: TextSplitter,
    clients: Option<Clients>,
    active: Option<ActiveSource>,
    memory: ConversationMemory,
    messages: Vec<SessionMessage>,
}

impl Session {
    /// # Errors
    ///
    /// [`PipelineError::Config`] when the chunking options are invalid.
    pub fn new(
        options: SessionOptions,
        factory: Arc<dyn CapabilityFactory>,
        store: Arc<dyn ByteStore>,
    ) -> Result<Self, PipelineError> {
        let splitter = TextSplitter::new(options.chunking.clone())?;
        let memory =
            ConversationMemory::new(options.memory_max_tokens).with_mode(options.memory_mode);
        Ok(Self {
            gate: CredentialGate::new(),
            factory,
            store,
            options,
            splitter,
            clients: None,
            active: None,
            memory,
            messages: Vec::new(),
        })
    }

    pub fn with_gate(mut self, gate: CredentialGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn gate(&self) -> &CredentialGate {
        &self.gate
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn messages(&self) -> &[SessionMessage] {
        &self.messages
    }

    pub fn has_source(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_fingerprint(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.fingerprint.as_str())
    }

    /// Enter (or re-enter) the credential. A different credential than the
    /// one held drops memory, the index, and the built clients.
    pub fn enter_credential(&mut self, raw: &str) -> Result<(), PipelineError> {
        let previous = self
            .gate
            .credential()
            .map(|c| c.expose_secret().to_string());
        let result = self.gate.enter(raw);
        let current = self.gate.credential().map(|c| c.expose_secret().as_str());
        if previous.as_deref() != current {
            self.reset_for_credential();
        }
        result
    }

    pub fn clear_credential(&mut self) {
        self.gate.clear();
        self.reset_for_credential();
    }

    fn reset_for_credential(&mut self) {
        self.clients = None;
        self.active = None;
        self.memory.clear();
    }

    fn clients(&mut self) -> Result<Clients, PipelineError> {
        if let Some(clients) = &self.clients {
            return Ok(clients.clone());
        }
        let credential = self.gate.require_ready()?;
        let clients = Clients {
            model: self.factory.chat_model(credential)?,
            embedder: self.factory.embedder(credential)?,
        };
        self.clients = Some(clients.clone());
        Ok(clients)
    }

    /// Make `sources` the active source.
    ///
    /// Loading the snapshot that is already active keeps the index, memory,
    /// and messages. Anything else is chunked, embedded through the cache,
    /// and indexed; memory and messages start over.
    pub async fn load_sources(
        &mut self,
        sources: &[DocumentSource],
    ) -> Result<LoadReport, PipelineError> {
        self.gate.require_ready()?;

        let fp = fingerprint(sources);
        if let Some(active) = self.active.as_ref().filter(|a| a.fingerprint == fp) {
            info!(fingerprint = %fp, "source unchanged, reusing index");
            return Ok(LoadReport {
                sources: active.sources,
                chunks: active.chunks,
                reused: true,
                cache_hits: 0,
                cache_misses: 0,
            });
        }

        let clients = self.clients()?;
        let cache = CacheBackedEmbedder::new(clients.embedder.clone(), self.store.clone())
            .with_batch_size(self.options.embed_batch_size);

        let mut chunks = Vec::new();
        let mut vectors = Vec::new();
        for source in sources {
            let source_chunks: Vec<_> = self.splitter.split(source).collect();
            let embedded = cache.embed_chunks(&source.id, &source_chunks).await;
            let embedded = self.note_auth(embedded)?;
            chunks.extend(source_chunks);
            vectors.extend(embedded);
        }

        if chunks.is_empty() {
            return Err(PipelineError::Load(
                "no text could be extracted from the source".into(),
            ));
        }

        let chunk_count = chunks.len();
        let index = VectorIndex::build(chunks, vectors)?.with_fingerprint(fp.clone());
        let stats: CacheStats = cache.stats();
        info!(
            sources = sources.len(),
            chunks = chunk_count,
            cache_hits = stats.hits,
            cache_misses = stats.misses,
            "source loaded"
        );

        self.active = Some(ActiveSource {
            fingerprint: fp,
            sources: sources.len(),
            chunks: chunk_count,
            retriever: Retriever::new(Arc::new(index), clients.embedder),
        });
        self.memory.clear();
        self.messages.clear();

        Ok(LoadReport {
            sources: sources.len(),
            chunks: chunk_count,
            reused: false,
            cache_hits: stats.hits,
            cache_misses: stats.misses,
        })
    }

    /// Answer `question` about the active source, streaming fragments into
    /// `sink`.
    ///
    /// Refused without any capability call unless the gate is ready and a
    /// source is loaded. On success the exchange is appended to the message
    /// history and memory. An authentication failure moves the gate to
    /// `Rejected`; the history keeps the question.
    pub async fn ask(
        &mut self,
        question: &str,
        sink: FragmentSink<'_>,
    ) -> Result<SynthesizedAnswer, PipelineError> {
        self.gate.require_ready()?;
        let retriever = match &self.active {
            Some(active) => active.retriever.clone(),
            None => return Err(PipelineError::NoSource),
        };
        let clients = self.clients()?;

        self.messages.push(SessionMessage {
            text: question.to_string(),
            role: Role::Human,
        });

        let history: Vec<ChatMessage> = self.memory.as_messages();
        let result = async {
            let chunks = retriever.retrieve(question, self.options.top_k).await?;
            AnswerSynthesizer::new(clients.model.clone(), self.options.synthesis)
                .answer(self.options.strategy, question, &chunks, &history, sink)
                .await
        }
        .await;
        let answer = self.note_auth(result)?;

        self.messages.push(SessionMessage {
            text: answer.text.clone(),
            role: Role::Ai,
        });
        self.memory.save_turn(question, answer.text.clone());
        if self.memory.has_evicted() {
            if let Err(e) = self.memory.summarize_evicted(clients.model.as_ref()).await {
                warn!(error = %e, "memory summary failed, will retry after the next turn");
            }
        }

        Ok(answer)
    }

    fn note_auth<T>(&mut self, result: Result<T, PipelineError>) -> Result<T, PipelineError> {
        if let Err(e) = &result {
            if e.is_auth() {
                warn!(error = %e, "credential rejected by the service");
                self.gate.reject(e.to_string());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::LengthUnit;
    use crate::error::CapabilityError;
    use crate::store::memory::InMemoryByteStore;
    use crate::testing::{FakeCapabilities, FakeEmbedder, ScriptedChatModel};

    const KEY: &str = "sk-test-123";

    fn options() -> SessionOptions {
        SessionOptions::new(
            ChunkingOptions {
                chunk_size: 60,
                chunk_overlap: 10,
                separator: Some("\n".into()),
                unit: LengthUnit::Chars,
            },
            Strategy::Stuff,
        )
    }

    fn session_with(model: ScriptedChatModel) -> (Session, Arc<FakeCapabilities>) {
        let caps = Arc::new(FakeCapabilities::new(FakeEmbedder::new(32), model));
        let session = Session::new(options(), caps.clone(), Arc::new(InMemoryByteStore::new())).unwrap();
        (session, caps)
    }

    fn notes() -> Vec<DocumentSource> {
        vec![DocumentSource::new(
            "notes.md",
            "The moon is 384,400 km away.\nBread needs flour.\nRust has lifetimes.",
        )]
    }

    fn recipes() -> Vec<DocumentSource> {
        vec![DocumentSource::new("recipes.md", "Pancakes need eggs.\nSoup needs water.")]
    }

    #[test]
    fn test_gate_transitions() {
        let mut gate = CredentialGate::new();
        assert_eq!(gate.state(), &GateState::NoCredential);

        assert!(gate.enter("   ").is_err());
        assert_eq!(gate.state(), &GateState::NoCredential);

        let err = gate.enter("not-a-key").unwrap_err();
        assert!(matches!(err, PipelineError::Credential(_)));
        assert_eq!(gate.state(), &GateState::CredentialEntered);

        gate.enter("  sk-abc  ").unwrap();
        assert!(gate.is_ready());
        assert_eq!(gate.credential().unwrap().expose_secret(), "sk-abc");

        gate.reject("401 invalid key");
        assert!(matches!(gate.state(), GateState::Rejected { .. }));

        gate.enter("sk-new").unwrap();
        assert!(gate.is_ready());

        gate.clear();
        assert_eq!(gate.state(), &GateState::NoCredential);
        assert!(gate.credential().is_none());
    }

    #[test]
    fn test_custom_pattern() {
        let mut gate = CredentialGate::with_pattern(r"^local-\d+$").unwrap();
        assert!(gate.enter("sk-abc").is_err());
        gate.enter("local-42").unwrap();
        assert!(gate.is_ready());
        assert!(CredentialGate::with_pattern("(").is_err());
    }

    #[tokio::test]
    async fn test_ask_without_credential_makes_no_calls() {
        let (mut session, caps) = session_with(ScriptedChatModel::replying("x"));
        let mut sink = |_: &str| {};
        let err = session.ask("anything?", &mut sink).await.unwrap_err();
        assert!(matches!(err, PipelineError::Credential(_)));
        assert!(err.is_credential_shaped());
        let err = session.load_sources(&notes()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Credential(_)));
        assert_eq!(caps.builds(), 0);
        assert_eq!(caps.capability_calls(), 0);
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn test_ask_without_source_makes_no_calls() {
        let (mut session, caps) = session_with(ScriptedChatModel::replying("x"));
        session.enter_credential(KEY).unwrap();
        let mut sink = |_: &str| {};
        let err = session.ask("anything?", &mut sink).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoSource));
        assert_eq!(caps.capability_calls(), 0);
    }

    #[tokio::test]
    async fn test_load_then_ask_records_history_and_memory() {
        let (mut session, _caps) = session_with(ScriptedChatModel::replying("It is 384,400 km away."));
        session.enter_credential(KEY).unwrap();
        let report = session.load_sources(&notes()).await.unwrap();
        assert!(!report.reused);
        assert!(report.chunks >= 1);

        let mut streamed = String::new();
        let mut sink = |f: &str| streamed.push_str(f);
        let answer = session.ask("How far is the moon?", &mut sink).await.unwrap();
        assert_eq!(answer.text, "It is 384,400 km away.");
        assert_eq!(streamed, answer.text);

        let roles: Vec<Role> = session.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::Human, Role::Ai]);
        assert_eq!(session.memory().load().len(), 1);
    }

    #[tokio::test]
    async fn test_same_source_reuses_index() {
        let (mut session, caps) = session_with(ScriptedChatModel::replying("ok"));
        session.enter_credential(KEY).unwrap();
        session.load_sources(&notes()).await.unwrap();
        let mut sink = |_: &str| {};
        session.ask("q", &mut sink).await.unwrap();
        let embedded = caps.embedder.embedded_texts();

        let report = session.load_sources(&notes()).await.unwrap();
        assert!(report.reused);
        assert_eq!(caps.embedder.embedded_texts(), embedded);
        assert_eq!(session.memory().load().len(), 1);
        assert_eq!(session.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_source_switch_resets_memory_and_index() {
        let (mut session, _caps) = session_with(ScriptedChatModel::replying("ok"));
        session.enter_credential(KEY).unwrap();
        session.load_sources(&notes()).await.unwrap();
        let first = session.active_fingerprint().map(str::to_string);
        let mut sink = |_: &str| {};
        session.ask("q", &mut sink).await.unwrap();

        session.load_sources(&recipes()).await.unwrap();
        assert_ne!(session.active_fingerprint().map(str::to_string), first);
        assert!(session.memory().load().is_empty());
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn test_reloading_a_seen_source_hits_the_cache() {
        let (mut session, caps) = session_with(ScriptedChatModel::replying("ok"));
        session.enter_credential(KEY).unwrap();
        session.load_sources(&notes()).await.unwrap();
        session.load_sources(&recipes()).await.unwrap();
        let embedded = caps.embedder.embedded_texts();

        let report = session.load_sources(&notes()).await.unwrap();
        assert!(!report.reused);
        assert_eq!(report.cache_misses, 0);
        assert_eq!(caps.embedder.embedded_texts(), embedded);
    }

    #[tokio::test]
    async fn test_auth_failure_rejects_gate_and_keeps_messages() {
        let model = ScriptedChatModel::new(|_| Err(CapabilityError::Auth("Incorrect API key".into())));
        let (mut session, caps) = session_with(model);
        session.enter_credential(KEY).unwrap();
        session.load_sources(&notes()).await.unwrap();

        let mut sink = |_: &str| {};
        let err = session.ask("q", &mut sink).await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(err.user_message(), "Please check your API key.");
        assert!(matches!(session.gate().state(), GateState::Rejected { .. }));
        assert_eq!(session.messages().len(), 1);
        assert!(session.memory().load().is_empty());

        let calls = caps.capability_calls();
        let err = session.ask("again", &mut sink).await.unwrap_err();
        assert!(matches!(err, PipelineError::Credential(_)));
        assert_eq!(caps.capability_calls(), calls);
    }

    #[tokio::test]
    async fn test_changed_credential_resets_state() {
        let (mut session, _caps) = session_with(ScriptedChatModel::replying("ok"));
        session.enter_credential(KEY).unwrap();
        session.load_sources(&notes()).await.unwrap();
        let mut sink = |_: &str| {};
        session.ask("q", &mut sink).await.unwrap();

        session.enter_credential(KEY).unwrap();
        assert!(session.has_source());
        assert_eq!(session.memory().load().len(), 1);

        session.enter_credential("sk-other").unwrap();
        assert!(!session.has_source());
        assert!(session.memory().load().is_empty());

        session.load_sources(&notes()).await.unwrap();
        session.clear_credential();
        assert!(!session.has_source());
        assert_eq!(session.gate().state(), &GateState::NoCredential);
    }

    #[tokio::test]
    async fn test_empty_source_is_load_error() {
        let (mut session, _caps) = session_with(ScriptedChatModel::replying("ok"));
        session.enter_credential(KEY).unwrap();
        let err = session
            .load_sources(&[DocumentSource::new("blank.txt", "  \n ")])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Load(_)));
        assert!(!session.has_source());
    }
}
