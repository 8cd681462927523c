//! Error taxonomy for the RAG pipeline.
//!
//! Two layers:
//!
//! - [`CapabilityError`] is what a collaborator (chat model, embedder)
//!   reports for a single call: the credential was rejected, the call was
//!   rate limited, the service hiccuped, or something else went wrong.
//! - [`PipelineError`] is what every pipeline stage returns to the
//!   orchestrator. The orchestrator decides what is recoverable by looking
//!   at the variant, never at the message text.
//!
//! | Variant | Raised by | Recoverable |
//! |---------|-----------|-------------|
//! | `Config` | chunker / config validation | no |
//! | `Credential` | credential gate | yes, re-enter the key |
//! | `Auth` | any capability call rejecting the key | yes, re-enter the key |
//! | `Load` | file / sitemap loaders | yes, try another source |
//! | `Embedding` | embedding cache | yes, retry |
//! | `Synthesis` | map or reduce stage | yes, retry the question |
//! | `Index` | vector index build | yes, reload the source |
//! | `Store` | byte store access | yes, retry |
//! | `NoSource` | session asked before a source is loaded | yes |

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Failure reported by a single model or embedding call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    /// The service rejected the credential (HTTP 401/403).
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The service throttled the caller and retries were exhausted.
    #[error("rate limited: {0}")]
    RateLimit(String),
    /// Network failure or 5xx after retries were exhausted.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Anything else: malformed response, 4xx other than auth, and so on.
    #[error("{0}")]
    Other(String),
}

impl CapabilityError {
    pub fn is_auth(&self) -> bool {
        matches!(self, CapabilityError::Auth(_))
    }
}

/// Which synthesis step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Map,
    Reduce,
    Stuff,
    Summarize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Map => "map",
            Stage::Reduce => "reduce",
            Stage::Stuff => "stuff",
            Stage::Summarize => "summarize",
        };
        f.write_str(name)
    }
}

/// Error returned at every pipeline stage boundary.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("credential error: {0}")]
    Credential(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("load error: {0}")]
    Load(String),
    #[error("embedding failed: {0}")]
    Embedding(CapabilityError),
    #[error("{stage} stage failed: {source}")]
    Synthesis {
        stage: Stage,
        #[source]
        source: CapabilityError,
    },
    #[error("index error: {0}")]
    Index(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("no source loaded; load a file or sitemap first")]
    NoSource,
}

impl PipelineError {
    /// Wrap a failed embedding call. Credential rejections surface as
    /// [`PipelineError::Auth`] regardless of where they happened.
    pub fn embedding(err: CapabilityError) -> Self {
        match err {
            CapabilityError::Auth(msg) => PipelineError::Auth(msg),
            other => PipelineError::Embedding(other),
        }
    }

    /// Wrap a failed model call made during `stage`.
    pub fn synthesis(stage: Stage, err: CapabilityError) -> Self {
        match err {
            CapabilityError::Auth(msg) => PipelineError::Auth(msg),
            other => PipelineError::Synthesis {
                stage,
                source: other,
            },
        }
    }

    pub fn store(err: impl fmt::Display) -> Self {
        PipelineError::Store(err.to_string())
    }

    /// `Config` errors are fatal: they fail before any pipeline run and
    /// retrying with the same settings cannot succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PipelineError::Config(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, PipelineError::Auth(_))
    }

    /// True for missing/malformed/rejected credentials, and for any other
    /// error whose message mentions an API key.
    pub fn is_credential_shaped(&self) -> bool {
        match self {
            PipelineError::Credential(_) | PipelineError::Auth(_) => true,
            other => mentions_api_key(&other.to_string()),
        }
    }

    /// Text shown to the user: a friendly hint for credential problems,
    /// the raw diagnostic for everything else.
    pub fn user_message(&self) -> String {
        if self.is_credential_shaped() {
            "Please check your API key.".to_string()
        } else {
            self.to_string()
        }
    }
}

fn api_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)(api)(_|-|\s)(key)").expect("static regex"))
}

/// Whether an error message talks about an API key (`api_key`, `API-Key`,
/// `api key`, ...).
pub fn mentions_api_key(message: &str) -> bool {
    api_key_pattern().is_match(message)
}
