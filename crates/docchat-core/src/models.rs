//! Core data types that flow through the pipeline.
//!
//! A [`DocumentSource`] is what a loader produces; the chunker turns it into
//! [`Chunk`]s; retrieval yields [`ScoredChunk`]s; the map stage produces
//! [`CandidateAnswer`]s and the reduce stage one [`SynthesizedAnswer`].

use serde::{Deserialize, Serialize};

/// Source-level metadata inherited by every chunk of a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Citation string for answers: a file path or page URL.
    pub source: String,
    /// Last-modified date as reported by the loader (sitemap `<lastmod>`,
    /// file mtime), if known.
    pub lastmod: Option<String>,
    /// Origin URL, if the source came from the web.
    pub url: Option<String>,
}

/// One loaded document: identifier, raw text, and metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSource {
    pub id: String,
    pub text: String,
    pub metadata: SourceMetadata,
}

impl DocumentSource {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            metadata: SourceMetadata {
                source: id.clone(),
                lastmod: None,
                url: None,
            },
            id,
            text: text.into(),
        }
    }

    pub fn with_lastmod(mut self, lastmod: impl Into<String>) -> Self {
        self.metadata.lastmod = Some(lastmod.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.metadata.url = Some(url.into());
        self
    }
}

/// A contiguous slice of a source's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// `"{source_id}#{index}"`.
    pub id: String,
    /// Back-reference to the owning [`DocumentSource::id`].
    pub source_id: String,
    /// Position of this chunk within its source, starting at 0.
    pub index: usize,
    /// Character offset of `text` within the source text.
    pub offset: usize,
    pub text: String,
    /// SHA-256 hex of `text`.
    pub hash: String,
    pub metadata: SourceMetadata,
}

/// A retrieved chunk and its similarity to the query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub similarity: f32,
}

/// Per-chunk answer produced by the map stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateAnswer {
    pub answer: String,
    /// 0 (don't know / irrelevant) to 5 (fully answered).
    pub score: u8,
    pub source_id: String,
    pub lastmod: Option<String>,
}

/// Final answer of one question.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesizedAnswer {
    pub text: String,
    /// Candidate sources that appear verbatim in `text`, in first-seen order.
    pub citations: Vec<String>,
    /// Map-stage candidates the answer was built from (empty for the
    /// single-call strategy).
    pub candidates: Vec<CandidateAnswer>,
}

/// Who said a [`SessionMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Ai,
}

/// One entry of the rendered chat transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub text: String,
    pub role: Role,
}

/// One question/answer pair kept in conversational memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTurn {
    pub input: String,
    pub output: String,
}
