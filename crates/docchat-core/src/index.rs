//! In-memory vector index and retriever.
//!
//! A [`VectorIndex`] holds the chunks of one source snapshot with their
//! vectors and answers top-k cosine similarity queries by brute force. It is
//! built once per snapshot and replaced wholesale when a source with a
//! different [`fingerprint`] is loaded.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::info;

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::PipelineError;
use crate::models::{Chunk, DocumentSource, ScoredChunk};

/// Identity of a source snapshot: SHA-256 over every source id and text.
pub fn fingerprint(sources: &[DocumentSource]) -> String {
    let mut hasher = Sha256::new();
    for source in sources {
        hasher.update(source.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(source.text.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    entries: Vec<(Chunk, Vec<f32>)>,
    fingerprint: String,
}

impl VectorIndex {
    /// Pair every chunk with its vector.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Index`] when the two lists differ in length or the
    /// vectors do not all share one dimension.
    pub fn build(chunks: Vec<Chunk>, embeddings: Vec<Vec<f32>>) -> Result<Self, PipelineError> {
        if chunks.len() != embeddings.len() {
            return Err(PipelineError::Index(format!(
                "{} chunks but {} embeddings",
                chunks.len(),
                embeddings.len()
            )));
        }
        if let Some(first) = embeddings.first() {
            let dims = first.len();
            if let Some((i, bad)) = embeddings
                .iter()
                .enumerate()
                .find(|(_, v)| v.len() != dims)
            {
                return Err(PipelineError::Index(format!(
                    "embedding {i} has {} dims, expected {dims}",
                    bad.len()
                )));
            }
        }

        info!(chunks = chunks.len(), "vector index built");
        Ok(Self {
            entries: chunks.into_iter().zip(embeddings).collect(),
            fingerprint: String::new(),
        })
    }

    /// Tag the index with the [`fingerprint`] of the sources it was built
    /// from.
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top `k` chunks by cosine similarity, descending. Equal scores keep
    /// insertion order.
    pub fn query(&self, query: &[f32], k: usize) -> Vec<ScoredChunk> {
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, (_, v))| (i, cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(i, similarity)| ScoredChunk {
                chunk: self.entries[i].0.clone(),
                similarity,
            })
            .collect()
    }
}

/// Embeds a question and queries a [`VectorIndex`].
#[derive(Clone)]
pub struct Retriever {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
}

impl Retriever {
    pub fn new(index: Arc<VectorIndex>, embedder: Arc<dyn Embedder>) -> Self {
        Self { index, embedder }
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Top `k` chunks for `question`. The query embedding is not cached.
    pub async fn retrieve(
        &self,
        question: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, PipelineError> {
        let query = self
            .embedder
            .embed_query(question)
            .await
            .map_err(PipelineError::embedding)?;
        Ok(self.index.query(&query, k))
    }
}
