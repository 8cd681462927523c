//! Content-addressed embedding cache.
//!
//! [`CacheBackedEmbedder`] wraps any [`Embedder`] with a [`ByteStore`]. The
//! cache key is the SHA-256 of the model identifier and the chunk text, so a
//! chunk's vector is reused no matter which source or position it came from,
//! and switching models never returns stale vectors.
//!
//! The cache is append-only: a key is written only after a lookup missed,
//! and an existing entry is never rewritten. Query embeddings bypass it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::embedding::{blob_to_vec, vec_to_blob, Embedder};
use crate::error::{CapabilityError, PipelineError};
use crate::models::Chunk;
use crate::store::ByteStore;

/// Default number of texts sent per embedding request.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Cache key for `text` embedded with `model`: hex SHA-256 of
/// `model || 0x00 || text`.
pub fn cache_key(model: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lookup counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// An [`Embedder`] front-ended by a [`ByteStore`].
pub struct CacheBackedEmbedder<S: ByteStore + ?Sized = dyn ByteStore> {
    embedder: Arc<dyn Embedder>,
    store: Arc<S>,
    batch_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<S: ByteStore + ?Sized> CacheBackedEmbedder<S> {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<S>) -> Self {
        Self {
            embedder,
            store,
            batch_size: DEFAULT_BATCH_SIZE,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Set the embedding batch size (minimum 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Return the vector for `chunk`, computing and storing it on a miss.
    pub async fn get_or_compute(
        &self,
        source_id: &str,
        chunk: &Chunk,
    ) -> Result<Vec<f32>, PipelineError> {
        let key = cache_key(self.embedder.model_name(), &chunk.text);
        if let Some(vector) = self.lookup(&key).await? {
            debug!(source_id, chunk = %chunk.id, "embedding cache hit");
            return Ok(vector);
        }

        debug!(source_id, chunk = %chunk.id, "embedding cache miss");
        let mut vectors = self
            .compute(std::slice::from_ref(&chunk.text))
            .await?;
        let vector = vectors.pop().ok_or_else(|| {
            PipelineError::embedding(CapabilityError::Other("embedder returned no vector".into()))
        })?;
        self.write(&key, &vector).await?;
        Ok(vector)
    }

    /// Vectors for every chunk, in order.
    ///
    /// Misses are de-duplicated by key and embedded in batches; identical
    /// texts within one call cost a single embedding.
    pub async fn embed_chunks(
        &self,
        source_id: &str,
        chunks: &[Chunk],
    ) -> Result<Vec<Vec<f32>>, PipelineError> {
        let model = self.embedder.model_name().to_string();
        let mut resolved: Vec<Option<Vec<f32>>> = Vec::with_capacity(chunks.len());
        let mut keys = Vec::with_capacity(chunks.len());
        let mut pending: Vec<(String, String)> = Vec::new();
        let mut queued = HashSet::new();

        for chunk in chunks {
            let key = cache_key(&model, &chunk.text);
            let hit = self.lookup(&key).await?;
            if hit.is_none() && queued.insert(key.clone()) {
                pending.push((key.clone(), chunk.text.clone()));
            }
            resolved.push(hit);
            keys.push(key);
        }

        debug!(
            source_id,
            chunks = chunks.len(),
            to_embed = pending.len(),
            "embedding cache lookup done"
        );

        let mut computed: HashMap<String, Vec<f32>> = HashMap::with_capacity(pending.len());
        for batch in pending.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
            let vectors = self.compute(&texts).await?;
            for ((key, _), vector) in batch.iter().zip(vectors) {
                self.write(key, &vector).await?;
                computed.insert(key.clone(), vector);
            }
        }

        resolved
            .into_iter()
            .zip(keys)
            .map(|(hit, key)| match hit {
                Some(vector) => Ok(vector),
                None => computed.get(&key).cloned().ok_or_else(|| {
                    PipelineError::Store(format!("no vector computed for key {key}"))
                }),
            })
            .collect()
    }

    /// Embed a query. Never cached.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        self.embedder
            .embed_query(text)
            .await
            .map_err(PipelineError::embedding)
    }

    async fn lookup(&self, key: &str) -> Result<Option<Vec<f32>>, PipelineError> {
        let bytes = self.store.get(key).await.map_err(PipelineError::store)?;
        match bytes {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Some(bytes) => {
                let vector = blob_to_vec(&bytes).ok_or_else(|| {
                    PipelineError::Store(format!(
                        "corrupt cache entry {key}: {} bytes is not a whole number of f32s",
                        bytes.len()
                    ))
                })?;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(vector))
            }
        }
    }

    async fn compute(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let vectors = self
            .embedder
            .embed_documents(texts)
            .await
            .map_err(PipelineError::embedding)?;
        if vectors.len() != texts.len() {
            return Err(PipelineError::embedding(CapabilityError::Other(format!(
                "embedder returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            ))));
        }
        Ok(vectors)
    }

    async fn write(&self, key: &str, vector: &[f32]) -> Result<(), PipelineError> {
        self.store
            .put(key, &vec_to_blob(vector))
            .await
            .map_err(PipelineError::store)
    }
}
