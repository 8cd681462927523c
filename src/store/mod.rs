//! Persistent [`ByteStore`] backends for the embedding cache.
//!
//! [`open_store`] picks the backend named by `[cache] backend`:
//!
//! | Backend | Type | Layout |
//! |---------|------|--------|
//! | `fs` (default) | [`fs::LocalFileStore`] | `<path>/<namespace>/<key>` |
//! | `sqlite` | [`sqlite::SqliteByteStore`] | `<path>/cache.db`, one row per key |
//! | `memory` | `InMemoryByteStore` | nothing on disk |
//!
//! The namespace is derived from the embedding model so vectors of
//! different models never share a directory.

pub mod fs;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use docchat_core::store::memory::InMemoryByteStore;
use docchat_core::store::ByteStore;
use tracing::info;

use crate::config::{CacheBackend, CacheConfig};

/// Open the configured cache backend for `namespace`.
pub async fn open_store(config: &CacheConfig, namespace: &str) -> Result<Arc<dyn ByteStore>> {
    let namespace = sanitize_namespace(namespace);
    let store: Arc<dyn ByteStore> = match config.backend {
        CacheBackend::Fs => Arc::new(fs::LocalFileStore::open(config.path.join(&namespace)).await?),
        CacheBackend::Sqlite => Arc::new(
            sqlite::SqliteByteStore::connect(&config.path.join(sqlite::DB_FILE_NAME), &namespace)
                .await?,
        ),
        CacheBackend::Memory => Arc::new(InMemoryByteStore::new()),
    };
    info!(backend = ?config.backend, namespace = %namespace, "embedding cache opened");
    Ok(store)
}

/// Map a model name to a directory-safe namespace.
pub fn sanitize_namespace(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "default".to_string(),
        trimmed => trimmed.to_string(),
    }
}
