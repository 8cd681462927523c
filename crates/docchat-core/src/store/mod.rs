//! Key/value byte storage behind the embedding cache.
//!
//! The [`ByteStore`] trait is the only thing the cache needs from a
//! backend: fetch bytes by key, write bytes under a key. Backends:
//!
//! | Backend | Crate | Persistence |
//! |---------|-------|-------------|
//! | [`memory::InMemoryByteStore`] | `docchat-core` | process lifetime |
//! | `LocalFileStore` | `docchat` | one file per key under a directory |
//! | `SqliteByteStore` | `docchat` | single SQLite table |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

/// Abstract byte store.
///
/// Keys are lowercase hex strings; backends may rely on that when mapping
/// keys to file names.
#[async_trait]
pub trait ByteStore: Send + Sync {
    /// Fetch the bytes stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`.
    ///
    /// The cache only writes keys it has just missed, and equal keys always
    /// carry equal values, so a backend may either overwrite or keep the
    /// first write.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Number of stored entries. Used for diagnostics only.
    async fn len(&self) -> Result<usize>;
}
