//! SQLite byte store.

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use docchat_core::store::ByteStore;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

/// File name of the database inside the cache directory.
pub const DB_FILE_NAME: &str = "cache.db";

/// Stores values in one `byte_store` table shared by all namespaces.
///
/// Writes use `INSERT OR IGNORE`: the first value stored under a key wins.
pub struct SqliteByteStore {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteByteStore {
    /// Open (creating if missing) the database at `db_path` in WAL mode and
    /// make sure the table exists.
    pub async fn connect(db_path: &Path, namespace: &str) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        migrate(&pool).await?;

        Ok(Self {
            pool,
            namespace: namespace.to_string(),
        })
    }
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS byte_store (
            namespace TEXT NOT NULL,
            key TEXT NOT NULL,
            value BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, key)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[async_trait]
impl ByteStore for SqliteByteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM byte_store WHERE namespace = ? AND key = ?")
            .bind(&self.namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO byte_store (namespace, key, value, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&self.namespace)
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM byte_store WHERE namespace = ?")
            .bind(&self.namespace)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}
