use std::path::Path;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::peek::LayerPeekResult;
use crate::tar::TarEntry;
use crate::{error, Result};

/// Per-layer index rows, keyed by the immutable layer digest. Digests are
/// content-addressable, so rows never expire and never need invalidation.
const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS layer_peek_cache (
    digest TEXT PRIMARY KEY,
    namespace TEXT NOT NULL,
    repo TEXT NOT NULL,
    bytes_downloaded INTEGER NOT NULL,
    bytes_decompressed INTEGER NOT NULL,
    entries_count INTEGER NOT NULL,
    entries_json TEXT NOT NULL,
    fetched_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)";

/// Persistent store for layer peek results: one local SQLite file shared
/// process-wide. Each put is a single `INSERT OR REPLACE`, so readers see
/// either the pre- or post-state of a row, never a partial write.
#[derive(Clone, Debug)]
pub struct MetadataCache {
    pool: SqlitePool,
}

impl MetadataCache {
    /// Open or create the cache file at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context(error::CacheOpenSnafu)?;
        Self::init(pool).await
    }

    /// Ephemeral cache for tests and cache-less runs that still want the
    /// within-process reuse behavior
    pub async fn in_memory() -> Result<Self> {
        // every new connection would get its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context(error::CacheOpenSnafu)?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .context(error::CacheOpenSnafu)?;
        Ok(Self { pool })
    }

    pub async fn has(&self, digest: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM layer_peek_cache WHERE digest = ?")
            .bind(digest)
            .fetch_optional(&self.pool)
            .await
            .context(error::CacheReadSnafu)?;
        Ok(row.is_some())
    }

    /// Recall one layer's peek result without touching the network
    pub async fn get(&self, digest: &str) -> Result<Option<LayerPeekResult>> {
        let row = sqlx::query(
            "SELECT bytes_downloaded, bytes_decompressed, entries_json \
             FROM layer_peek_cache WHERE digest = ?",
        )
        .bind(digest)
        .fetch_optional(&self.pool)
        .await
        .context(error::CacheReadSnafu)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let entries_json: String = row.get("entries_json");
        let entries: Vec<TarEntry> =
            serde_json::from_str(&entries_json).context(error::CacheDeserializeSnafu)?;
        let result = LayerPeekResult {
            digest: digest.to_string(),
            partial: true,
            bytes_downloaded: row.get::<i64, _>("bytes_downloaded") as u64,
            bytes_decompressed: row.get::<i64, _>("bytes_decompressed") as u64,
            entries_found: entries.len(),
            entries,
            error: None,
        };
        trace!(target: "cache", "hit for {digest}: {} entries", result.entries_found);
        Ok(Some(result))
    }

    pub async fn put(
        &self,
        digest: &str,
        namespace: &str,
        repository: &str,
        result: &LayerPeekResult,
    ) -> Result<()> {
        let entries_json =
            serde_json::to_string(&result.entries).context(error::SerializeSnafu)?;
        sqlx::query(
            "INSERT OR REPLACE INTO layer_peek_cache \
             (digest, namespace, repo, bytes_downloaded, bytes_decompressed, entries_count, entries_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(digest)
        .bind(namespace)
        .bind(repository)
        .bind(result.bytes_downloaded as i64)
        .bind(result.bytes_decompressed as i64)
        .bind(result.entries_found as i64)
        .bind(entries_json)
        .execute(&self.pool)
        .await
        .context(error::CacheWriteSnafu)?;
        trace!(target: "cache", "stored {digest}: {} entries", result.entries_found);
        Ok(())
    }

    /// Whether every digest is already cached, letting an image-wide peek
    /// skip the network entirely
    pub async fn all_present(&self, digests: &[String]) -> Result<bool> {
        if digests.is_empty() {
            return Ok(true);
        }
        let placeholders = vec!["?"; digests.len()].join(",");
        let query = format!(
            "SELECT COUNT(*) AS present FROM layer_peek_cache WHERE digest IN ({placeholders})"
        );
        let mut query = sqlx::query(&query);
        for digest in digests {
            query = query.bind(digest);
        }
        let row = query
            .fetch_one(&self.pool)
            .await
            .context(error::CacheReadSnafu)?;
        Ok(row.get::<i64, _>("present") as usize == digests.len())
    }
}
