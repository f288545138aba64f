use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::overlay::OverlayBook;
use super::types::StorageError;

/// Size ceilings enforced by the store.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    /// Public items kept before oldest-first eviction kicks in
    pub max_items: usize,
    /// Total media bytes kept before oldest-first eviction kicks in
    pub max_media_bytes: u64,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_items: 500,
            max_media_bytes: 64 * 1024 * 1024,
        }
    }
}

// ============================================================================
// Cache Store
// ============================================================================

/// Durable client-side store for feed items, media blobs and the offline
/// action queue.
///
/// One instance is opened per process and cloned into every consumer; clones
/// share the pool, the overlay book and the rendered set. Nothing outside this
/// module touches the tables directly.
#[derive(Clone)]
pub struct CacheStore {
    pub(crate) pool: SqlitePool,
    pub(crate) overlays: Arc<Mutex<OverlayBook>>,
    pub(crate) rendered: Arc<Mutex<HashSet<String>>>,
    pub(crate) limits: StoreLimits,
}

impl CacheStore {
    /// Open the cache database and run migrations
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InstanceLocked` if another process holds the
    /// database locked, `StorageError::Migration` if the schema could not be
    /// created, `StorageError::Other` otherwise.
    pub async fn open(path: &str, limits: StoreLimits) -> Result<Self, StorageError> {
        let url = format!("sqlite:{}?mode=rwc", path);
        let in_memory = path == ":memory:";

        // Cache holds the viewer's feed: keep it user-readable only
        #[cfg(unix)]
        if !in_memory {
            use std::os::unix::fs::OpenOptionsExt;
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set cache file permissions");
                }
            } else if db_path.parent().map(|p| p.exists()).unwrap_or(false) {
                let _file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(db_path)
                    .ok(); // If creation fails, SQLite will report the error at connect_with.
            }
        }

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(StorageError::from_sqlx)?
            .pragma("busy_timeout", "5000");

        // Every connection to ":memory:" is its own database, so pin the pool to one
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(StorageError::from_sqlx)?;

        let store = Self {
            pool,
            overlays: Arc::new(Mutex::new(OverlayBook::default())),
            rendered: Arc::new(Mutex::new(HashSet::new())),
            limits,
        };
        store.migrate().await.map_err(|e| match StorageError::from_sqlx(e) {
            StorageError::Other(inner) => StorageError::Migration(inner.to_string()),
            other => other,
        })?;

        tracing::debug!(path = %path, max_items = limits.max_items, "Cache store opened");
        Ok(store)
    }

    /// Open a throwaway in-memory store (network-only mode and tests).
    pub async fn open_in_memory(limits: StoreLimits) -> Result<Self, StorageError> {
        Self::open(":memory:", limits).await
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    /// Run schema migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// cache is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Server state of each item; the payload is the FeedItem JSON
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_items (
                id TEXT PRIMARY KEY,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                payload TEXT NOT NULL,
                staged INTEGER NOT NULL DEFAULT 0,
                stored_at_ms INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_feed_items_order ON feed_items(staged, created_at_ms DESC, id DESC)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media_cache (
                url TEXT PRIMARY KEY,
                bytes BLOB NOT NULL,
                content_type TEXT,
                size_bytes INTEGER NOT NULL,
                sha256 TEXT NOT NULL,
                fetched_at_ms INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_media_cache_fetched ON media_cache(fetched_at_ms)",
        )
        .execute(&mut *tx)
        .await?;

        // seq gives FIFO order; re-enqueueing an action assigns a new seq.
        // origin_seq keeps the first seq so per-target order survives retries.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS offline_actions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                origin_seq INTEGER,
                id TEXT UNIQUE NOT NULL,
                kind TEXT NOT NULL,
                target_id TEXT,
                payload TEXT NOT NULL,
                enqueued_at_ms INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                next_attempt_at_ms INTEGER NOT NULL,
                last_error TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    /// Delete every cached item, blob and queued action.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for table in ["feed_items", "media_cache", "offline_actions", "sync_meta"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        if let Ok(mut overlays) = self.overlays.lock() {
            overlays.clear();
        }
        tracing::info!("Cache cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_is_idempotent_on_migrate() {
        let store = CacheStore::open_in_memory(StoreLimits::default())
            .await
            .unwrap();
        store.migrate().await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&store.pool)
        .await
        .unwrap();
        let names: Vec<_> = tables.into_iter().map(|(n,)| n).collect();
        assert_eq!(
            names,
            vec!["feed_items", "media_cache", "offline_actions", "sync_meta"]
        );
    }

    #[tokio::test]
    async fn test_open_file_backed_store() {
        let dir = std::env::temp_dir().join(format!("feedsync_schema_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cache.db");

        let store = CacheStore::open(path.to_str().unwrap(), StoreLimits::default())
            .await
            .unwrap();
        assert_eq!(store.stats().await.unwrap().item_count, 0);
        drop(store);

        std::fs::remove_dir_all(&dir).ok();
    }
}
