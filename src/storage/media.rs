use chrono::Utc;
use sha2::{Digest, Sha256};

use super::schema::CacheStore;
use super::types::{from_millis, to_millis, CachedMedia, MediaOutcome, StorageError};
use crate::api::MediaSource;

impl CacheStore {
    // ========================================================================
    // Media Cache Operations
    // ========================================================================

    pub async fn has_media(&self, url: &str) -> Result<bool, StorageError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM media_cache WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn get_media(&self, url: &str) -> Result<Option<CachedMedia>, StorageError> {
        let row: Option<(Vec<u8>, Option<String>, String, i64)> = sqlx::query_as(
            "SELECT bytes, content_type, sha256, fetched_at_ms FROM media_cache WHERE url = ?",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(bytes, content_type, sha256, fetched_at_ms)| CachedMedia {
            url: url.to_string(),
            bytes,
            content_type,
            sha256,
            fetched_at: from_millis(fetched_at_ms),
        }))
    }

    /// Download `url` through `source` and cache the bytes.
    ///
    /// Already cached URLs are not fetched again. A failed fetch is reported
    /// in the outcome and never returned as an error: prefetch failures are
    /// not user-visible. Only storage failures surface as `Err`.
    pub async fn prefetch_media<S: MediaSource>(
        &self,
        source: &S,
        url: &str,
    ) -> Result<MediaOutcome, StorageError> {
        if self.has_media(url).await? {
            return Ok(MediaOutcome::AlreadyCached);
        }

        let blob = match source.fetch_media(url).await {
            Ok(blob) => blob,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Media prefetch failed");
                return Ok(MediaOutcome::Failed(e.to_string()));
            }
        };

        let size_bytes = blob.bytes.len();
        if size_bytes as u64 > self.limits.max_media_bytes {
            return Ok(MediaOutcome::Failed(format!(
                "{size_bytes} bytes exceeds the media cache ceiling"
            )));
        }
        let sha256 = format!("{:x}", Sha256::digest(&blob.bytes));

        sqlx::query(
            r#"
            INSERT INTO media_cache (url, bytes, content_type, size_bytes, sha256, fetched_at_ms)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                bytes = excluded.bytes,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                sha256 = excluded.sha256,
                fetched_at_ms = excluded.fetched_at_ms
        "#,
        )
        .bind(url)
        .bind(&blob.bytes)
        .bind(&blob.content_type)
        .bind(size_bytes as i64)
        .bind(&sha256)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;

        self.evict_media().await?;

        tracing::debug!(url = %url, size_bytes = size_bytes, "Media cached");
        Ok(MediaOutcome::Stored { size_bytes })
    }

    /// Drop the oldest blobs until the cache fits `max_media_bytes`.
    ///
    /// Returns the number of blobs deleted.
    pub async fn evict_media(&self) -> Result<u64, StorageError> {
        let (total,): (Option<i64>,) = sqlx::query_as("SELECT SUM(size_bytes) FROM media_cache")
            .fetch_one(&self.pool)
            .await?;
        let mut excess = total.unwrap_or(0) - self.limits.max_media_bytes as i64;
        if excess <= 0 {
            return Ok(0);
        }

        let candidates: Vec<(String, i64)> = sqlx::query_as(
            "SELECT url, size_bytes FROM media_cache ORDER BY fetched_at_ms ASC, url ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tx = self.pool.begin().await.map_err(StorageError::from_sqlx)?;
        let mut deleted = 0u64;
        for (url, size) in candidates {
            if excess <= 0 {
                break;
            }
            sqlx::query("DELETE FROM media_cache WHERE url = ?")
                .bind(&url)
                .execute(&mut *tx)
                .await?;
            excess -= size;
            deleted += 1;
        }
        tx.commit().await.map_err(StorageError::from_sqlx)?;

        tracing::info!(evicted = deleted, "Evicted oldest cached media");
        Ok(deleted)
    }
}
