use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;
use std::collections::HashMap;

use super::schema::CacheStore;
use super::types::{
    decode_item, encode_item, from_millis, to_millis, CacheStats, CachedSnapshot, StorageError,
    WriteReport,
};
use crate::model::{Comment, FeedItem, LikeUndo, OrderKey};
use crate::sync::merge::{dedup_freshest, should_replace, sort_feed};

/// Hard cap on rows returned by a single snapshot read (OOM protection)
const MAX_SNAPSHOT_ITEMS: i64 = 5000;

const LAST_SYNCED_KEY: &str = "last_synced_at";

impl CacheStore {
    // ========================================================================
    // Snapshot Reads
    // ========================================================================

    /// Read the newest `limit` public items, overlays applied.
    ///
    /// Staged items never appear here.
    pub async fn read_snapshot(&self, limit: usize) -> Result<CachedSnapshot, StorageError> {
        let limit = (limit as i64).clamp(0, MAX_SNAPSHOT_ITEMS);
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT id, payload FROM feed_items
            WHERE staged = 0
            ORDER BY created_at_ms DESC, id DESC
            LIMIT ?
        "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        self.build_snapshot(rows).await
    }

    /// Read every public item at or above `floor` in feed order (everything
    /// when `floor` is `None`), overlays applied.
    pub async fn read_window(
        &self,
        floor: Option<&OrderKey>,
    ) -> Result<CachedSnapshot, StorageError> {
        let rows: Vec<(String, String)> = match floor {
            Some(floor) => {
                let floor_ms = to_millis(floor.created_at);
                sqlx::query_as(
                    r#"
                    SELECT id, payload FROM feed_items
                    WHERE staged = 0
                      AND (created_at_ms > ? OR (created_at_ms = ? AND id >= ?))
                    ORDER BY created_at_ms DESC, id DESC
                    LIMIT ?
                "#,
                )
                .bind(floor_ms)
                .bind(floor_ms)
                .bind(&floor.id)
                .bind(MAX_SNAPSHOT_ITEMS)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, payload FROM feed_items
                    WHERE staged = 0
                    ORDER BY created_at_ms DESC, id DESC
                    LIMIT ?
                "#,
                )
                .bind(MAX_SNAPSHOT_ITEMS)
                .fetch_all(&self.pool)
                .await?
            }
        };

        self.build_snapshot(rows).await
    }

    async fn build_snapshot(
        &self,
        rows: Vec<(String, String)>,
    ) -> Result<CachedSnapshot, StorageError> {
        let mut items = Vec::with_capacity(rows.len());
        for (id, payload) in rows {
            match decode_item(&id, &payload) {
                Ok(item) => items.push(item),
                // A single bad row must not take the feed down
                Err(e) => tracing::warn!(id = %id, error = %e, "Skipping corrupt cached item"),
            }
        }

        let last_synced_at = self.last_synced_at().await?;
        Ok(snapshot_from(self.apply_overlays(items), last_synced_at))
    }

    /// Server state of one item, without overlays.
    pub async fn get_item(&self, id: &str) -> Result<Option<FeedItem>, StorageError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM feed_items WHERE id = ? AND staged = 0")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(payload,)| decode_item(id, &payload)).transpose()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Upsert items by ID with the freshness rule, then enforce the eviction
    /// ceiling.
    ///
    /// An incoming item replaces the stored one only if its `updatedAt` is not
    /// older; pending overlays are reapplied on top of whatever wins. Staged
    /// copies of the written IDs are promoted. The whole batch is one
    /// transaction.
    pub async fn write_items(&self, items: Vec<FeedItem>) -> Result<WriteReport, StorageError> {
        let items = dedup_freshest(items);
        let mut report = WriteReport::default();
        if items.is_empty() {
            return Ok(report);
        }

        let now_ms = to_millis(Utc::now());
        let mut merged: Vec<FeedItem> = Vec::with_capacity(items.len());
        let mut tx = self.pool.begin().await.map_err(StorageError::from_sqlx)?;

        for item in items {
            let existing: Option<(String, i64)> =
                sqlx::query_as("SELECT payload, staged FROM feed_items WHERE id = ?")
                    .bind(&item.id)
                    .fetch_optional(&mut *tx)
                    .await?;

            let keep_existing = match &existing {
                None => false,
                Some((payload, staged)) => match decode_item(&item.id, payload) {
                    Ok(current) if !should_replace(&current, &item) => {
                        if *staged != 0 {
                            sqlx::query("UPDATE feed_items SET staged = 0 WHERE id = ?")
                                .bind(&item.id)
                                .execute(&mut *tx)
                                .await?;
                        }
                        report.stale += 1;
                        merged.push(current);
                        true
                    }
                    Ok(_) => false,
                    Err(e) => {
                        tracing::warn!(id = %item.id, error = %e, "Replacing corrupt cached item");
                        false
                    }
                },
            };
            if keep_existing {
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO feed_items (id, created_at_ms, updated_at_ms, payload, staged, stored_at_ms)
                VALUES (?, ?, ?, ?, 0, ?)
                ON CONFLICT(id) DO UPDATE SET
                    created_at_ms = excluded.created_at_ms,
                    updated_at_ms = excluded.updated_at_ms,
                    payload = excluded.payload,
                    staged = 0,
                    stored_at_ms = excluded.stored_at_ms
            "#,
            )
            .bind(&item.id)
            .bind(to_millis(item.created_at))
            .bind(to_millis(item.freshness()))
            .bind(encode_item(&item)?)
            .bind(now_ms)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from_sqlx)?;

            if existing.is_some() {
                report.updated += 1;
            } else {
                report.inserted += 1;
            }
            merged.push(item);
        }

        tx.commit().await.map_err(StorageError::from_sqlx)?;

        report.evicted = self.evict_over_ceiling().await?;
        report.merged = snapshot_from(self.apply_overlays(merged), self.last_synced_at().await?);

        tracing::debug!(
            inserted = report.inserted,
            updated = report.updated,
            stale = report.stale,
            evicted = report.evicted,
            "Items written"
        );
        Ok(report)
    }

    /// Park items in the staging area. They stay out of every public read
    /// until a `write_items` for the same ID or `promote_staged`.
    ///
    /// Items that are already public are left alone.
    ///
    /// This is a store-level capability for callers that fetch pages ahead
    /// of display. The sync controller never stages: everything it merges
    /// goes straight through `write_items`.
    pub async fn stage_items(&self, items: &[FeedItem]) -> Result<usize, StorageError> {
        let now_ms = to_millis(Utc::now());
        let mut staged = 0;
        let mut tx = self.pool.begin().await.map_err(StorageError::from_sqlx)?;

        for item in items {
            let result = sqlx::query(
                r#"
                INSERT INTO feed_items (id, created_at_ms, updated_at_ms, payload, staged, stored_at_ms)
                VALUES (?, ?, ?, ?, 1, ?)
                ON CONFLICT(id) DO UPDATE SET
                    created_at_ms = excluded.created_at_ms,
                    updated_at_ms = excluded.updated_at_ms,
                    payload = excluded.payload,
                    stored_at_ms = excluded.stored_at_ms
                WHERE feed_items.staged = 1 AND excluded.updated_at_ms >= feed_items.updated_at_ms
            "#,
            )
            .bind(&item.id)
            .bind(to_millis(item.created_at))
            .bind(to_millis(item.freshness()))
            .bind(encode_item(item)?)
            .bind(now_ms)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from_sqlx)?;
            staged += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(StorageError::from_sqlx)?;
        Ok(staged)
    }

    /// Move every staged item into the public snapshot.
    pub async fn promote_staged(&self) -> Result<u64, StorageError> {
        let result = sqlx::query("UPDATE feed_items SET staged = 0 WHERE staged = 1")
            .execute(&self.pool)
            .await?;
        let promoted = result.rows_affected();
        if promoted > 0 {
            self.evict_over_ceiling().await?;
        }
        Ok(promoted)
    }

    /// Write back the captured like fields of an item (optimistic rollback).
    ///
    /// Every other field keeps whatever the server last sent.
    pub async fn restore_like_fields(&self, id: &str, undo: LikeUndo) -> Result<bool, StorageError> {
        self.modify_item(id, |item| {
            item.liked_by_viewer = undo.liked;
            item.like_count = undo.like_count;
        })
        .await
    }

    /// Fold a confirmed like into server state. The server's counter wins.
    pub async fn apply_server_like(
        &self,
        id: &str,
        liked: bool,
        like_count: i64,
        confirmed_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        self.modify_item(id, |item| {
            item.liked_by_viewer = liked;
            item.like_count = like_count;
            bump_freshness(item, confirmed_at);
        })
        .await
    }

    /// Fold a confirmed comment into server state.
    pub async fn apply_server_comment(
        &self,
        post_id: &str,
        comment: Comment,
        comment_count: Option<i64>,
        confirmed_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        self.modify_item(post_id, move |item| {
            if !item.recent_comments.iter().any(|c| c.id == comment.id) {
                item.recent_comments.push(Comment {
                    pending: false,
                    ..comment
                });
                item.comment_count += 1;
            }
            if let Some(count) = comment_count {
                item.comment_count = count;
            }
            bump_freshness(item, confirmed_at);
        })
        .await
    }

    /// Read-modify-write one public item inside a transaction.
    async fn modify_item<F>(&self, id: &str, f: F) -> Result<bool, StorageError>
    where
        F: FnOnce(&mut FeedItem),
    {
        let mut tx = self.pool.begin().await.map_err(StorageError::from_sqlx)?;

        let row: Option<(String,)> = sqlx::query_as("SELECT payload FROM feed_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some((payload,)) = row else {
            return Ok(false);
        };

        let mut item = decode_item(id, &payload)?;
        f(&mut item);

        sqlx::query("UPDATE feed_items SET payload = ?, updated_at_ms = ? WHERE id = ?")
            .bind(encode_item(&item)?)
            .bind(to_millis(item.freshness()))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from_sqlx)?;

        tx.commit().await.map_err(StorageError::from_sqlx)?;
        Ok(true)
    }

    // ========================================================================
    // Eviction
    // ========================================================================

    /// Tell the store which items are on screen. Rendered items are never
    /// evicted.
    pub fn set_rendered<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut rendered) = self.rendered.lock() {
            rendered.clear();
            rendered.extend(ids.into_iter().map(Into::into));
        }
    }

    /// Prune oldest public items beyond `max_items`, skipping rendered items
    /// and items with pending overlays.
    ///
    /// Returns the number of items deleted.
    pub async fn evict_over_ceiling(&self) -> Result<u64, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feed_items WHERE staged = 0")
            .fetch_one(&self.pool)
            .await?;
        let excess = count - self.limits.max_items as i64;
        if excess <= 0 {
            return Ok(0);
        }

        let mut protected: Vec<String> = self
            .rendered
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();
        if let Ok(book) = self.overlays.lock() {
            protected.extend(book.target_ids());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "DELETE FROM feed_items WHERE id IN (SELECT id FROM feed_items WHERE staged = 0",
        );
        if !protected.is_empty() {
            builder.push(" AND id NOT IN (");
            let mut separated = builder.separated(", ");
            for id in &protected {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
        }
        builder.push(" ORDER BY created_at_ms ASC, id ASC LIMIT ");
        builder.push_bind(excess);
        builder.push(")");

        let result = builder.build().execute(&self.pool).await?;
        let evicted = result.rows_affected();
        if evicted > 0 {
            tracing::info!(
                evicted = evicted,
                ceiling = self.limits.max_items,
                "Evicted oldest cached items"
            );
        }
        Ok(evicted)
    }

    // ========================================================================
    // Sync Metadata
    // ========================================================================

    pub async fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM sync_meta WHERE key = ?")
            .bind(LAST_SYNCED_KEY)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .and_then(|(value,)| value.parse::<i64>().ok())
            .map(from_millis))
    }

    pub async fn mark_synced(&self, at: DateTime<Utc>) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO sync_meta (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        )
        .bind(LAST_SYNCED_KEY)
        .bind(to_millis(at).to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub async fn stats(&self) -> Result<CacheStats, StorageError> {
        let (item_count, staged_count): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(CASE WHEN staged = 0 THEN 1 END),
                COUNT(CASE WHEN staged = 1 THEN 1 END)
            FROM feed_items
        "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let (media_count, media_bytes): (i64, Option<i64>) =
            sqlx::query_as("SELECT COUNT(*), SUM(size_bytes) FROM media_cache")
                .fetch_one(&self.pool)
                .await?;

        let pending_action_count = self.pending_action_count().await?;

        Ok(CacheStats {
            item_count,
            staged_count,
            media_count,
            media_bytes: media_bytes.unwrap_or(0),
            pending_action_count,
        })
    }
}

fn bump_freshness(item: &mut FeedItem, at: DateTime<Utc>) {
    if at > item.freshness() {
        item.updated_at = Some(at);
    }
}

/// Sort items into feed order and index them.
pub(crate) fn snapshot_from(
    mut items: Vec<FeedItem>,
    last_synced_at: Option<DateTime<Utc>>,
) -> CachedSnapshot {
    sort_feed(&mut items);
    let order = items.iter().map(|i| i.id.clone()).collect();
    let items: HashMap<String, FeedItem> = items.into_iter().map(|i| (i.id.clone(), i)).collect();
    CachedSnapshot {
        order,
        items,
        last_synced_at,
    }
}
