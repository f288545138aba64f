use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use thiserror::Error;

use crate::model::{ActionKind, ActionPayload, ActionState, FeedItem, OfflineAction};

// ============================================================================
// Error Types
// ============================================================================

/// Cache store errors.
///
/// None of these are fatal to the feed: the sync controller answers any of
/// them by falling back to network-only mode.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Another process holds the cache database locked
    #[error("Another feedsync instance appears to be using the cache. Close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Cache migration failed: {0}")]
    Migration(String),

    /// Disk full or size limit hit
    #[error("Cache storage quota exceeded")]
    QuotaExceeded,

    /// A stored row could not be decoded
    #[error("Corrupt cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Generic database error
    #[error("Cache database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl StorageError {
    /// Classify a sqlx error, separating lock contention and quota
    /// exhaustion from everything else.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return StorageError::InstanceLocked;
        }

        // SQLITE_FULL (13)
        if error_string.contains("database or disk is full") || error_string.contains("sqlite_full")
        {
            return StorageError::QuotaExceeded;
        }

        StorageError::Other(err)
    }

    pub(crate) fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        StorageError::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

// ============================================================================
// Time helpers
// ============================================================================

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for `offline_actions` queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ActionRow {
    pub id: String,
    pub kind: String,
    pub target_id: Option<String>,
    pub payload: String,
    pub enqueued_at_ms: i64,
    pub attempts: i64,
    pub state: String,
    pub next_attempt_at_ms: i64,
    pub last_error: Option<String>,
}

impl ActionRow {
    pub(crate) fn into_action(self) -> Result<OfflineAction, StorageError> {
        let kind = ActionKind::parse(&self.kind)
            .ok_or_else(|| StorageError::corrupt(&self.id, format!("unknown kind {}", self.kind)))?;
        let state = ActionState::parse(&self.state).ok_or_else(|| {
            StorageError::corrupt(&self.id, format!("unknown state {}", self.state))
        })?;
        let payload: ActionPayload = serde_json::from_str(&self.payload)
            .map_err(|e| StorageError::corrupt(&self.id, e))?;

        Ok(OfflineAction {
            id: self.id,
            kind,
            target_id: self.target_id,
            payload,
            enqueued_at: from_millis(self.enqueued_at_ms),
            attempts: self.attempts.max(0) as u32,
            state,
            next_attempt_at: from_millis(self.next_attempt_at_ms),
            last_error: self.last_error,
        })
    }
}

pub(crate) fn decode_item(id: &str, payload: &str) -> Result<FeedItem, StorageError> {
    serde_json::from_str(payload).map_err(|e| StorageError::corrupt(id, e))
}

pub(crate) fn encode_item(item: &FeedItem) -> Result<String, StorageError> {
    serde_json::to_string(item).map_err(|e| StorageError::corrupt(&item.id, e))
}

// ============================================================================
// Data Structures
// ============================================================================

/// Ordered, materialized view of feed items at a point in time.
///
/// Every ID in `order` has an entry in `items`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedSnapshot {
    pub order: Vec<String>,
    pub items: HashMap<String, FeedItem>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl CachedSnapshot {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&FeedItem> {
        self.items.get(id)
    }

    /// Items in feed order.
    pub fn ordered(&self) -> Vec<FeedItem> {
        self.order
            .iter()
            .filter_map(|id| self.items.get(id).cloned())
            .collect()
    }
}

/// Summary of a `write_items` call.
#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    /// IDs that did not exist before
    pub inserted: usize,
    /// IDs whose stored state was replaced by fresher data
    pub updated: usize,
    /// IDs whose incoming data was older than what is stored
    pub stale: usize,
    /// Items pruned by the eviction ceiling
    pub evicted: u64,
    /// Post-merge state of the written IDs, overlays applied
    pub merged: CachedSnapshot,
}

/// Outcome of a media prefetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaOutcome {
    Stored { size_bytes: usize },
    AlreadyCached,
    Failed(String),
}

/// A cached media blob.
#[derive(Debug, Clone)]
pub struct CachedMedia {
    pub url: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub sha256: String,
    pub fetched_at: DateTime<Utc>,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub item_count: i64,
    pub staged_count: i64,
    pub media_count: i64,
    pub media_bytes: i64,
    pub pending_action_count: i64,
}
