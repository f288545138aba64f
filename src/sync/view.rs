use chrono::{DateTime, Utc};

use crate::model::{ActionKind, FeedItem, NetworkQuality};

/// What the UI renders: the ordered, deduplicated feed plus status flags.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedView {
    pub items: Vec<FeedItem>,
    pub has_more: bool,
    pub is_refreshing: bool,
    pub is_loading_more: bool,
    /// Actions waiting in the offline queue
    pub pending_actions: usize,
    pub quality: NetworkQuality,
    /// The cache store failed and the feed is served from memory
    pub degraded: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Default for FeedView {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            has_more: true,
            is_refreshing: false,
            is_loading_more: false,
            pending_actions: 0,
            quality: NetworkQuality::Offline,
            degraded: false,
            last_synced_at: None,
        }
    }
}

impl FeedView {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&FeedItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|i| i.id == id)
    }

    /// Banner text while offline with queued actions.
    pub fn offline_banner(&self) -> Option<String> {
        if self.quality.is_online() {
            return None;
        }
        match self.pending_actions {
            0 => Some("You are offline".to_string()),
            1 => Some("You are offline, 1 action pending".to_string()),
            n => Some(format!("You are offline, {n} actions pending")),
        }
    }
}

/// User-visible, dismissible messages raised by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    /// A mutation was rolled back: rejected by the server, or retries ran out
    MutationFailed {
        correlation_id: String,
        kind: ActionKind,
        target_id: Option<String>,
        reason: String,
    },
    /// The cache store failed; the feed keeps working from memory
    Degraded { reason: String },
}

/// How an optimistic mutation left the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The server accepted it and the view holds the authoritative state
    Confirmed,
    /// Offline or transient failure: applied locally and queued for replay
    Queued { action_id: String },
    /// Post created while offline: no placeholder, published on reconnect
    WillPublishWhenOnline { action_id: String },
}
