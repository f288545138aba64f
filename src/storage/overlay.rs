//! Optimistic overlays.
//!
//! The tables hold server state only. Local mutations that have not been
//! confirmed live here as overlays keyed by correlation ID and are applied on
//! top of every public read, so a background refresh can replace the server
//! state without dropping a pending change.

use chrono::{DateTime, Utc};

use super::schema::CacheStore;
use crate::model::{Comment, FeedItem, LikeUndo};

#[derive(Debug, Clone, PartialEq)]
pub enum Overlay {
    /// Viewer toggled a like. Only the intended flag is stored; the counter
    /// is derived from whatever server state it is applied to.
    Like {
        item_id: String,
        liked: bool,
        undo: LikeUndo,
        applied_at: DateTime<Utc>,
    },
    /// Viewer posted a comment that the server has not confirmed.
    Comment { item_id: String, comment: Comment },
    /// Viewer created a post; shown until the server returns the real item.
    Placeholder { item: FeedItem },
}

impl Overlay {
    pub fn item_id(&self) -> &str {
        match self {
            Overlay::Like { item_id, .. } | Overlay::Comment { item_id, .. } => item_id,
            Overlay::Placeholder { item } => &item.id,
        }
    }

    fn apply(&self, item: &mut FeedItem) {
        match self {
            Overlay::Like { liked, .. } => {
                // The counter already includes the viewer's like iff the flag
                // it came with is set, so only a flag change moves it
                let shift = i64::from(*liked) - i64::from(item.liked_by_viewer);
                item.like_count = (item.like_count + shift).max(0);
                item.liked_by_viewer = *liked;
            }
            Overlay::Comment { comment, .. } => {
                if !item.recent_comments.iter().any(|c| c.id == comment.id) {
                    item.recent_comments.push(comment.clone());
                    item.comment_count += 1;
                }
            }
            Overlay::Placeholder { .. } => {}
        }
    }
}

/// Insertion-ordered set of pending overlays.
#[derive(Debug, Default)]
pub struct OverlayBook {
    entries: Vec<(String, Overlay)>,
}

impl OverlayBook {
    pub fn push(&mut self, correlation_id: String, overlay: Overlay) {
        self.entries.retain(|(id, _)| id != &correlation_id);
        self.entries.push((correlation_id, overlay));
    }

    pub fn remove(&mut self, correlation_id: &str) -> Option<Overlay> {
        let pos = self.entries.iter().position(|(id, _)| id == correlation_id)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.iter().any(|(id, _)| id == correlation_id)
    }

    pub fn targets(&self, item_id: &str) -> bool {
        self.entries.iter().any(|(_, o)| o.item_id() == item_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Apply every overlay that targets `item`, in insertion order.
    pub fn apply(&self, item: &mut FeedItem) {
        let id = item.id.clone();
        for (_, overlay) in self.entries.iter().filter(|(_, o)| o.item_id() == id) {
            overlay.apply(item);
        }
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &FeedItem> {
        self.entries.iter().filter_map(|(_, o)| match o {
            Overlay::Placeholder { item } => Some(item),
            _ => None,
        })
    }

    /// IDs of items with at least one pending overlay.
    pub fn target_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .map(|(_, o)| o.item_id().to_string())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

impl CacheStore {
    // ========================================================================
    // Overlay Operations
    // ========================================================================

    /// Record an optimistic mutation. Visible on the next read.
    pub fn push_overlay(&self, correlation_id: &str, overlay: Overlay) {
        match self.overlays.lock() {
            Ok(mut book) => book.push(correlation_id.to_string(), overlay),
            Err(e) => tracing::error!(error = %e, "Overlay book poisoned, dropping overlay"),
        }
    }

    /// Drop an optimistic mutation, returning it if it was still pending.
    pub fn remove_overlay(&self, correlation_id: &str) -> Option<Overlay> {
        self.overlays
            .lock()
            .ok()
            .and_then(|mut book| book.remove(correlation_id))
    }

    pub fn overlay(&self, correlation_id: &str) -> Option<Overlay> {
        self.overlays.lock().ok().and_then(|book| {
            book.entries
                .iter()
                .find(|(id, _)| id == correlation_id)
                .map(|(_, o)| o.clone())
        })
    }

    pub fn has_overlay(&self, correlation_id: &str) -> bool {
        self.overlays
            .lock()
            .map(|book| book.contains(correlation_id))
            .unwrap_or(false)
    }

    pub fn overlay_count(&self) -> usize {
        self.overlays.lock().map(|book| book.len()).unwrap_or(0)
    }

    /// Apply pending overlays to server items and add placeholders.
    ///
    /// Used by every public read, and by the sync controller when it has to
    /// materialize a view without the database.
    pub fn apply_overlays(&self, items: impl IntoIterator<Item = FeedItem>) -> Vec<FeedItem> {
        let book = match self.overlays.lock() {
            Ok(book) => book,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut out: Vec<FeedItem> = items
            .into_iter()
            .map(|mut item| {
                book.apply(&mut item);
                item
            })
            .collect();

        for placeholder in book.placeholders() {
            if !out.iter().any(|i| i.id == placeholder.id) {
                out.push(placeholder.clone());
            }
        }
        out
    }
}
