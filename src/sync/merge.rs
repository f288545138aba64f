//! The merge rule shared by the cache store and the in-memory fallback.
//!
//! Cache reads, page fetches and push events all converge here. Conflicts are
//! decided per item by the freshness marker, never by arrival order, so
//! overlapping merges produce the same result in any interleaving.

use std::collections::HashMap;

use crate::model::FeedItem;

/// Where a batch of items came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSource {
    /// The local snapshot
    Cache,
    /// A paginated fetch
    Page,
    /// The realtime stream
    Push,
    /// The server's answer to a local mutation
    Mutation,
}

impl MergeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeSource::Cache => "cache",
            MergeSource::Page => "page",
            MergeSource::Push => "push",
            MergeSource::Mutation => "mutation",
        }
    }
}

/// Whether `incoming` should replace `existing`. Ties replace, so merging an
/// identical item is a no-op in effect.
pub fn should_replace(existing: &FeedItem, incoming: &FeedItem) -> bool {
    incoming.freshness() >= existing.freshness()
}

/// Collapse a batch to one entry per ID, keeping the freshest. First
/// occurrence order is preserved.
pub fn dedup_freshest(items: Vec<FeedItem>) -> Vec<FeedItem> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(items.len());
    let mut out: Vec<FeedItem> = Vec::with_capacity(items.len());

    for item in items {
        match index.get(&item.id) {
            Some(&pos) => {
                if should_replace(&out[pos], &item) {
                    out[pos] = item;
                }
            }
            None => {
                index.insert(item.id.clone(), out.len());
                out.push(item);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub inserted: usize,
    pub updated: usize,
    pub stale: usize,
}

/// Merge `incoming` into an in-memory map with the freshness rule.
pub fn merge_into(current: &mut HashMap<String, FeedItem>, incoming: Vec<FeedItem>) -> MergeCounts {
    let mut counts = MergeCounts::default();
    for item in dedup_freshest(incoming) {
        match current.get(&item.id) {
            None => {
                counts.inserted += 1;
                current.insert(item.id.clone(), item);
            }
            Some(existing) if should_replace(existing, &item) => {
                counts.updated += 1;
                current.insert(item.id.clone(), item);
            }
            Some(_) => counts.stale += 1,
        }
    }
    counts
}

/// Sort items into feed order (newest first, ties by ID descending).
pub fn sort_feed(items: &mut [FeedItem]) {
    items.sort_by_cached_key(|item| item.order_key());
}
