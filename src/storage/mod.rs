mod actions;
mod items;
mod media;
mod overlay;
mod schema;
mod types;

pub use actions::ActionOutcome;
pub use overlay::{Overlay, OverlayBook};
pub use schema::{CacheStore, StoreLimits};
pub use types::{CacheStats, CachedMedia, CachedSnapshot, MediaOutcome, StorageError, WriteReport};
