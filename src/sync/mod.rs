//! Feed synchronization: the merge rule, the published view, and the
//! controller that ties the store, the backend, the queue and the push stream
//! together.

mod controller;
pub mod merge;
mod view;

pub use controller::{FeedSyncController, InitialLoad, SyncConfig, SyncError};
pub use merge::MergeSource;
pub use view::{FeedView, MutationOutcome, SyncNotice};
