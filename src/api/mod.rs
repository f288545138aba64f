//! Backend API contracts consumed by the engine.
//!
//! The engine talks to the backend only through the traits in this module,
//! so every component can be driven by a mock in tests:
//!
//! - [`FeedApi`] - paginated fetch plus the like/comment/post mutations
//! - [`MediaSource`] - raw media retrieval for the prefetcher
//!
//! [`ApiClient`] implements both over HTTP with `reqwest`.

mod client;
mod error;
mod types;

use std::future::Future;

pub use client::{ApiClient, ClientOptions};
pub use error::ApiError;
pub use types::{CommentReceipt, LikeReceipt, MediaBlob, NewComment, NewPost};

use crate::model::FeedItem;

/// Feed endpoints of the backend.
pub trait FeedApi: Send + Sync + 'static {
    /// Fetch one page (1-based). Fewer than `limit` items means end of feed.
    fn fetch_page(
        &self,
        page: u32,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<FeedItem>, ApiError>> + Send;

    /// Set the viewer's like on a post to `liked`.
    fn set_like(
        &self,
        post_id: &str,
        liked: bool,
    ) -> impl Future<Output = Result<LikeReceipt, ApiError>> + Send;

    fn create_comment(
        &self,
        post_id: &str,
        comment: &NewComment,
    ) -> impl Future<Output = Result<CommentReceipt, ApiError>> + Send;

    fn create_post(&self, post: &NewPost) -> impl Future<Output = Result<FeedItem, ApiError>> + Send;
}

/// Where prefetched media comes from.
pub trait MediaSource: Send + Sync + 'static {
    fn fetch_media(&self, url: &str) -> impl Future<Output = Result<MediaBlob, ApiError>> + Send;
}
