//! In-process fakes shared by the unit tests.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::api::{
    ApiError, CommentReceipt, FeedApi, LikeReceipt, MediaBlob, MediaSource, NewComment, NewPost,
};
use crate::model::{Author, Comment, FeedItem, PostKind};
use crate::storage::CacheStore;

pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub(crate) fn item(id: &str, created: i64, updated: Option<i64>) -> FeedItem {
    FeedItem {
        id: id.to_string(),
        author: Author {
            id: "u1".into(),
            name: "Ada".into(),
            avatar_url: None,
        },
        body: format!("post {id}"),
        media: vec![],
        kind: PostKind::General,
        created_at: ts(created),
        updated_at: updated.map(ts),
        like_count: 0,
        comment_count: 0,
        share_count: 0,
        liked_by_viewer: false,
        saved_by_viewer: false,
        pinned: false,
        recent_comments: vec![],
    }
}

/// Scriptable backend: pages are canned, mutations succeed unless a failure
/// has been queued with [`MockApi::fail_next`].
#[derive(Default)]
pub(crate) struct MockApi {
    pub calls: Mutex<Vec<String>>,
    pages: Mutex<HashMap<u32, Vec<FeedItem>>>,
    page_status: Mutex<HashMap<u32, u16>>,
    page_delay: Mutex<Option<Duration>>,
    failures: Mutex<VecDeque<ApiError>>,
    likes: Mutex<HashMap<String, i64>>,
    media: Mutex<HashMap<String, Vec<u8>>>,
    pub media_fetches: AtomicUsize,
    next_id: AtomicUsize,
    close_after_like: Mutex<Option<CacheStore>>,
}

impl MockApi {
    pub fn with_page(self, page: u32, items: Vec<FeedItem>) -> Self {
        self.set_page(page, items);
        self
    }

    pub fn set_page(&self, page: u32, items: Vec<FeedItem>) {
        self.pages.lock().unwrap().insert(page, items);
    }

    pub fn set_page_status(&self, page: u32, status: u16) {
        self.page_status.lock().unwrap().insert(page, status);
    }

    pub fn set_page_delay(&self, delay: Duration) {
        *self.page_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_server_likes(&self, post_id: &str, count: i64) {
        self.likes.lock().unwrap().insert(post_id.to_string(), count);
    }

    pub fn set_media(&self, url: &str, bytes: Vec<u8>) {
        self.media.lock().unwrap().insert(url.to_string(), bytes);
    }

    /// Make the next mutation call fail with `error`.
    pub fn fail_next(&self, error: ApiError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Close `store`'s pool once the next like has reached the server.
    pub fn close_store_after_next_like(&self, store: CacheStore) {
        *self.close_after_like.lock().unwrap() = Some(store);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(call);
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub(crate) fn transient() -> ApiError {
    ApiError::HttpStatus {
        status: 503,
        message: None,
    }
}

pub(crate) fn rejected() -> ApiError {
    ApiError::HttpStatus {
        status: 422,
        message: Some("validation failed".into()),
    }
}

impl FeedApi for MockApi {
    async fn fetch_page(&self, page: u32, limit: u32) -> Result<Vec<FeedItem>, ApiError> {
        self.calls.lock().unwrap().push(format!("page:{page}"));
        let delay = *self.page_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = self.page_status.lock().unwrap().get(&page).copied() {
            return Err(ApiError::HttpStatus {
                status,
                message: None,
            });
        }
        let items = self.pages.lock().unwrap().get(&page).cloned().unwrap_or_default();
        Ok(items.into_iter().take(limit as usize).collect())
    }

    async fn set_like(&self, post_id: &str, liked: bool) -> Result<LikeReceipt, ApiError> {
        self.record(format!("like:{post_id}:{liked}"))?;
        let closing = self.close_after_like.lock().unwrap().take();
        if let Some(store) = closing {
            store.pool.close().await;
        }
        let mut likes = self.likes.lock().unwrap();
        let count = likes.entry(post_id.to_string()).or_insert(0);
        *count = if liked { *count + 1 } else { (*count - 1).max(0) };
        Ok(LikeReceipt {
            liked: Some(liked),
            like_count: *count,
            updated_at: None,
        })
    }

    async fn create_comment(
        &self,
        post_id: &str,
        comment: &NewComment,
    ) -> Result<CommentReceipt, ApiError> {
        self.record(format!("comment:{post_id}:{}", comment.content))?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(CommentReceipt {
            comment: Comment {
                id: format!("srv-comment-{n}"),
                post_id: post_id.to_string(),
                author: Author {
                    id: "viewer".into(),
                    name: "Viewer".into(),
                    avatar_url: None,
                },
                content: comment.content.clone(),
                created_at: Utc::now(),
                pending: false,
            },
            comment_count: None,
            client_ref: Some(comment.client_ref.clone()),
        })
    }

    async fn create_post(&self, post: &NewPost) -> Result<FeedItem, ApiError> {
        self.record(format!("post:{}", post.content))?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut created = item(&format!("srv-post-{n}"), 0, None);
        created.created_at = Utc::now();
        created.body = post.content.clone();
        created.kind = post.kind;
        Ok(created)
    }
}

impl MediaSource for MockApi {
    async fn fetch_media(&self, url: &str) -> Result<MediaBlob, ApiError> {
        self.media_fetches.fetch_add(1, Ordering::SeqCst);
        match self.media.lock().unwrap().get(url) {
            Some(bytes) => Ok(MediaBlob {
                bytes: bytes.clone(),
                content_type: Some("image/jpeg".into()),
            }),
            None => Err(ApiError::HttpStatus {
                status: 404,
                message: None,
            }),
        }
    }
}
