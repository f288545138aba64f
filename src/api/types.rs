use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Comment, FeedItem, MediaRef, PostKind};

/// Body of `GET /feed`. Older backends return a bare array or call the
/// list `posts`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum PageBody {
    Envelope {
        #[serde(alias = "posts")]
        items: Vec<FeedItem>,
    },
    Bare(Vec<FeedItem>),
}

impl PageBody {
    pub(crate) fn into_items(self) -> Vec<FeedItem> {
        match self {
            PageBody::Envelope { items } | PageBody::Bare(items) => items,
        }
    }
}

/// Authoritative like state after `POST /posts/{id}/like`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeReceipt {
    /// Omitted by the server when it agrees with the request
    #[serde(default, alias = "isLiked")]
    pub liked: Option<bool>,
    pub like_count: i64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
    pub content: String,
    /// Temporary local ID, echoed back for correlation
    pub client_ref: String,
}

/// Authoritative comment state after `POST /posts/{id}/comments`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentReceipt {
    pub comment: Comment,
    #[serde(default)]
    pub comment_count: Option<i64>,
    #[serde(default)]
    pub client_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPost {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: PostKind,
    pub media: Vec<MediaRef>,
    pub client_ref: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum PostBody {
    Envelope { post: FeedItem },
    Bare(FeedItem),
}

impl PostBody {
    pub(crate) fn into_item(self) -> FeedItem {
        match self {
            PostBody::Envelope { post } | PostBody::Bare(post) => post,
        }
    }
}

/// Raw media resource.
#[derive(Debug, Clone)]
pub struct MediaBlob {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}
