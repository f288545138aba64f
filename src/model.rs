//! Domain types shared by every component of the engine.
//!
//! `FeedItem` doubles as the wire shape of the backend API (camelCase JSON)
//! and the unit the cache store persists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// Feed Items
// ============================================================================

/// Closed set of post categories the backend emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PostKind {
    #[default]
    General,
    Achievement,
    Tip,
    Success,
    Announcement,
    Reel,
}

impl PostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostKind::General => "general",
            PostKind::Achievement => "achievement",
            PostKind::Tip => "tip",
            PostKind::Success => "success",
            PostKind::Announcement => "announcement",
            PostKind::Reel => "reel",
        }
    }
}

impl std::str::FromStr for PostKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "general" => Ok(PostKind::General),
            "achievement" => Ok(PostKind::Achievement),
            "tip" => Ok(PostKind::Tip),
            "success" => Ok(PostKind::Success),
            "announcement" => Ok(PostKind::Announcement),
            "reel" => Ok(PostKind::Reel),
            other => Err(format!("unknown post kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub url: String,
    #[serde(default)]
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub author: Author,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Local-only marker for a comment that has not been confirmed by the server.
    #[serde(default, skip_serializing)]
    pub pending: bool,
}

/// A single post in the social feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub id: String,
    pub author: Author,
    #[serde(alias = "content")]
    pub body: String,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    #[serde(default, alias = "type")]
    pub kind: PostKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub comment_count: i64,
    #[serde(default)]
    pub share_count: i64,
    #[serde(default, alias = "isLiked")]
    pub liked_by_viewer: bool,
    #[serde(default, alias = "isSaved")]
    pub saved_by_viewer: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub recent_comments: Vec<Comment>,
}

impl FeedItem {
    /// Freshness marker used by the merge routine. Items the server never
    /// touched after creation fall back to their creation time.
    pub fn freshness(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }

    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            created_at: self.created_at,
            id: self.id.clone(),
        }
    }

    /// Media URLs worth prefetching: the full resource for images, the
    /// thumbnail (when present) for videos.
    pub fn prefetchable_media(&self) -> impl Iterator<Item = &str> {
        self.media.iter().map(|m| match (m.kind, &m.thumbnail_url) {
            (MediaKind::Video, Some(thumb)) => thumb.as_str(),
            _ => m.url.as_str(),
        })
    }
}

/// Feed ordering: newest `created_at` first, ties broken by descending ID so
/// merges stay stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub created_at: DateTime<Utc>,
    pub id: String,
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Offline Actions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    LikeToggle,
    CommentCreate,
    PostCreate,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::LikeToggle => "like_toggle",
            ActionKind::CommentCreate => "comment_create",
            ActionKind::PostCreate => "post_create",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "like_toggle" => Some(ActionKind::LikeToggle),
            "comment_create" => Some(ActionKind::CommentCreate),
            "post_create" => Some(ActionKind::PostCreate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    Pending,
    Syncing,
    Failed,
    Succeeded,
}

impl ActionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionState::Pending => "PENDING",
            ActionState::Syncing => "SYNCING",
            ActionState::Failed => "FAILED",
            ActionState::Succeeded => "SUCCEEDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ActionState::Pending),
            "SYNCING" => Some(ActionState::Syncing),
            "FAILED" => Some(ActionState::Failed),
            "SUCCEEDED" => Some(ActionState::Succeeded),
            _ => None,
        }
    }
}

/// Pre-mutation values of the like fields, captured when a like is applied
/// optimistically. Rollback writes these back verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeUndo {
    pub liked: bool,
    pub like_count: i64,
}

/// Mutation-specific data carried by an [`OfflineAction`].
///
/// Besides what the server call needs, each variant keeps enough local state
/// to rebuild the optimistic overlay after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionPayload {
    Like {
        intended: bool,
        undo: LikeUndo,
    },
    Comment {
        comment: Comment,
    },
    Post {
        body: String,
        kind: PostKind,
        #[serde(default)]
        media: Vec<MediaRef>,
    },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::Like { .. } => ActionKind::LikeToggle,
            ActionPayload::Comment { .. } => ActionKind::CommentCreate,
            ActionPayload::Post { .. } => ActionKind::PostCreate,
        }
    }
}

/// A mutation waiting for server confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineAction {
    /// Locally generated correlation ID, shared with the optimistic overlay.
    pub id: String,
    pub kind: ActionKind,
    pub target_id: Option<String>,
    pub payload: ActionPayload,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub state: ActionState,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl OfflineAction {
    pub fn new(target_id: Option<String>, payload: ActionPayload) -> Self {
        Self::with_id(new_correlation_id(), target_id, payload)
    }

    pub fn with_id(id: String, target_id: Option<String>, payload: ActionPayload) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind: payload.kind(),
            target_id,
            payload,
            enqueued_at: now,
            attempts: 0,
            state: ActionState::Pending,
            next_attempt_at: now,
            last_error: None,
        }
    }
}

/// Generate a fresh correlation ID for an optimistic mutation.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Prefix for IDs the client invents before the server assigns real ones.
pub const LOCAL_ID_PREFIX: &str = "local-";

pub fn new_local_id() -> String {
    format!("{LOCAL_ID_PREFIX}{}", uuid::Uuid::new_v4())
}

// ============================================================================
// Network Quality
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkQuality {
    #[default]
    Offline,
    OnlineSlow,
    OnlineFast,
}

impl NetworkQuality {
    pub fn is_online(&self) -> bool {
        !matches!(self, NetworkQuality::Offline)
    }
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkQuality::Offline => "offline",
            NetworkQuality::OnlineSlow => "online-slow",
            NetworkQuality::OnlineFast => "online-fast",
        };
        f.write_str(s)
    }
}
