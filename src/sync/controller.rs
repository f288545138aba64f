use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::merge::{merge_into, sort_feed, MergeSource};
use super::view::{FeedView, MutationOutcome, SyncNotice};
use crate::api::{ApiError, CommentReceipt, FeedApi, LikeReceipt, MediaSource, NewComment, NewPost};
use crate::model::{
    new_correlation_id, new_local_id, ActionPayload, Author, Comment, FeedItem, LikeUndo,
    MediaRef, OfflineAction, OrderKey, PostKind,
};
use crate::network::NetworkMonitor;
use crate::prefetch::{PrefetchBatch, PrefetchConfig, PrefetchManager};
use crate::queue::{
    ActionReceipt, DrainError, DrainReport, OfflineActionQueue, Resolution, RetryPolicy, SettledAction,
};
use crate::realtime::{PushEvent, RealtimeBridge};
use crate::storage::{CacheStore, Overlay, StorageError};

const NOTICE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Post {0} is not in the feed")]
    UnknownItem(String),

    #[error("Content must not be empty")]
    EmptyContent,

    /// Definitive server rejection; the optimistic change was rolled back
    #[error("Server rejected the change: {0}")]
    Rejected(#[source] ApiError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub page_size: u32,
    pub drain_interval: Duration,
    pub retry: RetryPolicy,
    pub prefetch: PrefetchConfig,
    /// Author stamped on optimistic comments and placeholder posts
    pub viewer: Author,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 15,
            drain_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            prefetch: PrefetchConfig::default(),
            viewer: Author {
                id: "me".to_string(),
                name: "You".to_string(),
                avatar_url: None,
            },
        }
    }
}

/// Result of [`FeedSyncController::initial_load`].
#[derive(Debug)]
pub struct InitialLoad {
    /// Cached view, available before any network call
    pub view: FeedView,
    /// Background page-1 refresh; `None` when starting offline
    pub refresh: Option<JoinHandle<Result<usize, SyncError>>>,
}

struct State {
    /// Oldest item of the paged window; the view shows everything above it
    floor: Option<OrderKey>,
    next_page: u32,
    has_more: bool,
    refresh_generation: u64,
    refreshing: bool,
    loading_more: bool,
    degraded: bool,
    last_synced_at: Option<DateTime<Utc>>,
    /// Server state of the window, kept in step with the store so degraded
    /// mode can take over without a gap
    memory: HashMap<String, FeedItem>,
}

impl State {
    fn extend_floor(&mut self, items: &[FeedItem]) {
        // OrderKey sorts newest first: the greatest key is the oldest item
        if let Some(oldest) = items.iter().map(FeedItem::order_key).max() {
            match &self.floor {
                Some(floor) if *floor >= oldest => {}
                _ => self.floor = Some(oldest),
            }
        }
    }
}

// ============================================================================
// Feed Sync Controller
// ============================================================================

/// Orchestrates the cache store, the backend, the offline queue, the push
/// stream and the prefetcher into one consistent feed view.
///
/// Every inbound source (cache read, page fetch, push event, mutation
/// receipt) goes through [`FeedSyncController::merge_incoming`], which
/// resolves conflicts per item by freshness rather than arrival order.
pub struct FeedSyncController<A: FeedApi + MediaSource> {
    store: CacheStore,
    api: Arc<A>,
    monitor: NetworkMonitor,
    queue: OfflineActionQueue,
    prefetch: PrefetchManager<A>,
    config: SyncConfig,
    state: Mutex<State>,
    view_tx: watch::Sender<FeedView>,
    notices: broadcast::Sender<SyncNotice>,
    merge_lock: tokio::sync::Mutex<()>,
    publish_lock: tokio::sync::Mutex<()>,
}

impl<A: FeedApi + MediaSource> FeedSyncController<A> {
    pub fn new(store: CacheStore, api: Arc<A>, monitor: NetworkMonitor, config: SyncConfig) -> Self {
        let queue = OfflineActionQueue::new(store.clone(), monitor.clone(), config.retry);
        let prefetch =
            PrefetchManager::new(store.clone(), api.clone(), monitor.clone(), config.prefetch);
        let (view_tx, _) = watch::channel(FeedView {
            quality: monitor.current(),
            ..FeedView::default()
        });
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);

        Self {
            store,
            api,
            monitor,
            queue,
            prefetch,
            config,
            state: Mutex::new(State {
                floor: None,
                next_page: 2,
                has_more: true,
                refresh_generation: 0,
                refreshing: false,
                loading_more: false,
                degraded: false,
                last_synced_at: None,
                memory: HashMap::new(),
            }),
            view_tx,
            notices,
            merge_lock: tokio::sync::Mutex::new(()),
            publish_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn view(&self) -> FeedView {
        self.view_tx.borrow().clone()
    }

    /// Receiver that observes every published view. Dropping it unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<FeedView> {
        self.view_tx.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    pub fn queue(&self) -> &OfflineActionQueue {
        &self.queue
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Serve the cached snapshot at once and start a background refresh of
    /// page 1 (skipped while offline).
    pub async fn initial_load(self: &Arc<Self>) -> InitialLoad {
        self.restore_pending().await;

        match self.store.read_snapshot(self.config.page_size as usize).await {
            Ok(snapshot) => {
                let cached = snapshot.ordered();
                // The snapshot has overlays applied; the mirror wants server state
                let mut server = Vec::with_capacity(cached.len());
                for item in &cached {
                    if let Ok(Some(raw)) = self.store.get_item(&item.id).await {
                        server.push(raw);
                    }
                }
                let mut state = self.state();
                state.extend_floor(&cached);
                state.last_synced_at = snapshot.last_synced_at;
                merge_into(&mut state.memory, server);
                tracing::info!(cached = cached.len(), "Serving cached feed");
            }
            Err(e) => self.enter_degraded(&e),
        }
        self.publish().await;
        let view = self.view();

        let refresh = if self.monitor.current().is_online() {
            let this = Arc::clone(self);
            Some(tokio::spawn(async move { this.refresh().await }))
        } else {
            tracing::info!("Starting offline, background refresh skipped");
            None
        };

        InitialLoad { view, refresh }
    }

    /// Fetch page 1 and merge it.
    ///
    /// Overlapping refreshes are all merged; only the latest may clear the
    /// refreshing indicator.
    pub async fn refresh(&self) -> Result<usize, SyncError> {
        let generation = {
            let mut state = self.state();
            state.refresh_generation += 1;
            state.refreshing = true;
            state.refresh_generation
        };
        self.publish().await;

        let result = self.api.fetch_page(1, self.config.page_size).await;
        let outcome = match result {
            Ok(items) => {
                let received = items.len();
                {
                    let mut state = self.state();
                    if state.next_page <= 2 && received < self.config.page_size as usize {
                        state.has_more = false;
                    }
                }
                self.merge_incoming(items, MergeSource::Page).await;
                self.record_synced(Utc::now()).await;
                Ok(received)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Feed refresh failed, serving cache");
                Err(SyncError::Api(e))
            }
        };

        {
            let mut state = self.state();
            if state.refresh_generation == generation {
                state.refreshing = false;
            }
        }
        self.publish().await;
        outcome
    }

    /// Fetch the next page and append it.
    ///
    /// A short page or a definitive 4xx ends the feed (`has_more = false`)
    /// without an error. Returns the number of items received.
    pub async fn load_more(&self) -> Result<usize, SyncError> {
        let page = {
            let mut state = self.state();
            if state.loading_more || !state.has_more {
                return Ok(0);
            }
            state.loading_more = true;
            state.next_page
        };
        self.publish().await;

        let outcome = match self.api.fetch_page(page, self.config.page_size).await {
            Ok(items) => {
                let received = items.len();
                {
                    let mut state = self.state();
                    if received < self.config.page_size as usize {
                        state.has_more = false;
                    }
                    state.next_page = state.next_page.max(page + 1);
                }
                self.merge_incoming(items, MergeSource::Page).await;
                Ok(received)
            }
            Err(e) if e.is_client_error() => {
                tracing::info!(page = page, error = %e, "Pagination ended by server");
                self.state().has_more = false;
                Ok(0)
            }
            Err(e) => {
                tracing::warn!(page = page, error = %e, "Loading more failed");
                Err(SyncError::Api(e))
            }
        };

        self.state().loading_more = false;
        self.publish().await;
        outcome
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Merge a batch from any source into the store and republish.
    ///
    /// Conflicts resolve per item by freshness; pending optimistic overlays
    /// are reapplied on top of whatever wins.
    pub async fn merge_incoming(&self, items: Vec<FeedItem>, source: MergeSource) {
        if items.is_empty() {
            return;
        }
        let _merge = self.merge_lock.lock().await;

        {
            let mut state = self.state();
            if source == MergeSource::Page {
                state.extend_floor(&items);
            }
            merge_into(&mut state.memory, items.clone());
        }

        if !self.state().degraded {
            match self.store.write_items(items).await {
                Ok(report) => tracing::debug!(
                    source = source.as_str(),
                    inserted = report.inserted,
                    updated = report.updated,
                    stale = report.stale,
                    "Merged incoming items"
                ),
                Err(e) => self.enter_degraded(&e),
            }
        }

        self.publish().await;
    }

    // ========================================================================
    // Optimistic Mutations
    // ========================================================================

    /// Toggle the viewer's like on `post_id`, visible before any network
    /// call.
    ///
    /// # Errors
    ///
    /// `SyncError::Rejected` when the server definitively refuses; the like
    /// fields are then restored to their exact pre-toggle values.
    pub async fn apply_optimistic_like(&self, post_id: &str) -> Result<MutationOutcome, SyncError> {
        let visible = self
            .visible_item(post_id)
            .await
            .ok_or_else(|| SyncError::UnknownItem(post_id.to_string()))?;
        let base = self.server_item(post_id).await.unwrap_or_else(|| visible.clone());

        let intended = !visible.liked_by_viewer;
        let undo = LikeUndo {
            liked: base.liked_by_viewer,
            like_count: base.like_count,
        };
        let action_id = new_correlation_id();
        self.store.push_overlay(
            &action_id,
            Overlay::Like {
                item_id: post_id.to_string(),
                liked: intended,
                undo,
                applied_at: Utc::now(),
            },
        );
        self.publish().await;

        let action = OfflineAction::with_id(
            action_id.clone(),
            Some(post_id.to_string()),
            ActionPayload::Like { intended, undo },
        );
        if !self.monitor.current().is_online() {
            return self.enqueue_or_rollback(action).await;
        }

        match self.api.set_like(post_id, intended).await {
            Ok(receipt) => {
                self.confirm_like(&action_id, post_id, intended, &receipt).await;
                self.publish().await;
                Ok(MutationOutcome::Confirmed)
            }
            Err(e) if e.is_transient() => {
                tracing::info!(post_id = %post_id, error = %e, "Like failed transiently, queueing");
                self.enqueue_or_rollback(action).await
            }
            Err(e) => Err(self.reject(&action, e).await),
        }
    }

    /// Append a pending comment to `post_id`, replaced by the server's
    /// comment once confirmed.
    pub async fn apply_optimistic_comment(
        &self,
        post_id: &str,
        content: &str,
    ) -> Result<MutationOutcome, SyncError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::EmptyContent);
        }
        if self.visible_item(post_id).await.is_none() {
            return Err(SyncError::UnknownItem(post_id.to_string()));
        }

        let action_id = new_correlation_id();
        let comment = Comment {
            id: new_local_id(),
            post_id: post_id.to_string(),
            author: self.config.viewer.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
            pending: true,
        };
        self.store.push_overlay(
            &action_id,
            Overlay::Comment {
                item_id: post_id.to_string(),
                comment: comment.clone(),
            },
        );
        self.publish().await;

        let request = NewComment {
            content: comment.content.clone(),
            client_ref: comment.id.clone(),
        };
        let action = OfflineAction::with_id(
            action_id.clone(),
            Some(post_id.to_string()),
            ActionPayload::Comment { comment },
        );
        if !self.monitor.current().is_online() {
            return self.enqueue_or_rollback(action).await;
        }

        match self.api.create_comment(post_id, &request).await {
            Ok(receipt) => {
                self.confirm_comment(&action_id, post_id, receipt).await;
                self.publish().await;
                Ok(MutationOutcome::Confirmed)
            }
            Err(e) if e.is_transient() => {
                tracing::info!(post_id = %post_id, error = %e, "Comment failed transiently, queueing");
                self.enqueue_or_rollback(action).await
            }
            Err(e) => Err(self.reject(&action, e).await),
        }
    }

    /// Create a post. Online, a placeholder is shown until the server item
    /// arrives; offline, the post is only queued.
    pub async fn apply_optimistic_post_create(
        &self,
        content: &str,
        kind: PostKind,
        media: Vec<MediaRef>,
    ) -> Result<MutationOutcome, SyncError> {
        let content = content.trim();
        if content.is_empty() && media.is_empty() {
            return Err(SyncError::EmptyContent);
        }

        let action_id = new_correlation_id();
        let action = OfflineAction::with_id(
            action_id.clone(),
            None,
            ActionPayload::Post {
                body: content.to_string(),
                kind,
                media: media.clone(),
            },
        );

        if !self.monitor.current().is_online() {
            self.queue.enqueue(&action).await?;
            self.publish().await;
            return Ok(MutationOutcome::WillPublishWhenOnline { action_id });
        }

        let now = Utc::now();
        let placeholder = FeedItem {
            id: new_local_id(),
            author: self.config.viewer.clone(),
            body: content.to_string(),
            media: media.clone(),
            kind,
            created_at: now,
            updated_at: None,
            like_count: 0,
            comment_count: 0,
            share_count: 0,
            liked_by_viewer: false,
            saved_by_viewer: false,
            pinned: false,
            recent_comments: Vec::new(),
        };
        self.store
            .push_overlay(&action_id, Overlay::Placeholder { item: placeholder });
        self.publish().await;

        let request = NewPost {
            content: content.to_string(),
            kind,
            media,
            client_ref: action_id.clone(),
        };
        match self.api.create_post(&request).await {
            Ok(item) => {
                self.store.remove_overlay(&action_id);
                self.merge_incoming(vec![item], MergeSource::Mutation).await;
                Ok(MutationOutcome::Confirmed)
            }
            Err(e) if e.is_transient() => {
                tracing::info!(error = %e, "Post failed transiently, queueing");
                self.enqueue_or_rollback(action).await
            }
            Err(e) => Err(self.reject(&action, e).await),
        }
    }

    // ========================================================================
    // Offline Queue
    // ========================================================================

    /// Replay the offline queue and reconcile every settled action.
    ///
    /// If storage fails midway, the actions settled before the failure are
    /// still reconciled before the error is returned.
    pub async fn drain_offline_queue(&self) -> Result<DrainReport, SyncError> {
        let (report, failure) = match self.queue.drain(self.api.as_ref()).await {
            Ok(report) => (report, None),
            Err(DrainError { report, source }) => (report, Some(source)),
        };
        for settled in &report.settled {
            self.reconcile(settled).await;
        }
        if let Some(e) = failure {
            self.enter_degraded(&e);
            self.publish().await;
            return Err(SyncError::Storage(e));
        }
        self.publish().await;
        Ok(report)
    }

    /// Drain on every transition to online and every `drain_interval` while
    /// online, until `cancel` fires. Quality changes are republished.
    pub fn spawn_auto_drain(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut quality_rx = self.monitor.subscribe();

        tokio::spawn(async move {
            let mut was_online = quality_rx.borrow_and_update().is_online();
            let mut ticker = tokio::time::interval(this.config.drain_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                let drain = tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = quality_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = quality_rx.borrow_and_update().is_online();
                        let came_online = online && !was_online;
                        was_online = online;
                        this.publish().await;
                        came_online
                    }
                    _ = ticker.tick() => was_online,
                };

                if drain {
                    if let Err(e) = this.drain_offline_queue().await {
                        tracing::warn!(error = %e, "Offline queue drain failed");
                    }
                }
            }
            tracing::debug!("Auto drain stopped");
        })
    }

    /// Rebuild optimistic overlays from the durable queue after a restart.
    async fn restore_pending(&self) {
        match self.store.reset_in_flight_actions().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "Reset interrupted actions to pending"),
            Err(e) => {
                self.enter_degraded(&e);
                return;
            }
        }

        let actions = match self.store.pending_actions().await {
            Ok(actions) => actions,
            Err(e) => {
                self.enter_degraded(&e);
                return;
            }
        };

        let mut restored = 0;
        for action in actions {
            let Some(target) = action.target_id.clone() else {
                continue;
            };
            let overlay = match action.payload {
                ActionPayload::Like { intended, undo } => Overlay::Like {
                    item_id: target,
                    liked: intended,
                    undo,
                    applied_at: action.enqueued_at,
                },
                ActionPayload::Comment { comment } => Overlay::Comment {
                    item_id: target,
                    comment,
                },
                ActionPayload::Post { .. } => continue,
            };
            self.store.push_overlay(&action.id, overlay);
            restored += 1;
        }
        if restored > 0 {
            tracing::info!(count = restored, "Restored pending optimistic changes");
        }
    }

    async fn reconcile(&self, settled: &SettledAction) {
        let action = &settled.action;
        let target = match (&action.target_id, &action.payload) {
            (Some(target), _) => target.as_str(),
            (None, ActionPayload::Post { .. }) => "",
            (None, _) => {
                tracing::warn!(action_id = %action.id, kind = action.kind.as_str(), "Settled action has no target, skipping");
                self.store.remove_overlay(&action.id);
                if let Resolution::Discarded { error } = &settled.resolution {
                    self.notify_failure(action, error.clone());
                }
                return;
            }
        };

        match (&settled.resolution, &action.payload) {
            (Resolution::Confirmed(ActionReceipt::Like(receipt)), ActionPayload::Like { intended, .. }) => {
                self.confirm_like(&action.id, target, *intended, receipt).await;
            }
            (Resolution::Confirmed(ActionReceipt::Comment(receipt)), _) => {
                self.confirm_comment(&action.id, target, receipt.clone()).await;
            }
            (Resolution::Confirmed(ActionReceipt::Post(item)), _) => {
                self.store.remove_overlay(&action.id);
                self.merge_incoming(vec![item.clone()], MergeSource::Mutation).await;
            }
            (Resolution::Confirmed(_), _) => {
                self.store.remove_overlay(&action.id);
            }
            (Resolution::RetryScheduled { .. }, _) => {}
            (Resolution::Discarded { error }, _) => {
                self.rollback(&action.id).await;
                self.notify_failure(action, error.clone());
            }
        }
    }

    async fn enqueue_or_rollback(&self, action: OfflineAction) -> Result<MutationOutcome, SyncError> {
        match self.queue.enqueue(&action).await {
            Ok(()) => {
                self.publish().await;
                Ok(MutationOutcome::Queued {
                    action_id: action.id,
                })
            }
            Err(e) => {
                self.enter_degraded(&e);
                self.rollback(&action.id).await;
                self.publish().await;
                Err(SyncError::Storage(e))
            }
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    async fn confirm_like(&self, action_id: &str, post_id: &str, intended: bool, receipt: &LikeReceipt) {
        // The flag stays as intended unless the server explicitly disagrees
        let liked = receipt.liked.unwrap_or(intended);
        let applied_at = match self.store.overlay(action_id) {
            Some(Overlay::Like { applied_at, .. }) => applied_at,
            _ => Utc::now(),
        };
        // Later toggles on the same post stay as overlays and are derived
        // from the confirmed state on the next read
        let confirmed_at = receipt.updated_at.unwrap_or(applied_at);

        self.update_memory(post_id, |item| {
            item.liked_by_viewer = liked;
            item.like_count = receipt.like_count;
            bump(item, confirmed_at);
        });
        if !self.state().degraded {
            if let Err(e) = self
                .store
                .apply_server_like(post_id, liked, receipt.like_count, confirmed_at)
                .await
            {
                self.enter_degraded(&e);
            }
        }
        self.store.remove_overlay(action_id);
    }

    async fn confirm_comment(&self, action_id: &str, post_id: &str, receipt: CommentReceipt) {
        let confirmed_at = Utc::now();
        let comment = Comment {
            pending: false,
            ..receipt.comment
        };

        self.update_memory(post_id, |item| {
            if !item.recent_comments.iter().any(|c| c.id == comment.id) {
                item.recent_comments.push(comment.clone());
                item.comment_count += 1;
            }
            if let Some(count) = receipt.comment_count {
                item.comment_count = count;
            }
            bump(item, confirmed_at);
        });
        if !self.state().degraded {
            if let Err(e) = self
                .store
                .apply_server_comment(post_id, comment, receipt.comment_count, confirmed_at)
                .await
            {
                self.enter_degraded(&e);
            }
        }
        // Drop the pending copy only once the server copy is in place
        self.store.remove_overlay(action_id);
    }

    /// Undo an optimistic change. Likes get their captured pre-toggle
    /// values written back; comments and placeholders just disappear.
    async fn rollback(&self, action_id: &str) {
        let Some(overlay) = self.store.remove_overlay(action_id) else {
            return;
        };
        if let Overlay::Like { item_id, undo, .. } = overlay {
            self.update_memory(&item_id, |item| {
                item.liked_by_viewer = undo.liked;
                item.like_count = undo.like_count;
            });
            if !self.state().degraded {
                if let Err(e) = self.store.restore_like_fields(&item_id, undo).await {
                    self.enter_degraded(&e);
                }
            }
        }
        tracing::info!(action_id = %action_id, "Optimistic change rolled back");
    }

    async fn reject(&self, action: &OfflineAction, error: ApiError) -> SyncError {
        tracing::warn!(action_id = %action.id, kind = action.kind.as_str(), error = %error, "Mutation rejected");
        self.rollback(&action.id).await;
        self.publish().await;
        self.notify_failure(action, error.to_string());
        SyncError::Rejected(error)
    }

    fn notify_failure(&self, action: &OfflineAction, reason: String) {
        let _ = self.notices.send(SyncNotice::MutationFailed {
            correlation_id: action.id.clone(),
            kind: action.kind,
            target_id: action.target_id.clone(),
            reason,
        });
    }

    // ========================================================================
    // Realtime
    // ========================================================================

    /// Feed push events into the merge; a reconnect (or a lagging receiver)
    /// triggers a gap-filling refresh. The task ends with the bridge.
    pub fn attach_realtime(self: &Arc<Self>, bridge: &RealtimeBridge) -> JoinHandle<()> {
        self.follow_events(bridge.subscribe())
    }

    fn follow_events(self: &Arc<Self>, mut events: broadcast::Receiver<PushEvent>) -> JoinHandle<()> {
        let this = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PushEvent::Upsert(item)) => {
                        this.merge_incoming(vec![item], MergeSource::Push).await;
                    }
                    Ok(PushEvent::Reconnected) => this.spawn_gap_refresh(),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed = missed, "Push events dropped, refreshing");
                        this.spawn_gap_refresh();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_gap_refresh(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.refresh().await {
                tracing::warn!(error = %e, "Gap-filling refresh failed");
            }
        });
    }

    // ========================================================================
    // Rendering Window
    // ========================================================================

    /// Record which items are on screen (protecting them from eviction) and
    /// prefetch media around them.
    pub fn set_rendered(&self, visible: Range<usize>) -> PrefetchBatch {
        let view = self.view();
        let start = visible.start.min(view.items.len());
        let end = visible.end.clamp(start, view.items.len());
        self.store
            .set_rendered(view.items[start..end].iter().map(|i| i.id.clone()));
        self.prefetch.schedule_window(start..end, &view.items)
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    async fn publish(&self) {
        let _publish = self.publish_lock.lock().await;
        let (floor, degraded) = {
            let state = self.state();
            (state.floor.clone(), state.degraded)
        };

        let mut items = None;
        if !degraded {
            match self.store.read_window(floor.as_ref()).await {
                Ok(snapshot) => items = Some(snapshot.ordered()),
                Err(e) => self.enter_degraded(&e),
            }
        }
        let items = match items {
            Some(items) => items,
            None => self.memory_view(floor.as_ref()),
        };
        let pending = self.queue.pending_count().await.ok();
        let quality = self.monitor.current();

        let mut state = self.state();
        if !state.degraded {
            let visible: HashSet<&str> = items.iter().map(|i| i.id.as_str()).collect();
            state.memory.retain(|id, _| visible.contains(id.as_str()));
        }
        self.view_tx.send_modify(|view| {
            view.items = items;
            view.has_more = state.has_more;
            view.is_refreshing = state.refreshing;
            view.is_loading_more = state.loading_more;
            if let Some(pending) = pending {
                view.pending_actions = pending;
            }
            view.quality = quality;
            view.degraded = state.degraded;
            view.last_synced_at = state.last_synced_at;
        });
    }

    fn memory_view(&self, floor: Option<&OrderKey>) -> Vec<FeedItem> {
        let items: Vec<FeedItem> = self
            .state()
            .memory
            .values()
            .filter(|item| floor.map_or(true, |f| item.order_key() <= *f))
            .cloned()
            .collect();
        let mut items = self.store.apply_overlays(items);
        sort_feed(&mut items);
        items
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn visible_item(&self, id: &str) -> Option<FeedItem> {
        let shown = self.view_tx.borrow().get(id).cloned();
        if shown.is_some() {
            return shown;
        }
        let item = self.server_item(id).await?;
        self.store.apply_overlays([item]).into_iter().find(|i| i.id == id)
    }

    /// Server state of an item, without overlays.
    async fn server_item(&self, id: &str) -> Option<FeedItem> {
        if !self.state().degraded {
            match self.store.get_item(id).await {
                Ok(Some(item)) => return Some(item),
                Ok(None) => {}
                Err(e) => self.enter_degraded(&e),
            }
        }
        self.state().memory.get(id).cloned()
    }

    fn update_memory(&self, id: &str, f: impl FnOnce(&mut FeedItem)) {
        if let Some(item) = self.state().memory.get_mut(id) {
            f(item);
        }
    }

    async fn record_synced(&self, at: DateTime<Utc>) {
        self.state().last_synced_at = Some(at);
        if !self.state().degraded {
            if let Err(e) = self.store.mark_synced(at).await {
                self.enter_degraded(&e);
            }
        }
    }

    fn enter_degraded(&self, error: &StorageError) {
        let first = {
            let mut state = self.state();
            let first = !state.degraded;
            state.degraded = true;
            first
        };
        if first {
            tracing::warn!(error = %error, "Cache store failed, continuing from memory");
            let _ = self.notices.send(SyncNotice::Degraded {
                reason: error.to_string(),
            });
        }
    }
}

fn bump(item: &mut FeedItem, at: DateTime<Utc>) {
    if at > item.freshness() {
        item.updated_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreLimits;
    use crate::test_support::{item, rejected, transient, ts, MockApi};
    use pretty_assertions::assert_eq;

    fn first_page() -> Vec<FeedItem> {
        (0..15)
            .map(|i| {
                let mut it = item(&format!("p{i}"), 100 - i, None);
                it.like_count = 4;
                it
            })
            .collect()
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::ZERO,
            },
            ..SyncConfig::default()
        }
    }

    async fn controller(api: MockApi, online: bool) -> Arc<FeedSyncController<MockApi>> {
        let store = CacheStore::open_in_memory(StoreLimits::default()).await.unwrap();
        let monitor = NetworkMonitor::new(online);
        Arc::new(FeedSyncController::new(store, Arc::new(api), monitor, test_config()))
    }

    /// Initial load with the background refresh awaited.
    async fn loaded(api: MockApi) -> Arc<FeedSyncController<MockApi>> {
        let ctrl = controller(api, true).await;
        let load = ctrl.initial_load().await;
        load.refresh.unwrap().await.unwrap().unwrap();
        ctrl
    }

    fn ids(view: &FeedView) -> Vec<String> {
        view.items.iter().map(|i| i.id.clone()).collect()
    }

    #[tokio::test]
    async fn test_initial_load_from_empty_cache() {
        let ctrl = controller(MockApi::default().with_page(1, first_page()), true).await;

        let load = ctrl.initial_load().await;
        assert!(load.view.is_empty());
        let received = load.refresh.unwrap().await.unwrap().unwrap();
        assert_eq!(received, 15);

        let view = ctrl.view();
        let expected: Vec<String> = (0..15).map(|i| format!("p{i}")).collect();
        assert_eq!(ids(&view), expected);
        assert!(view.has_more);
        assert!(!view.is_refreshing);
        assert!(view.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_initial_load_offline_serves_cache_without_fetch() {
        let ctrl = controller(MockApi::default().with_page(1, first_page()), false).await;
        ctrl.store.write_items(first_page()[..3].to_vec()).await.unwrap();

        let load = ctrl.initial_load().await;
        assert!(load.refresh.is_none());
        assert_eq!(ids(&load.view), vec!["p0", "p1", "p2"]);
        assert!(ctrl.api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_offline_like_reconciles_after_drain() {
        let api = MockApi::default().with_page(1, first_page());
        api.set_server_likes("p3", 9);
        let ctrl = loaded(api).await;

        ctrl.monitor.set_connectivity(false);
        let outcome = ctrl.apply_optimistic_like("p3").await.unwrap();
        assert!(matches!(outcome, MutationOutcome::Queued { .. }));

        let view = ctrl.view();
        let p3 = view.get("p3").unwrap();
        assert!(p3.liked_by_viewer);
        assert_eq!(p3.like_count, 5);
        assert_eq!(view.pending_actions, 1);
        assert_eq!(
            view.offline_banner().as_deref(),
            Some("You are offline, 1 action pending")
        );

        ctrl.monitor.set_connectivity(true);
        let report = ctrl.drain_offline_queue().await.unwrap();
        assert_eq!(report.settled.len(), 1);

        let view = ctrl.view();
        let p3 = view.get("p3").unwrap();
        assert!(p3.liked_by_viewer);
        assert_eq!(p3.like_count, 10);
        assert_eq!(view.pending_actions, 0);
        assert_eq!(ctrl.store.overlay_count(), 0);
        assert!(ctrl.api.calls().contains(&"like:p3:true".to_string()));
    }

    #[tokio::test]
    async fn test_auto_drain_runs_when_connectivity_returns() {
        let api = MockApi::default().with_page(1, first_page());
        api.set_server_likes("p1", 7);
        let ctrl = loaded(api).await;

        ctrl.monitor.set_connectivity(false);
        ctrl.apply_optimistic_like("p1").await.unwrap();
        assert_eq!(ctrl.view().pending_actions, 1);

        let cancel = CancellationToken::new();
        let drainer = ctrl.spawn_auto_drain(cancel.clone());
        let mut views = ctrl.subscribe();
        ctrl.monitor.set_connectivity(true);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if views.borrow_and_update().pending_actions == 0 {
                    break;
                }
                views.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(ctrl.view().get("p1").unwrap().like_count, 8);
        cancel.cancel();
        drainer.await.unwrap();
    }

    #[tokio::test]
    async fn test_online_like_confirms_immediately() {
        let api = MockApi::default().with_page(1, first_page());
        api.set_server_likes("p0", 4);
        let ctrl = loaded(api).await;

        let outcome = ctrl.apply_optimistic_like("p0").await.unwrap();
        assert_eq!(outcome, MutationOutcome::Confirmed);
        let p0 = ctrl.view().get("p0").cloned().unwrap();
        assert!(p0.liked_by_viewer);
        assert_eq!(p0.like_count, 5);

        // Toggling back goes through the same path
        ctrl.apply_optimistic_like("p0").await.unwrap();
        let p0 = ctrl.view().get("p0").cloned().unwrap();
        assert!(!p0.liked_by_viewer);
        assert_eq!(p0.like_count, 4);
    }

    #[tokio::test]
    async fn test_rejected_like_rolls_back_and_notifies() {
        let ctrl = loaded(MockApi::default().with_page(1, first_page())).await;
        let mut notices = ctrl.subscribe_notices();

        ctrl.api.fail_next(rejected());
        let result = ctrl.apply_optimistic_like("p1").await;
        assert!(matches!(result, Err(SyncError::Rejected(_))));

        let p1 = ctrl.view().get("p1").cloned().unwrap();
        assert!(!p1.liked_by_viewer);
        assert_eq!(p1.like_count, 4);
        assert_eq!(ctrl.queue.pending_count().await.unwrap(), 0);

        match notices.try_recv().unwrap() {
            SyncNotice::MutationFailed { kind, target_id, .. } => {
                assert_eq!(kind, crate::model::ActionKind::LikeToggle);
                assert_eq!(target_id.as_deref(), Some("p1"));
            }
            other => panic!("unexpected notice {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rollback_restores_exact_like_state_despite_concurrent_push() {
        let ctrl = loaded(MockApi::default().with_page(1, first_page())).await;

        ctrl.monitor.set_connectivity(false);
        ctrl.apply_optimistic_like("p2").await.unwrap();

        // Someone else comments on p2 while the like is pending; the server
        // copy is newer than the local toggle
        let mut pushed = first_page()[2].clone();
        pushed.comment_count = 7;
        pushed.updated_at = Some(Utc::now() + chrono::Duration::seconds(5));
        ctrl.merge_incoming(vec![pushed], MergeSource::Push).await;
        let p2 = ctrl.view().get("p2").cloned().unwrap();
        assert_eq!((p2.liked_by_viewer, p2.like_count, p2.comment_count), (true, 5, 7));

        ctrl.monitor.set_connectivity(true);
        ctrl.api.fail_next(rejected());
        ctrl.drain_offline_queue().await.unwrap();

        let p2 = ctrl.view().get("p2").cloned().unwrap();
        assert_eq!((p2.liked_by_viewer, p2.like_count, p2.comment_count), (false, 4, 7));
        assert_eq!(ctrl.store.overlay_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_like_survives_newer_push() {
        let ctrl = loaded(MockApi::default().with_page(1, first_page())).await;

        ctrl.monitor.set_connectivity(false);
        ctrl.apply_optimistic_like("p2").await.unwrap();

        let mut pushed = first_page()[2].clone();
        pushed.comment_count = 7;
        pushed.updated_at = Some(Utc::now() + chrono::Duration::seconds(5));
        ctrl.merge_incoming(vec![pushed.clone()], MergeSource::Push).await;

        let view = ctrl.view();
        let p2 = view.get("p2").unwrap();
        assert_eq!((p2.liked_by_viewer, p2.like_count, p2.comment_count), (true, 5, 7));
        assert_eq!(view.pending_actions, 1);

        // A newer server copy that already counts the like is not bumped again
        pushed.liked_by_viewer = true;
        pushed.like_count = 5;
        pushed.updated_at = Some(Utc::now() + chrono::Duration::seconds(10));
        ctrl.merge_incoming(vec![pushed], MergeSource::Push).await;
        let p2 = ctrl.view().get("p2").cloned().unwrap();
        assert_eq!((p2.liked_by_viewer, p2.like_count), (true, 5));
    }

    #[tokio::test]
    async fn test_rejected_first_toggle_keeps_later_toggle_exact() {
        let store = CacheStore::open_in_memory(StoreLimits::default()).await.unwrap();
        let config = SyncConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_secs(60),
            },
            ..SyncConfig::default()
        };
        let api = MockApi::default().with_page(1, first_page());
        let ctrl = Arc::new(FeedSyncController::new(
            store,
            Arc::new(api),
            NetworkMonitor::new(true),
            config,
        ));
        ctrl.initial_load().await.refresh.unwrap().await.unwrap().unwrap();

        ctrl.monitor.set_connectivity(false);
        ctrl.apply_optimistic_like("p1").await.unwrap();
        ctrl.apply_optimistic_like("p1").await.unwrap();
        let p1 = ctrl.view().get("p1").cloned().unwrap();
        assert_eq!((p1.liked_by_viewer, p1.like_count), (false, 4));

        ctrl.monitor.set_connectivity(true);
        ctrl.api.fail_next(rejected());
        ctrl.api.fail_next(transient());
        ctrl.drain_offline_queue().await.unwrap();

        let view = ctrl.view();
        let p1 = view.get("p1").unwrap();
        assert_eq!((p1.liked_by_viewer, p1.like_count), (false, 4));
        assert_eq!(view.pending_actions, 1);
        assert_eq!(ctrl.api.calls().iter().filter(|c| c.starts_with("like:p1")).count(), 2);
    }

    #[tokio::test]
    async fn test_transient_like_failure_is_queued() {
        let ctrl = loaded(MockApi::default().with_page(1, first_page())).await;

        ctrl.api.fail_next(transient());
        let outcome = ctrl.apply_optimistic_like("p4").await.unwrap();
        assert!(matches!(outcome, MutationOutcome::Queued { .. }));

        let view = ctrl.view();
        assert!(view.get("p4").unwrap().liked_by_viewer);
        assert_eq!(view.pending_actions, 1);
    }

    #[tokio::test]
    async fn test_like_unknown_item() {
        let ctrl = loaded(MockApi::default().with_page(1, first_page())).await;
        let result = ctrl.apply_optimistic_like("nope").await;
        assert!(matches!(result, Err(SyncError::UnknownItem(id)) if id == "nope"));
    }

    #[tokio::test]
    async fn test_comment_online_replaces_pending_copy() {
        let ctrl = loaded(MockApi::default().with_page(1, first_page())).await;

        let outcome = ctrl.apply_optimistic_comment("p1", "  nice  ").await.unwrap();
        assert_eq!(outcome, MutationOutcome::Confirmed);

        let p1 = ctrl.view().get("p1").cloned().unwrap();
        assert_eq!(p1.comment_count, 1);
        assert_eq!(p1.recent_comments.len(), 1);
        assert_eq!(p1.recent_comments[0].id, "srv-comment-0");
        assert_eq!(p1.recent_comments[0].content, "nice");
        assert!(!p1.recent_comments[0].pending);
        assert_eq!(ctrl.store.overlay_count(), 0);
    }

    #[tokio::test]
    async fn test_comment_offline_shows_pending() {
        let ctrl = loaded(MockApi::default().with_page(1, first_page())).await;
        ctrl.monitor.set_connectivity(false);

        ctrl.apply_optimistic_comment("p1", "later").await.unwrap();
        let p1 = ctrl.view().get("p1").cloned().unwrap();
        assert_eq!(p1.comment_count, 1);
        assert!(p1.recent_comments[0].pending);
        assert!(p1.recent_comments[0].id.starts_with(crate::model::LOCAL_ID_PREFIX));

        ctrl.monitor.set_connectivity(true);
        ctrl.drain_offline_queue().await.unwrap();
        let p1 = ctrl.view().get("p1").cloned().unwrap();
        assert_eq!(p1.comment_count, 1);
        assert_eq!(p1.recent_comments[0].id, "srv-comment-0");
    }

    #[tokio::test]
    async fn test_comment_validation() {
        let ctrl = loaded(MockApi::default().with_page(1, first_page())).await;
        assert!(matches!(
            ctrl.apply_optimistic_comment("p1", "   ").await,
            Err(SyncError::EmptyContent)
        ));
        assert!(matches!(
            ctrl.apply_optimistic_comment("ghost", "hi").await,
            Err(SyncError::UnknownItem(_))
        ));
    }

    #[tokio::test]
    async fn test_post_online_and_offline() {
        let ctrl = loaded(MockApi::default().with_page(1, first_page())).await;

        let outcome = ctrl
            .apply_optimistic_post_create("hello", PostKind::Tip, vec![])
            .await
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Confirmed);
        let view = ctrl.view();
        assert_eq!(view.items[0].id, "srv-post-0");
        assert_eq!(view.items[0].kind, PostKind::Tip);
        assert_eq!(view.len(), 16);

        ctrl.monitor.set_connectivity(false);
        let outcome = ctrl
            .apply_optimistic_post_create("from the train", PostKind::General, vec![])
            .await
            .unwrap();
        assert!(matches!(outcome, MutationOutcome::WillPublishWhenOnline { .. }));
        assert_eq!(ctrl.view().len(), 16);

        ctrl.monitor.set_connectivity(true);
        ctrl.drain_offline_queue().await.unwrap();
        let view = ctrl.view();
        assert_eq!(view.len(), 17);
        assert_eq!(view.items[0].body, "from the train");
    }

    #[tokio::test]
    async fn test_rejected_post_removes_placeholder() {
        let ctrl = loaded(MockApi::default().with_page(1, first_page())).await;
        ctrl.api.fail_next(rejected());

        let result = ctrl
            .apply_optimistic_post_create("spam", PostKind::General, vec![])
            .await;
        assert!(matches!(result, Err(SyncError::Rejected(_))));
        assert_eq!(ctrl.view().len(), 15);
        assert_eq!(ctrl.store.overlay_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_refresh_and_overlapping_pages_never_duplicate() {
        let mut second: Vec<FeedItem> = (15..30).map(|i| item(&format!("p{i}"), 100 - i, None)).collect();
        // The server shifted by one: p14 shows up again on page 2
        second[0] = first_page()[14].clone();
        let ctrl = loaded(
            MockApi::default()
                .with_page(1, first_page())
                .with_page(2, second),
        )
        .await;

        ctrl.refresh().await.unwrap();
        assert_eq!(ctrl.view().len(), 15);

        ctrl.load_more().await.unwrap();
        let view = ctrl.view();
        let mut unique = ids(&view);
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), view.len());
        assert_eq!(view.len(), 29);
        assert!(view.has_more);
    }

    #[tokio::test]
    async fn test_short_page_ends_feed() {
        let ctrl = loaded(
            MockApi::default()
                .with_page(1, first_page())
                .with_page(2, vec![item("p40", 10, None)]),
        )
        .await;

        assert_eq!(ctrl.load_more().await.unwrap(), 1);
        assert!(!ctrl.view().has_more);

        // No further fetch once the end is known
        assert_eq!(ctrl.load_more().await.unwrap(), 0);
        assert_eq!(ctrl.api.calls().iter().filter(|c| *c == "page:2").count(), 1);
    }

    #[tokio::test]
    async fn test_client_error_on_load_more_ends_feed_quietly() {
        let api = MockApi::default().with_page(1, first_page());
        api.set_page_status(2, 404);
        let ctrl = loaded(api).await;

        assert_eq!(ctrl.load_more().await.unwrap(), 0);
        let view = ctrl.view();
        assert!(!view.has_more);
        assert!(!view.is_loading_more);
    }

    #[tokio::test]
    async fn test_server_error_on_load_more_keeps_paging() {
        let api = MockApi::default().with_page(1, first_page());
        api.set_page_status(2, 500);
        let ctrl = loaded(api).await;

        assert!(matches!(ctrl.load_more().await, Err(SyncError::Api(_))));
        assert!(ctrl.view().has_more);
    }

    async fn push_during_load_more(page_updated: i64, push_updated: i64) -> FeedItem {
        let api = MockApi::default()
            .with_page(1, first_page())
            .with_page(2, vec![item("p20", 50, Some(page_updated))]);
        let ctrl = loaded(api).await;
        ctrl.api.set_page_delay(Duration::from_millis(50));

        let pending = {
            let ctrl = Arc::clone(&ctrl);
            tokio::spawn(async move { ctrl.load_more().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctrl.merge_incoming(vec![item("p20", 50, Some(push_updated))], MergeSource::Push)
            .await;
        pending.await.unwrap().unwrap();

        ctrl.view().get("p20").cloned().unwrap()
    }

    #[tokio::test]
    async fn test_push_during_load_more_newer_push_wins() {
        let p20 = push_during_load_more(60, 80).await;
        assert_eq!(p20.updated_at, Some(ts(80)));
    }

    #[tokio::test]
    async fn test_push_during_load_more_newer_page_wins() {
        let p20 = push_during_load_more(60, 40).await;
        assert_eq!(p20.updated_at, Some(ts(60)));
    }

    #[tokio::test]
    async fn test_storage_failure_degrades_to_memory() {
        let ctrl = loaded(MockApi::default().with_page(1, first_page())).await;
        let mut notices = ctrl.subscribe_notices();

        ctrl.store.pool.close().await;
        ctrl.merge_incoming(vec![item("fresh", 200, None)], MergeSource::Push)
            .await;

        let view = ctrl.view();
        assert!(view.degraded);
        assert_eq!(view.len(), 16);
        assert_eq!(view.items[0].id, "fresh");
        assert!(matches!(notices.try_recv().unwrap(), SyncNotice::Degraded { .. }));

        // Optimistic likes keep working from memory
        ctrl.apply_optimistic_like("p0").await.unwrap();
        assert!(ctrl.view().get("p0").unwrap().liked_by_viewer);
    }

    #[tokio::test]
    async fn test_storage_failure_mid_drain_still_reconciles_confirmed() {
        let api = MockApi::default().with_page(1, first_page());
        api.set_server_likes("p0", 6);
        let ctrl = loaded(api).await;

        ctrl.monitor.set_connectivity(false);
        ctrl.apply_optimistic_like("p0").await.unwrap();
        ctrl.apply_optimistic_like("p1").await.unwrap();
        assert_eq!(ctrl.store.overlay_count(), 2);

        ctrl.api.close_store_after_next_like(ctrl.store.clone());
        ctrl.monitor.set_connectivity(true);
        let result = ctrl.drain_offline_queue().await;
        assert!(matches!(result, Err(SyncError::Storage(_))));

        // p0 was confirmed before the failure; its overlay is gone and the
        // server count shows through the in-memory view
        let view = ctrl.view();
        assert!(view.degraded);
        assert_eq!(ctrl.store.overlay_count(), 1);
        let p0 = view.get("p0").unwrap();
        assert_eq!((p0.liked_by_viewer, p0.like_count), (true, 7));
        // p1 never left the queue, so its optimistic like stays
        assert!(view.get("p1").unwrap().liked_by_viewer);
        assert_eq!(ctrl.api.calls().iter().filter(|c| c.starts_with("like:")).count(), 1);
    }

    #[tokio::test]
    async fn test_targetless_like_is_discarded_without_touching_items() {
        let ctrl = loaded(MockApi::default().with_page(1, first_page())).await;
        let mut notices = ctrl.subscribe_notices();
        let before = ctrl.view().items;

        ctrl.queue
            .enqueue(&OfflineAction::new(
                None,
                ActionPayload::Like {
                    intended: true,
                    undo: LikeUndo {
                        liked: false,
                        like_count: 0,
                    },
                },
            ))
            .await
            .unwrap();
        let report = ctrl.drain_offline_queue().await.unwrap();

        assert_eq!(report.settled.len(), 1);
        assert!(ctrl.api.calls().iter().all(|c| !c.starts_with("like:")));
        assert!(matches!(
            notices.try_recv().unwrap(),
            SyncNotice::MutationFailed { target_id: None, .. }
        ));
        assert_eq!(ctrl.view().items, before);
        assert_eq!(ctrl.view().pending_actions, 0);
    }

    #[tokio::test]
    async fn test_pending_actions_restored_after_restart() {
        let ctrl = loaded(MockApi::default().with_page(1, first_page())).await;
        ctrl.monitor.set_connectivity(false);
        ctrl.apply_optimistic_like("p5").await.unwrap();

        // Same database, fresh process state
        let store = ctrl.store.clone();
        store.remove_overlay(&store.pending_actions().await.unwrap()[0].id);
        let restarted = Arc::new(FeedSyncController::new(
            store,
            Arc::new(MockApi::default()),
            NetworkMonitor::new(false),
            test_config(),
        ));
        let load = restarted.initial_load().await;

        let p5 = load.view.get("p5").cloned().unwrap();
        assert!(p5.liked_by_viewer);
        assert_eq!(p5.like_count, 5);
        assert_eq!(load.view.pending_actions, 1);
    }

    #[tokio::test]
    async fn test_push_events_merge_and_reconnect_refreshes() {
        let ctrl = loaded(MockApi::default().with_page(1, first_page())).await;
        let (tx, rx) = broadcast::channel(8);
        let task = ctrl.follow_events(rx);

        tx.send(PushEvent::Upsert(item("live", 300, None))).unwrap();
        tx.send(PushEvent::Reconnected).unwrap();
        drop(tx);
        task.await.unwrap();

        // The gap-filling refresh runs detached
        let refreshed = tokio::time::timeout(Duration::from_secs(2), async {
            while ctrl.api.calls().iter().filter(|c| *c == "page:1").count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(refreshed.is_ok());
        assert_eq!(ctrl.view().items[0].id, "live");
    }

    #[tokio::test]
    async fn test_set_rendered_prefetches_window_media() {
        let mut page = first_page();
        page[0].media.push(crate::model::MediaRef {
            url: "https://cdn.example.com/p0.jpg".into(),
            kind: crate::model::MediaKind::Image,
            thumbnail_url: None,
        });
        let api = MockApi::default().with_page(1, page);
        api.set_media("https://cdn.example.com/p0.jpg", vec![1, 2, 3]);
        let ctrl = loaded(api).await;

        // Window starts after p0, so p0 falls in the backward lookahead on a
        // fast link and is skipped on a slow one
        ctrl.monitor.record_probe(Some(Duration::from_millis(10)), Duration::from_millis(400));
        let batch = ctrl.set_rendered(1..3);
        assert_eq!(batch.scheduled, vec!["https://cdn.example.com/p0.jpg".to_string()]);
        batch.join().await;
        assert!(ctrl.store.has_media("https://cdn.example.com/p0.jpg").await.unwrap());
    }
}
