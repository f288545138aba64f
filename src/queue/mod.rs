//! Durable FIFO of mutations waiting for server confirmation.
//!
//! Actions are persisted in the cache store on `enqueue` and replayed one at
//! a time by `drain`, strictly in enqueue order. Each attempt ends in one of
//! three resolutions:
//!
//! - **Confirmed**: the server accepted it; the row is removed
//! - **RetryScheduled**: transient failure; the row moves to the tail with
//!   exponential backoff
//! - **Discarded**: definitive rejection or retries exhausted; the row is
//!   removed and the action surfaced to the user

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::api::{ApiError, CommentReceipt, FeedApi, LikeReceipt, NewComment, NewPost};
use crate::model::{ActionPayload, FeedItem, OfflineAction};
use crate::network::NetworkMonitor;
use crate::storage::{ActionOutcome, CacheStore, StorageError};

const SETTLED_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts before a transiently failing action is discarded
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempts + 1`: `base * 2^(attempts - 1)`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(2u32.pow(exp))
    }
}

/// Server answer to a replayed action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionReceipt {
    Like(LikeReceipt),
    Comment(CommentReceipt),
    Post(FeedItem),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Confirmed(ActionReceipt),
    RetryScheduled {
        attempts: u32,
        next_attempt_at: chrono::DateTime<Utc>,
        error: String,
    },
    Discarded {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettledAction {
    pub action: OfflineAction,
    pub resolution: Resolution,
}

impl SettledAction {
    /// True once the action has left the queue for good.
    pub fn is_final(&self) -> bool {
        !matches!(self.resolution, Resolution::RetryScheduled { .. })
    }
}

#[derive(Debug, Default)]
pub struct DrainReport {
    /// Every attempt made during the drain, in execution order
    pub settled: Vec<SettledAction>,
    /// The drain stopped because the monitor reported offline
    pub halted_offline: bool,
}

/// A drain cut short by a storage failure. `report` holds every attempt
/// made before the failure; those actions still need reconciling.
#[derive(Debug, Error)]
#[error("Offline queue drain interrupted after {} action(s): {source}", .report.settled.len())]
pub struct DrainError {
    pub report: DrainReport,
    #[source]
    pub source: StorageError,
}

/// The offline action queue. Clones share the drain lock and the settlement
/// channel.
#[derive(Clone)]
pub struct OfflineActionQueue {
    store: CacheStore,
    monitor: NetworkMonitor,
    policy: RetryPolicy,
    settled_tx: broadcast::Sender<SettledAction>,
    drain_lock: Arc<Mutex<()>>,
}

impl OfflineActionQueue {
    pub fn new(store: CacheStore, monitor: NetworkMonitor, policy: RetryPolicy) -> Self {
        let (settled_tx, _) = broadcast::channel(SETTLED_CHANNEL_CAPACITY);
        Self {
            store,
            monitor,
            policy,
            settled_tx,
            drain_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Persist an action. It is durable once this returns.
    pub async fn enqueue(&self, action: &OfflineAction) -> Result<(), StorageError> {
        self.store.enqueue_action(action).await?;
        tracing::info!(
            action_id = %action.id,
            kind = action.kind.as_str(),
            target = action.target_id.as_deref().unwrap_or("-"),
            "Action queued"
        );
        Ok(())
    }

    /// Receiver for final settlements (confirmed or discarded). Dropping it
    /// unsubscribes.
    pub fn subscribe_settled(&self) -> broadcast::Receiver<SettledAction> {
        self.settled_tx.subscribe()
    }

    pub async fn pending_count(&self) -> Result<usize, StorageError> {
        Ok(self.store.pending_action_count().await? as usize)
    }

    /// Replay every due action in FIFO order, one at a time.
    ///
    /// Concurrent calls are serialized. The drain stops before claiming the
    /// next action if the network goes offline; actions still waiting out a
    /// backoff are left for a later drain.
    ///
    /// A storage failure ends the drain with a [`DrainError`] that still
    /// carries the attempts made so far.
    pub async fn drain<A: FeedApi>(&self, api: &A) -> Result<DrainReport, DrainError> {
        let _guard = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        loop {
            if !self.monitor.current().is_online() {
                report.halted_offline = true;
                break;
            }

            let action = match self.store.dequeue_next_action(Utc::now()).await {
                Ok(Some(action)) => action,
                Ok(None) => break,
                Err(source) => return Err(DrainError { report, source }),
            };

            let resolution = match execute(api, &action).await {
                Ok(receipt) => Resolution::Confirmed(receipt),
                Err(e) => self.classify_failure(&action, e),
            };

            let outcome = match &resolution {
                Resolution::Confirmed(_) => ActionOutcome::Succeeded,
                Resolution::RetryScheduled {
                    attempts,
                    next_attempt_at,
                    error,
                } => ActionOutcome::RetryLater {
                    attempts: *attempts,
                    next_attempt_at: *next_attempt_at,
                    error: error.clone(),
                },
                Resolution::Discarded { error } => ActionOutcome::Discarded {
                    error: error.clone(),
                },
            };
            let marked = self.store.mark_action_result(&action.id, &outcome).await;

            let settled = SettledAction { action, resolution };
            match &settled.resolution {
                Resolution::Confirmed(_) => {
                    tracing::info!(action_id = %settled.action.id, kind = settled.action.kind.as_str(), "Action confirmed");
                }
                Resolution::RetryScheduled { attempts, error, .. } => {
                    tracing::warn!(action_id = %settled.action.id, attempts = attempts, error = %error, "Action failed, retry scheduled");
                }
                Resolution::Discarded { error } => {
                    tracing::warn!(action_id = %settled.action.id, error = %error, "Action discarded");
                }
            }
            if settled.is_final() {
                // No subscribers is fine
                let _ = self.settled_tx.send(settled.clone());
            }
            report.settled.push(settled);

            // The server already answered, so the attempt is reported either
            // way; a confirmed action whose row survives is replayed later
            if let Err(source) = marked {
                tracing::error!(error = %source, "Failed to record action result");
                return Err(DrainError { report, source });
            }
        }

        Ok(report)
    }

    fn classify_failure(&self, action: &OfflineAction, error: ApiError) -> Resolution {
        if !error.is_transient() {
            return Resolution::Discarded {
                error: error.to_string(),
            };
        }

        let attempts = action.attempts + 1;
        if attempts >= self.policy.max_attempts {
            return Resolution::Discarded {
                error: format!("gave up after {attempts} attempts: {error}"),
            };
        }

        let delay = chrono::Duration::from_std(self.policy.backoff(attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        Resolution::RetryScheduled {
            attempts,
            next_attempt_at: Utc::now() + delay,
            error: error.to_string(),
        }
    }
}

/// Issue the server call an action stands for.
async fn execute<A: FeedApi>(api: &A, action: &OfflineAction) -> Result<ActionReceipt, ApiError> {
    let target = action.target_id.as_deref();

    match (&action.payload, target) {
        (ActionPayload::Like { intended, .. }, Some(post_id)) => {
            api.set_like(post_id, *intended).await.map(ActionReceipt::Like)
        }
        (ActionPayload::Comment { comment }, Some(post_id)) => {
            let request = NewComment {
                content: comment.content.clone(),
                client_ref: comment.id.clone(),
            };
            api.create_comment(post_id, &request)
                .await
                .map(ActionReceipt::Comment)
        }
        (ActionPayload::Post { body, kind, media }, _) => {
            let request = NewPost {
                content: body.clone(),
                kind: *kind,
                media: media.clone(),
                client_ref: action.id.clone(),
            };
            api.create_post(&request).await.map(ActionReceipt::Post)
        }
        (_, None) => Err(ApiError::HttpStatus {
            status: 400,
            message: Some(format!("{} action has no target", action.kind.as_str())),
        }),
    }
}
