use chrono::{DateTime, Utc};

use super::schema::CacheStore;
use super::types::{to_millis, ActionRow, StorageError};
use crate::model::{ActionState, OfflineAction};

/// How a drained action left the queue (or was put back into it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Server confirmed; the row is deleted
    Succeeded,
    /// Transient failure; the row goes back to the tail as FAILED
    RetryLater {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    /// Retries exhausted or definitive rejection; the row is deleted
    Discarded { error: String },
}

const ACTION_COLUMNS: &str = "id, kind, target_id, payload, enqueued_at_ms, attempts, state, next_attempt_at_ms, last_error";

impl CacheStore {
    // ========================================================================
    // Offline Action Queue Operations
    // ========================================================================

    /// Append an action to the durable queue.
    pub async fn enqueue_action(&self, action: &OfflineAction) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&action.payload)
            .map_err(|e| StorageError::corrupt(&action.id, e))?;

        sqlx::query(
            r#"
            INSERT INTO offline_actions
                (id, kind, target_id, payload, enqueued_at_ms, attempts, state, next_attempt_at_ms, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&action.id)
        .bind(action.kind.as_str())
        .bind(&action.target_id)
        .bind(payload)
        .bind(to_millis(action.enqueued_at))
        .bind(action.attempts as i64)
        .bind(action.state.as_str())
        .bind(to_millis(action.next_attempt_at))
        .bind(&action.last_error)
        .execute(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;

        Ok(())
    }

    /// Claim the oldest action that is due at `now`, moving it to SYNCING.
    ///
    /// Actions waiting out a backoff are skipped, and so is every action
    /// queued after them for the same target: mutations of one entity reach
    /// the server in the order they were made.
    pub async fn dequeue_next_action(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<OfflineAction>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from_sqlx)?;

        let row: Option<ActionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ACTION_COLUMNS} FROM offline_actions a
            WHERE a.state IN ('PENDING', 'FAILED') AND a.next_attempt_at_ms <= ?
              AND NOT EXISTS (
                  SELECT 1 FROM offline_actions b
                  WHERE a.target_id IS NOT NULL
                    AND b.target_id = a.target_id
                    AND COALESCE(b.origin_seq, b.seq) < COALESCE(a.origin_seq, a.seq)
              )
            ORDER BY a.seq ASC
            LIMIT 1
        "#
        ))
        .bind(to_millis(now))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        sqlx::query("UPDATE offline_actions SET state = ? WHERE id = ?")
            .bind(ActionState::Syncing.as_str())
            .bind(&row.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await.map_err(StorageError::from_sqlx)?;

        let mut action = row.into_action()?;
        action.state = ActionState::Syncing;
        Ok(Some(action))
    }

    /// Record the result of a drain attempt.
    pub async fn mark_action_result(
        &self,
        id: &str,
        outcome: &ActionOutcome,
    ) -> Result<(), StorageError> {
        match outcome {
            ActionOutcome::Succeeded | ActionOutcome::Discarded { .. } => {
                sqlx::query("DELETE FROM offline_actions WHERE id = ?")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
            ActionOutcome::RetryLater {
                attempts,
                next_attempt_at,
                error,
            } => {
                // Delete + insert gives the action a fresh seq at the tail
                let mut tx = self.pool.begin().await.map_err(StorageError::from_sqlx)?;
                sqlx::query(
                    r#"
                    INSERT INTO offline_actions
                        (origin_seq, id, kind, target_id, payload, enqueued_at_ms, attempts, state, next_attempt_at_ms, last_error)
                    SELECT COALESCE(origin_seq, seq), 'retry:' || id, kind, target_id, payload, enqueued_at_ms, ?, ?, ?, ?
                    FROM offline_actions WHERE id = ?
                "#,
                )
                .bind(*attempts as i64)
                .bind(ActionState::Failed.as_str())
                .bind(to_millis(*next_attempt_at))
                .bind(error)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM offline_actions WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("UPDATE offline_actions SET id = ? WHERE id = 'retry:' || ?")
                    .bind(id)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await.map_err(StorageError::from_sqlx)?;
            }
        }
        Ok(())
    }

    /// Every queued action in FIFO order.
    pub async fn pending_actions(&self) -> Result<Vec<OfflineAction>, StorageError> {
        let rows: Vec<ActionRow> = sqlx::query_as(&format!(
            "SELECT {ACTION_COLUMNS} FROM offline_actions ORDER BY seq ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ActionRow::into_action).collect()
    }

    pub async fn pending_action_count(&self) -> Result<i64, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM offline_actions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Put actions left in SYNCING by an interrupted drain back to PENDING.
    pub async fn reset_in_flight_actions(&self) -> Result<u64, StorageError> {
        let result = sqlx::query("UPDATE offline_actions SET state = ? WHERE state = ?")
            .bind(ActionState::Pending.as_str())
            .bind(ActionState::Syncing.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
