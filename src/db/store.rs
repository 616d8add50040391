use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::model::EntryRow;
use super::Pool;
use crate::model::{
    EntryStatus, NewEntry, NotificationState, NotificationUpdate, QueueEntry, WaitingEntry,
};

const ENTRY_COLUMNS: &str = "id, patient_name, phone_number, status, created_at, notification_state, attempt_count, last_attempt_at, last_error, archived_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("queue storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("queue entry {0} not found")]
    NotFound(i64),
    #[error("entry {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: &'static str,
        to: &'static str,
    },
    #[error("entry {id} is corrupt: {detail}")]
    Corrupt { id: i64, detail: String },
}

/// Result of committing a check-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appended {
    pub id: i64,
    /// Rank among waiting entries, computed in the same transaction as the insert.
    pub position: u32,
    pub created_at: DateTime<Utc>,
    /// True when an existing waiting entry for the same phone was returned instead.
    pub deduplicated: bool,
}

/// Registry of queue entries backed by SQLite.
///
/// Every mutation takes `write_lock` before opening its transaction, so
/// positions handed out by `append` can never collide. Reads go straight to
/// the pool; each read is a single statement and sees a committed snapshot.
#[derive(Clone)]
pub struct QueueStore {
    pool: Pool,
    write_lock: Arc<Mutex<()>>,
    dedupe_window: chrono::Duration,
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("dedupe_window", &self.dedupe_window)
            .finish_non_exhaustive()
    }
}

impl QueueStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            dedupe_window: chrono::Duration::zero(),
        }
    }

    /// Collapse resubmissions from the same phone within `window` while still waiting.
    pub fn with_dedupe_window(mut self, window: std::time::Duration) -> Self {
        self.dedupe_window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        self
    }

    #[instrument(skip_all)]
    pub async fn append(&self, new: &NewEntry) -> Result<Appended, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let since = (self.dedupe_window > chrono::Duration::zero())
            .then(|| now.checked_sub_signed(self.dedupe_window))
            .flatten();
        if let Some(since) = since {
            let existing: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
                "SELECT id, created_at FROM queue_entries WHERE phone_number = ? AND status = 'waiting' AND created_at >= ? ORDER BY id DESC LIMIT 1",
            )
            .bind(&new.phone_number)
            .bind(since)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some((id, created_at)) = existing {
                let position = waiting_rank(&mut tx, id, created_at).await?;
                tx.commit().await?;
                debug!(id, position, "check-in collapsed onto existing entry");
                return Ok(Appended {
                    id,
                    position,
                    created_at,
                    deduplicated: true,
                });
            }
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO queue_entries (patient_name, phone_number, status, created_at, notification_state, attempt_count) VALUES (?, ?, ?, ?, ?, 0) RETURNING id",
        )
        .bind(&new.patient_name)
        .bind(&new.phone_number)
        .bind(EntryStatus::Waiting.as_str())
        .bind(now)
        .bind(NotificationState::Pending.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let position = waiting_rank(&mut tx, id, now).await?;
        tx.commit().await?;

        Ok(Appended {
            id,
            position,
            created_at: now,
            deduplicated: false,
        })
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<QueueEntry, StoreError> {
        let row: Option<EntryRow> =
            sqlx::query_as(&format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or(StoreError::NotFound(id))?.try_into()
    }

    /// Waiting entries in FIFO order with their 1-based positions.
    #[instrument(skip_all)]
    pub async fn list_waiting(&self) -> Result<Vec<WaitingEntry>, StoreError> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE status = 'waiting' ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .enumerate()
            .map(|(idx, row)| -> Result<WaitingEntry, StoreError> {
                Ok(WaitingEntry {
                    position: idx as u32 + 1,
                    entry: row.try_into()?,
                })
            })
            .collect()
    }

    /// Current rank of `id` among waiting entries, or `None` if it is not waiting.
    #[instrument(skip(self))]
    pub async fn position_of(&self, id: i64) -> Result<Option<u32>, StoreError> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT e.status, (SELECT COUNT(*) FROM queue_entries w WHERE w.status = 'waiting' AND (w.created_at < e.created_at OR (w.created_at = e.created_at AND w.id <= e.id))) FROM queue_entries e WHERE e.id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let (status, rank) = row.ok_or(StoreError::NotFound(id))?;
        let status = EntryStatus::parse_status(&status).ok_or_else(|| StoreError::Corrupt {
            id,
            detail: format!("unknown status {status:?}"),
        })?;
        Ok((status == EntryStatus::Waiting).then_some(rank as u32))
    }

    /// Advance an entry's queue status. Terminal states archive the entry.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        id: i64,
        status: EntryStatus,
    ) -> Result<QueueEntry, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let current = fetch_in_tx(&mut tx, id).await?;
        if !current.status.can_advance_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status.as_str(),
                to: status.as_str(),
            });
        }
        let archived_at = status.is_terminal().then(Utc::now);
        sqlx::query("UPDATE queue_entries SET status = ?, archived_at = COALESCE(?, archived_at) WHERE id = ?")
            .bind(status.as_str())
            .bind(archived_at)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let updated = fetch_in_tx(&mut tx, id).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Apply one step of the notification lifecycle.
    #[instrument(skip(self))]
    pub async fn update_notification(
        &self,
        id: i64,
        update: NotificationUpdate,
    ) -> Result<QueueEntry, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let current = fetch_in_tx(&mut tx, id).await?;
        let from = current.notification_state;

        let target = match &update {
            NotificationUpdate::Attempt => NotificationState::Pending,
            NotificationUpdate::Sent => NotificationState::Sent,
            NotificationUpdate::Failed { .. } => NotificationState::Failed,
            NotificationUpdate::Retry => NotificationState::Pending,
        };
        let allowed = match update {
            NotificationUpdate::Attempt => from == NotificationState::Pending,
            _ => from.can_transition_to(target),
        };
        if !allowed {
            return Err(StoreError::InvalidTransition {
                id,
                from: from.as_str(),
                to: target.as_str(),
            });
        }

        match &update {
            NotificationUpdate::Attempt => {
                sqlx::query("UPDATE queue_entries SET attempt_count = attempt_count + 1, last_attempt_at = ? WHERE id = ?")
                    .bind(Utc::now())
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            NotificationUpdate::Sent | NotificationUpdate::Retry => {
                sqlx::query("UPDATE queue_entries SET notification_state = ? WHERE id = ?")
                    .bind(target.as_str())
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            NotificationUpdate::Failed { error } => {
                sqlx::query(
                    "UPDATE queue_entries SET notification_state = ?, last_error = ? WHERE id = ?",
                )
                .bind(target.as_str())
                .bind(error)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
        }

        let updated = fetch_in_tx(&mut tx, id).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Live entries whose SMS still needs delivering: pending, or failed with attempts left.
    #[instrument(skip(self))]
    pub async fn undelivered_notifications(
        &self,
        max_attempts: u32,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE archived_at IS NULL AND (notification_state = 'pending' OR (notification_state = 'failed' AND attempt_count < ?)) ORDER BY id ASC"
        ))
        .bind(max_attempts as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(QueueEntry::try_from).collect()
    }

    /// Most recent entries, newest first, including archived ones.
    #[instrument(skip(self))]
    pub async fn recent(&self, limit: u32) -> Result<Vec<QueueEntry>, StoreError> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries ORDER BY id DESC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(QueueEntry::try_from).collect()
    }
}

async fn fetch_in_tx(tx: &mut Transaction<'_, Sqlite>, id: i64) -> Result<QueueEntry, StoreError> {
    let row: Option<EntryRow> =
        sqlx::query_as(&format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
    row.ok_or(StoreError::NotFound(id))?.try_into()
}

async fn waiting_rank(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
    created_at: DateTime<Utc>,
) -> Result<u32, StoreError> {
    let rank: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM queue_entries WHERE status = 'waiting' AND (created_at < ? OR (created_at = ? AND id <= ?))",
    )
    .bind(created_at)
    .bind(created_at)
    .bind(id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(rank as u32)
}
