//! Row models returned by the store's queries.
//!
//! Statuses are stored as text; conversion into domain enums happens here so
//! the store never hands out an entry with an unknown state.

use chrono::{DateTime, Utc};

use super::store::StoreError;
use crate::model::{EntryStatus, NotificationState, QueueEntry};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntryRow {
    pub id: i64,
    pub patient_name: String,
    pub phone_number: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub notification_state: String,
    pub attempt_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl TryFrom<EntryRow> for QueueEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let status = EntryStatus::parse_status(&row.status).ok_or_else(|| StoreError::Corrupt {
            id: row.id,
            detail: format!("unknown status '{}'", row.status),
        })?;
        let notification_state = NotificationState::parse_state(&row.notification_state)
            .ok_or_else(|| StoreError::Corrupt {
                id: row.id,
                detail: format!("unknown notification state '{}'", row.notification_state),
            })?;
        Ok(QueueEntry {
            id: row.id,
            patient_name: row.patient_name,
            phone_number: row.phone_number,
            status,
            created_at: row.created_at,
            notification_state,
            attempt_count: row.attempt_count,
            last_attempt_at: row.last_attempt_at,
            last_error: row.last_error,
            archived_at: row.archived_at,
        })
    }
}
