use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a patient is in the physical queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Waiting,
    Notified,
    InService,
    Done,
    Cancelled,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Waiting => "waiting",
            EntryStatus::Notified => "notified",
            EntryStatus::InService => "in_service",
            EntryStatus::Done => "done",
            EntryStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(EntryStatus::Waiting),
            "notified" => Some(EntryStatus::Notified),
            "in_service" => Some(EntryStatus::InService),
            "done" => Some(EntryStatus::Done),
            "cancelled" => Some(EntryStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal entries are archived and never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Done | EntryStatus::Cancelled)
    }

    /// Front-desk lifecycle: forward only, cancel from any live state.
    pub fn can_advance_to(&self, next: EntryStatus) -> bool {
        use EntryStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Cancelled) => true,
            (Waiting, Notified) | (Waiting, InService) => true,
            (Notified, InService) => true,
            (InService, Done) => true,
            _ => false,
        }
    }
}

/// Lifecycle of the outbound tracking SMS for one entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationState {
    Pending,
    Sent,
    Failed,
}

impl NotificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationState::Pending => "pending",
            NotificationState::Sent => "sent",
            NotificationState::Failed => "failed",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NotificationState::Pending),
            "sent" => Some(NotificationState::Sent),
            "failed" => Some(NotificationState::Failed),
            _ => None,
        }
    }

    /// `pending -> sent`, `pending -> failed`, `failed -> pending`. `sent` is final.
    pub fn can_transition_to(&self, next: NotificationState) -> bool {
        use NotificationState::*;
        matches!(
            (self, next),
            (Pending, Sent) | (Pending, Failed) | (Failed, Pending)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub patient_name: String,
    pub phone_number: String,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
    pub notification_state: NotificationState,
    pub attempt_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    /// First whitespace-separated token of the patient's name.
    pub fn first_name(&self) -> &str {
        self.patient_name
            .split_whitespace()
            .next()
            .unwrap_or(self.patient_name.as_str())
    }
}

/// A validated check-in, ready to be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub patient_name: String,
    /// Ten national digits, no formatting.
    pub phone_number: String,
}

/// A waiting entry together with its derived 1-based rank.
#[derive(Debug, Clone)]
pub struct WaitingEntry {
    pub position: u32,
    pub entry: QueueEntry,
}

/// Change to an entry's notification record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationUpdate {
    /// Start a new delivery attempt: bumps `attempt_count`, stamps `last_attempt_at`.
    Attempt,
    Sent,
    Failed { error: String },
    /// Return a failed entry to the pending state before retrying.
    Retry,
}
