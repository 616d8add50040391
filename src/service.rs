use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::assigner::QueueAssigner;
use crate::db::StoreError;
use crate::dispatcher::{tracking_url, NotificationDispatcher};
use crate::validation::{self, CheckInRequest, ValidationErrors};

#[derive(Debug, Error)]
pub enum CheckInError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckInReceipt {
    pub id: i64,
    pub position: u32,
    pub patients_ahead: u32,
    pub estimated_wait_minutes: u32,
    pub timestamp: DateTime<Utc>,
}

/// Entry point for kiosk check-ins: validate, assign, hand off the SMS, answer.
#[derive(Clone)]
pub struct CheckInService {
    assigner: QueueAssigner,
    dispatcher: NotificationDispatcher,
    tracking_base_url: String,
}

impl CheckInService {
    pub fn new(
        assigner: QueueAssigner,
        dispatcher: NotificationDispatcher,
        tracking_base_url: impl Into<String>,
    ) -> Self {
        Self {
            assigner,
            dispatcher,
            tracking_base_url: tracking_base_url.into(),
        }
    }

    /// The receipt never depends on whether the text message goes out.
    #[instrument(skip_all)]
    pub async fn check_in(&self, request: &CheckInRequest) -> Result<CheckInReceipt, CheckInError> {
        let entry = validation::validate(request).map_err(|err| {
            debug!(%err, "check-in rejected");
            err
        })?;

        let assignment = self.assigner.assign(&entry).await.map_err(|err| {
            warn!(?err, "check-in failed to commit");
            err
        })?;

        // Resubmissions enqueue the same entry id; the dispatcher drops repeats.
        let url = tracking_url(&self.tracking_base_url, assignment.id);
        self.dispatcher.enqueue(assignment.id, &entry.phone_number, &url);

        Ok(CheckInReceipt {
            id: assignment.id,
            position: assignment.position,
            patients_ahead: assignment.patients_ahead,
            estimated_wait_minutes: assignment.estimated_wait_minutes,
            timestamp: Utc::now(),
        })
    }
}
