use chrono::{Local, NaiveTime};
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

use crate::assigner::WaitEstimator;
use crate::config::Hours;
use crate::db::{QueueStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClinicStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queue_length: u32,
    /// Mean of the estimated waits of everyone currently waiting.
    pub average_wait_minutes: u32,
    pub clinic_status: ClinicStatus,
}

/// Read-only aggregate view of the queue for polling clients.
#[derive(Clone)]
pub struct StatusProjector {
    store: QueueStore,
    estimator: Arc<dyn WaitEstimator>,
    hours: Option<Hours>,
}

impl StatusProjector {
    pub fn new(store: QueueStore, estimator: Arc<dyn WaitEstimator>, hours: Option<Hours>) -> Self {
        Self {
            store,
            estimator,
            hours,
        }
    }

    #[instrument(skip_all)]
    pub async fn current_status(&self) -> Result<QueueStatus, StoreError> {
        self.status_at(Local::now().time()).await
    }

    pub async fn status_at(&self, now: NaiveTime) -> Result<QueueStatus, StoreError> {
        let waiting = self.store.list_waiting().await?;
        let queue_length = waiting.len() as u32;
        let average_wait_minutes = if waiting.is_empty() {
            0
        } else {
            let total: u64 = waiting
                .iter()
                .map(|w| self.estimator.estimate_minutes(w.position - 1) as u64)
                .sum();
            (total as f64 / waiting.len() as f64).round() as u32
        };
        let clinic_status = match &self.hours {
            Some(hours) if !hours.is_open_at(now) => ClinicStatus::Closed,
            _ => ClinicStatus::Open,
        };
        Ok(QueueStatus {
            queue_length,
            average_wait_minutes,
            clinic_status,
        })
    }
}
