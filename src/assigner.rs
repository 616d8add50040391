use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::db::{QueueStore, StoreError};
use crate::model::NewEntry;

/// Turns a queue depth into a wait estimate in minutes.
pub trait WaitEstimator: Send + Sync {
    fn estimate_minutes(&self, patients_ahead: u32) -> u32;
}

/// `patients_ahead * average_service_minutes`.
#[derive(Debug, Clone, Copy)]
pub struct LinearEstimator {
    pub average_service_minutes: u32,
}

impl WaitEstimator for LinearEstimator {
    fn estimate_minutes(&self, patients_ahead: u32) -> u32 {
        patients_ahead.saturating_mul(self.average_service_minutes)
    }
}

impl<F> WaitEstimator for F
where
    F: Fn(u32) -> u32 + Send + Sync,
{
    fn estimate_minutes(&self, patients_ahead: u32) -> u32 {
        self(patients_ahead)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentResult {
    pub id: i64,
    pub position: u32,
    pub patients_ahead: u32,
    pub estimated_wait_minutes: u32,
    /// Whether this check-in was collapsed onto an earlier one.
    pub deduplicated: bool,
}

#[derive(Clone)]
pub struct QueueAssigner {
    store: QueueStore,
    estimator: Arc<dyn WaitEstimator>,
}

impl QueueAssigner {
    pub fn new(store: QueueStore, estimator: Arc<dyn WaitEstimator>) -> Self {
        Self { store, estimator }
    }

    /// Commit one entry and report where it landed. Expects validated input.
    #[instrument(skip_all)]
    pub async fn assign(&self, entry: &NewEntry) -> Result<AssignmentResult, StoreError> {
        let appended = self.store.append(entry).await?;
        let patients_ahead = appended.position.saturating_sub(1);
        let result = AssignmentResult {
            id: appended.id,
            position: appended.position,
            patients_ahead,
            estimated_wait_minutes: self.estimator.estimate_minutes(patients_ahead),
            deduplicated: appended.deduplicated,
        };
        info!(
            id = result.id,
            position = result.position,
            deduplicated = result.deduplicated,
            "queue position assigned"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_estimate_scales_with_depth() {
        let est = LinearEstimator {
            average_service_minutes: 10,
        };
        assert_eq!(est.estimate_minutes(0), 0);
        assert_eq!(est.estimate_minutes(3), 30);
        assert_eq!(est.estimate_minutes(u32::MAX), u32::MAX);
    }

    #[test]
    fn closures_are_estimators() {
        let est: Arc<dyn WaitEstimator> = Arc::new(|ahead: u32| 5 + ahead * 7);
        assert_eq!(est.estimate_minutes(2), 19);
    }
}
