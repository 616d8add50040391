//! Wiring: builds every component from one config and one pool.
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::assigner::{LinearEstimator, QueueAssigner, WaitEstimator};
use crate::config::Config;
use crate::db::{Pool, QueueStore};
use crate::dispatcher::{DispatchPolicy, DispatchWorker, NotificationDispatcher};
use crate::handlers::AppState;
use crate::service::CheckInService;
use crate::sms::SmsGateway;
use crate::status::StatusProjector;

pub struct Services {
    pub state: AppState,
    /// Present when a gateway is configured; finishes once every dispatcher handle is dropped.
    pub dispatcher_task: Option<JoinHandle<()>>,
}

pub fn build_services(cfg: &Config, pool: Pool, gateway: Option<Arc<dyn SmsGateway>>) -> Services {
    let store = QueueStore::new(pool)
        .with_dedupe_window(Duration::from_secs(cfg.clinic.dedupe_window_seconds));
    let estimator: Arc<dyn WaitEstimator> = Arc::new(LinearEstimator {
        average_service_minutes: cfg.clinic.average_service_minutes,
    });

    let (dispatcher, dispatcher_task) = match gateway {
        Some(gateway) => {
            let worker = DispatchWorker::new(store.clone(), gateway, DispatchPolicy::from_config(cfg));
            let (dispatcher, task) = NotificationDispatcher::spawn(worker);
            (dispatcher, Some(task))
        }
        None => {
            warn!("sms credentials not configured; tracking texts will be skipped");
            (NotificationDispatcher::disabled(), None)
        }
    };

    let assigner = QueueAssigner::new(store.clone(), estimator.clone());
    let checkin = CheckInService::new(assigner, dispatcher, cfg.clinic.tracking_base_url.clone());
    let projector = StatusProjector::new(store.clone(), estimator.clone(), cfg.clinic.hours.clone());

    info!(
        average_service_minutes = cfg.clinic.average_service_minutes,
        dedupe_window_seconds = cfg.clinic.dedupe_window_seconds,
        "check-in services ready"
    );
    Services {
        state: AppState {
            checkin,
            projector,
            store,
            estimator,
        },
        dispatcher_task,
    }
}
