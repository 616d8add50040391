//! Background delivery of tracking text messages.
//!
//! `NotificationDispatcher` is the cheap, cloneable handle the request path
//! uses: `enqueue` only ever does a `try_send` into a bounded channel.
//! `DispatchWorker` owns the other end, runs each delivery as its own task
//! (bounded by `max_in_flight`) and periodically sweeps the store for entries
//! whose message never went out, so a full queue or a restart loses nothing.
//!
//! Delivery is keyed by entry id: an id that is already in flight, already
//! `sent`, or `failed` with no attempts left is never sent again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config;
use crate::db::{QueueStore, StoreError};
use crate::model::{NotificationState, NotificationUpdate};
use crate::sms::{render_template, DeliveryError, OutboundSms, SmsGateway};

#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
    pub max_in_flight: usize,
    pub queue_capacity: usize,
    pub sweep_interval: Duration,
    pub template: String,
    pub tracking_base_url: String,
}

impl DispatchPolicy {
    pub fn from_config(cfg: &config::Config) -> Self {
        let n = &cfg.notifications;
        Self {
            max_attempts: n.max_attempts,
            base_delay: n.base_delay(),
            attempt_timeout: n.attempt_timeout(),
            max_in_flight: n.max_in_flight,
            queue_capacity: n.queue_capacity,
            sweep_interval: n.sweep_interval(),
            template: n.template.clone(),
            tracking_base_url: cfg.clinic.tracking_base_url.clone(),
        }
    }
}

/// Link the patient follows to watch their place in line.
pub fn tracking_url(base: &str, entry_id: i64) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}q={entry_id}")
}

/// Delay before the attempt after `attempt` (1-based): `base * 2^(attempt-1)`.
pub fn backoff_delay(base: Duration, attempt: i32) -> Duration {
    let exp = attempt.saturating_sub(1).clamp(0, 16) as u32;
    base.saturating_mul(1 << exp)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryJob {
    pub entry_id: i64,
    pub phone_number: String,
    pub tracking_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    AlreadySent,
    /// Every attempt failed; the entry is recorded as `failed`.
    Exhausted,
    /// The entry was archived before its message went out.
    Skipped,
    InFlight,
}

/// Request-path handle. Never blocks.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    tx: Option<mpsc::Sender<DeliveryJob>>,
}

impl NotificationDispatcher {
    /// Start `worker` on the runtime and return the handle feeding it.
    pub fn spawn(worker: DispatchWorker) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(worker.policy.queue_capacity);
        let handle = tokio::spawn(worker.run(rx));
        (Self { tx: Some(tx) }, handle)
    }

    /// A dispatcher with no gateway: every enqueue is a logged skip.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn enqueue(&self, entry_id: i64, phone_number: &str, tracking_url: &str) {
        let Some(tx) = &self.tx else {
            warn!(entry_id, "sms gateway not configured, skipping notification");
            return;
        };
        let job = DeliveryJob {
            entry_id,
            phone_number: phone_number.to_string(),
            tracking_url: tracking_url.to_string(),
        };
        match tx.try_send(job) {
            Ok(()) => debug!(entry_id, "notification queued"),
            Err(TrySendError::Full(job)) => warn!(
                entry_id = job.entry_id,
                "notification queue full; leaving entry for the next sweep"
            ),
            Err(TrySendError::Closed(job)) => warn!(
                entry_id = job.entry_id,
                "notification dispatcher stopped; entry stays pending"
            ),
        }
    }
}

#[derive(Clone)]
pub struct DispatchWorker {
    store: QueueStore,
    gateway: Arc<dyn SmsGateway>,
    policy: Arc<DispatchPolicy>,
    in_flight: Arc<Mutex<HashSet<i64>>>,
    permits: Arc<Semaphore>,
}

impl DispatchWorker {
    pub fn new(store: QueueStore, gateway: Arc<dyn SmsGateway>, policy: DispatchPolicy) -> Self {
        let permits = Arc::new(Semaphore::new(policy.max_in_flight.max(1)));
        Self {
            store,
            gateway,
            policy: Arc::new(policy),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            permits,
        }
    }

    async fn run(self, mut rx: mpsc::Receiver<DeliveryJob>) {
        let mut tasks = JoinSet::new();
        // First tick fires immediately and recovers anything left from a previous run.
        let mut sweep = tokio::time::interval(self.policy.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            max_in_flight = self.policy.max_in_flight,
            max_attempts = self.policy.max_attempts,
            "notification dispatcher started"
        );
        loop {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => self.start(&mut tasks, job).await,
                    None => break,
                },
                _ = sweep.tick() => {
                    if let Err(err) = self.sweep(&mut tasks).await {
                        error!(?err, "notification sweep failed");
                    }
                }
                Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = res {
                        error!(?err, "delivery task aborted");
                    }
                }
            }
        }

        let remaining = tasks.len();
        if remaining > 0 {
            info!(remaining, "waiting for in-flight notifications");
        }
        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                error!(?err, "delivery task aborted");
            }
        }
        info!("notification dispatcher stopped");
    }

    async fn start(&self, tasks: &mut JoinSet<()>, job: DeliveryJob) {
        if !self.in_flight.lock().await.insert(job.entry_id) {
            debug!(entry_id = job.entry_id, "delivery already in flight");
            return;
        }
        let worker = self.clone();
        tasks.spawn(async move {
            let entry_id = job.entry_id;
            if let Ok(_permit) = worker.permits.clone().acquire_owned().await {
                if let Err(err) = worker.deliver(&job).await {
                    error!(?err, entry_id, "notification bookkeeping failed; sweep will retry");
                }
            }
            worker.in_flight.lock().await.remove(&entry_id);
        });
    }

    #[instrument(skip_all)]
    async fn sweep(&self, tasks: &mut JoinSet<()>) -> Result<(), StoreError> {
        let entries = self
            .store
            .undelivered_notifications(self.policy.max_attempts)
            .await?;
        if !entries.is_empty() {
            info!(count = entries.len(), "recovering undelivered notifications");
        }
        for entry in entries {
            let job = DeliveryJob {
                entry_id: entry.id,
                tracking_url: tracking_url(&self.policy.tracking_base_url, entry.id),
                phone_number: entry.phone_number,
            };
            self.start(tasks, job).await;
        }
        Ok(())
    }

    /// Deliver one job inline, honouring the in-flight guard.
    pub async fn process_job(&self, job: &DeliveryJob) -> Result<DeliveryOutcome, StoreError> {
        if !self.in_flight.lock().await.insert(job.entry_id) {
            return Ok(DeliveryOutcome::InFlight);
        }
        let res = self.deliver(job).await;
        self.in_flight.lock().await.remove(&job.entry_id);
        res
    }

    #[instrument(skip_all, fields(entry_id = job.entry_id))]
    async fn deliver(&self, job: &DeliveryJob) -> Result<DeliveryOutcome, StoreError> {
        let id = job.entry_id;
        let max_attempts = self.policy.max_attempts as i32;
        let mut entry = self.store.get(id).await?;

        loop {
            match entry.notification_state {
                NotificationState::Sent => {
                    debug!("tracking sms already sent");
                    return Ok(DeliveryOutcome::AlreadySent);
                }
                NotificationState::Failed if entry.attempt_count >= max_attempts => {
                    debug!(attempts = entry.attempt_count, "no delivery attempts left");
                    return Ok(DeliveryOutcome::Exhausted);
                }
                NotificationState::Failed => {
                    entry = self.store.update_notification(id, NotificationUpdate::Retry).await?;
                }
                NotificationState::Pending => {}
            }

            if entry.status.is_terminal() {
                debug!(status = entry.status.as_str(), "entry archived before delivery");
                return Ok(DeliveryOutcome::Skipped);
            }
            if entry.attempt_count >= max_attempts {
                // Attempt was recorded but its outcome was lost, e.g. a crash mid-send.
                self.store
                    .update_notification(
                        id,
                        NotificationUpdate::Failed {
                            error: "attempts exhausted".into(),
                        },
                    )
                    .await?;
                error!(attempts = entry.attempt_count, "notification delivery failed permanently");
                return Ok(DeliveryOutcome::Exhausted);
            }

            entry = self.store.update_notification(id, NotificationUpdate::Attempt).await?;
            let attempt = entry.attempt_count;
            let body = render_template(&self.policy.template, entry.first_name(), &job.tracking_url);
            let message = OutboundSms::to_national(&job.phone_number, body);

            // No store lock is held across this call.
            let result = match timeout(self.policy.attempt_timeout, self.gateway.send(&message)).await
            {
                Ok(res) => res,
                Err(_) => Err(DeliveryError::Timeout(self.policy.attempt_timeout)),
            };

            match result {
                Ok(()) => {
                    self.store.update_notification(id, NotificationUpdate::Sent).await?;
                    info!(attempt, "tracking sms delivered");
                    return Ok(DeliveryOutcome::Delivered);
                }
                Err(err) => {
                    entry = self
                        .store
                        .update_notification(
                            id,
                            NotificationUpdate::Failed {
                                error: err.to_string(),
                            },
                        )
                        .await?;
                    if attempt >= max_attempts {
                        error!(attempt, error = %err, "notification delivery failed permanently");
                        return Ok(DeliveryOutcome::Exhausted);
                    }
                    let delay = backoff_delay(self.policy.base_delay, attempt);
                    warn!(attempt, error = %err, ?delay, "sms delivery failed; backing off");
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
    }

    #[test]
    fn tracking_url_appends_entry_id() {
        assert_eq!(
            tracking_url("https://t.example/status", 42),
            "https://t.example/status?q=42"
        );
        assert_eq!(
            tracking_url("https://t.example/status?clinic=a", 7),
            "https://t.example/status?clinic=a&q=7"
        );
    }

    #[test]
    fn disabled_dispatcher_skips_quietly() {
        let dispatcher = NotificationDispatcher::disabled();
        assert!(!dispatcher.is_enabled());
        dispatcher.enqueue(1, "5195550123", "https://t.example/status?q=1");
    }
}
