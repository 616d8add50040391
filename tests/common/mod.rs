#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clinic_checkin::config::{self, Config};
use clinic_checkin::db::QueueStore;
use clinic_checkin::model::{NotificationState, QueueEntry};
use clinic_checkin::sms::{DeliveryError, OutboundSms, SmsGateway};
use reqwest::StatusCode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

pub fn test_config() -> Config {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.clinic.hours = None;
    cfg.clinic.dedupe_window_seconds = 0;
    cfg.notifications.base_delay_ms = 10;
    cfg.notifications.attempt_timeout_ms = 500;
    cfg.notifications.sweep_interval_seconds = 3600;
    cfg
}

pub async fn setup_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn server_error() -> DeliveryError {
    DeliveryError::Status {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: "upstream exploded".into(),
    }
}

/// Scripted gateway: pops one response per call, then falls back to success
/// (or to failure when `always_fail` is set). Records every message.
#[derive(Clone, Default)]
pub struct RecordingGateway {
    responses: Arc<Mutex<VecDeque<Result<(), DeliveryError>>>>,
    always_fail: bool,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<OutboundSms>>>,
    started: Arc<AtomicUsize>,
}

impl RecordingGateway {
    pub fn with_responses(responses: Vec<Result<(), DeliveryError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Default::default()
        }
    }

    /// Every send takes `delay` before answering.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<OutboundSms> {
        self.calls.lock().await.clone()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SmsGateway for RecordingGateway {
    async fn send(&self, message: &OutboundSms) -> Result<(), DeliveryError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().await.push(message.clone());
        let scripted = self.responses.lock().await.pop_front();
        match scripted {
            Some(res) => res,
            None if self.always_fail => Err(server_error()),
            None => Ok(()),
        }
    }
}

/// Poll until `done` holds for the entry.
pub async fn wait_for(
    store: &QueueStore,
    id: i64,
    done: impl Fn(&QueueEntry) -> bool,
) -> QueueEntry {
    for _ in 0..500 {
        let entry = store.get(id).await.unwrap();
        if done(&entry) {
            return entry;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("entry {id} never reached the expected state");
}

pub async fn wait_for_sent(store: &QueueStore, id: i64) -> QueueEntry {
    wait_for(store, id, |e| e.notification_state == NotificationState::Sent).await
}

/// Failed with every attempt used up.
pub async fn wait_for_exhausted(store: &QueueStore, id: i64, max_attempts: i32) -> QueueEntry {
    wait_for(store, id, |e| {
        e.notification_state == NotificationState::Failed && e.attempt_count >= max_attempts
    })
    .await
}
