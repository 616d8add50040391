//! Configuration loader and validator for the check-in service.
use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub clinic: Clinic,
    pub notifications: Notifications,
    #[serde(default)]
    pub sms: Option<Sms>,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub bind_addr: String,
}

/// Queue policy for the clinic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Clinic {
    pub average_service_minutes: u32,
    /// Same phone number within this window while still waiting is treated as a resubmission.
    #[serde(default)]
    pub dedupe_window_seconds: u64,
    pub tracking_base_url: String,
    #[serde(default)]
    pub hours: Option<Hours>,
}

/// Opening hours as `HH:MM`, local time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hours {
    pub opens_at: String,
    pub closes_at: String,
}

/// Outbound SMS delivery policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notifications {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub attempt_timeout_ms: u64,
    pub max_in_flight: usize,
    pub queue_capacity: usize,
    pub sweep_interval_seconds: u64,
    pub template: String,
}

/// SMS carrier credentials. Any field may be left empty and supplied via env.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sms {
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub messaging_service_sid: String,
    #[serde(default = "default_sms_api_base")]
    pub api_base: String,
}

fn default_sms_api_base() -> String {
    "https://api.twilio.com/".to_string()
}

/// Fully resolved carrier credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct SmsCredentials {
    pub account_sid: String,
    pub auth_token: String,
    pub messaging_service_sid: String,
    pub api_base: String,
}

impl std::fmt::Debug for SmsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmsCredentials")
            .field("account_sid", &self.account_sid)
            .field("messaging_service_sid", &self.messaging_service_sid)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Merge the `sms` section with `TWILIO_*` environment variables.
    /// Returns `None` when any credential is still missing.
    pub fn sms_credentials(&self) -> Option<SmsCredentials> {
        let base = self.sms.clone().unwrap_or_else(|| Sms {
            api_base: default_sms_api_base(),
            ..Default::default()
        });
        let pick = |var: &str, fallback: String| {
            std::env::var(var)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(fallback)
        };
        let account_sid = pick("TWILIO_ACCOUNT_SID", base.account_sid);
        let auth_token = pick("TWILIO_AUTH_TOKEN", base.auth_token);
        let messaging_service_sid = pick("TWILIO_MESSAGING_SERVICE_SID", base.messaging_service_sid);
        if account_sid.trim().is_empty()
            || auth_token.trim().is_empty()
            || messaging_service_sid.trim().is_empty()
        {
            return None;
        }
        Some(SmsCredentials {
            account_sid,
            auth_token,
            messaging_service_sid,
            api_base: base.api_base,
        })
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/clinic.db", self.app.data_dir))
    }
}

impl Notifications {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

impl Hours {
    /// Parsed `(opens_at, closes_at)`; `None` if either is malformed.
    pub fn parse(&self) -> Option<(NaiveTime, NaiveTime)> {
        let open = NaiveTime::parse_from_str(self.opens_at.trim(), "%H:%M").ok()?;
        let close = NaiveTime::parse_from_str(self.closes_at.trim(), "%H:%M").ok()?;
        Some((open, close))
    }

    /// Whether `now` falls inside `[opens_at, closes_at)`. Handles overnight spans;
    /// equal times mean open around the clock.
    pub fn is_open_at(&self, now: NaiveTime) -> bool {
        let Some((open, close)) = self.parse() else {
            return true;
        };
        let now = now.with_nanosecond(0).unwrap_or(now);
        if open == close {
            true
        } else if open < close {
            now >= open && now < close
        } else {
            now >= open || now < close
        }
    }
}

/// A resubmission window longer than a day would collapse unrelated visits.
const MAX_DEDUPE_WINDOW_SECONDS: u64 = 86_400;

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.bind_addr.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::Invalid("app.bind_addr must be a socket address"));
    }

    if cfg.clinic.average_service_minutes == 0 {
        return Err(ConfigError::Invalid("clinic.average_service_minutes must be > 0"));
    }
    if cfg.clinic.dedupe_window_seconds > MAX_DEDUPE_WINDOW_SECONDS {
        return Err(ConfigError::Invalid("clinic.dedupe_window_seconds must be at most 86400"));
    }
    if cfg.clinic.tracking_base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("clinic.tracking_base_url must be non-empty"));
    }
    if let Some(hours) = &cfg.clinic.hours {
        if hours.parse().is_none() {
            return Err(ConfigError::Invalid("clinic.hours must use HH:MM"));
        }
    }

    let n = &cfg.notifications;
    if n.max_attempts == 0 {
        return Err(ConfigError::Invalid("notifications.max_attempts must be > 0"));
    }
    if n.attempt_timeout_ms == 0 {
        return Err(ConfigError::Invalid("notifications.attempt_timeout_ms must be > 0"));
    }
    if n.max_in_flight == 0 {
        return Err(ConfigError::Invalid("notifications.max_in_flight must be > 0"));
    }
    if n.queue_capacity == 0 {
        return Err(ConfigError::Invalid("notifications.queue_capacity must be > 0"));
    }
    if n.sweep_interval_seconds == 0 {
        return Err(ConfigError::Invalid("notifications.sweep_interval_seconds must be > 0"));
    }
    if !n.template.contains("{tracking_url}") {
        return Err(ConfigError::Invalid("notifications.template must contain {tracking_url}"));
    }

    if let Some(sms) = &cfg.sms {
        if reqwest::Url::parse(&sms.api_base).is_err() {
            return Err(ConfigError::Invalid("sms.api_base must be a URL"));
        }
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  bind_addr: "0.0.0.0:8080"

clinic:
  average_service_minutes: 10
  dedupe_window_seconds: 120
  tracking_base_url: "https://track.example-clinic.com/status"
  hours:
    opens_at: "08:00"
    closes_at: "20:00"

notifications:
  max_attempts: 3
  base_delay_ms: 1000
  attempt_timeout_ms: 5000
  max_in_flight: 8
  queue_capacity: 256
  sweep_interval_seconds: 30
  template: "Hi {first_name}, you're checked in! Track your place in line: {tracking_url}"

sms:
  account_sid: ""
  auth_token: ""
  messaging_service_sid: ""
  api_base: "https://api.twilio.com/"
"#
}
