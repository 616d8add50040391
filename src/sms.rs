use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SmsCredentials;

/// One outbound text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSms {
    /// E.164, e.g. `+15195550123`.
    pub to: String,
    pub body: String,
}

impl OutboundSms {
    /// Address a ten-digit North American number.
    pub fn to_national(phone_digits: &str, body: String) -> Self {
        Self {
            to: format!("+1{phone_digits}"),
            body,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("gateway returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to reach gateway: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("gateway did not answer within {0:?}")]
    Timeout(std::time::Duration),
    #[error("failed to build gateway request: {0}")]
    Build(String),
}

/// Outbound carrier seam. Every error is treated as transient by the dispatcher.
#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send(&self, message: &OutboundSms) -> Result<(), DeliveryError>;
}

/// Fill `{first_name}` and `{tracking_url}` into the configured template.
pub fn render_template(template: &str, first_name: &str, tracking_url: &str) -> String {
    template
        .replace("{first_name}", first_name)
        .replace("{tracking_url}", tracking_url)
}

/// Twilio Messages API client.
#[derive(Clone)]
pub struct TwilioClient {
    http: Client,
    base_url: Url,
    account_sid: String,
    auth_token: String,
    messaging_service_sid: String,
}

impl fmt::Debug for TwilioClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwilioClient")
            .field("base_url", &self.base_url)
            .field("account_sid", &self.account_sid)
            .finish_non_exhaustive()
    }
}

impl TwilioClient {
    pub fn from_credentials(creds: &SmsCredentials) -> Result<Self, DeliveryError> {
        let base_url =
            Url::parse(&creds.api_base).map_err(|e| DeliveryError::Build(e.to_string()))?;
        let http = Client::builder()
            .user_agent("clinic-checkin/0.1")
            .no_proxy()
            .build()
            .map_err(|e| DeliveryError::Build(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            account_sid: creds.account_sid.clone(),
            auth_token: creds.auth_token.clone(),
            messaging_service_sid: creds.messaging_service_sid.clone(),
        })
    }

    pub fn build_request(&self, message: &OutboundSms) -> Result<reqwest::Request, DeliveryError> {
        let endpoint = self
            .base_url
            .join(&format!(
                "2010-04-01/Accounts/{}/Messages.json",
                self.account_sid
            ))
            .map_err(|e| DeliveryError::Build(e.to_string()))?;
        self.http
            .post(endpoint)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", message.to.as_str()),
                ("MessagingServiceSid", self.messaging_service_sid.as_str()),
                ("Body", message.body.as_str()),
            ])
            .build()
            .map_err(|e| DeliveryError::Build(e.to_string()))
    }
}

#[async_trait]
impl SmsGateway for TwilioClient {
    async fn send(&self, message: &OutboundSms) -> Result<(), DeliveryError> {
        let request = self.build_request(message)?;
        debug!(url = %request.url(), to = %message.to, "sending sms");

        let res = self
            .http
            .execute(request)
            .await
            .map_err(DeliveryError::Transport)?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!("rate limited by sms gateway: {}", body);
            }
            return Err(DeliveryError::Status { status, body });
        }
        Ok(())
    }
}
