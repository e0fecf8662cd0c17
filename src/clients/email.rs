use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    clients::circuit_breaker::CircuitBreaker, config::Config, errors::SendError,
    models::message::OutboundNotification,
};

/// Downstream side effect performed once per delivered message.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &OutboundNotification) -> Result<(), SendError>;
}

#[derive(Debug, Serialize)]
struct EmailRequest<'a> {
    from: &'a str,
    to: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    template: Option<&'a str>,

    #[serde(rename = "type")]
    notification_type: &'a str,
    content: &'a Value,
}

/// Posts notifications to an HTTP email API. Rendering happens on the
/// provider side from `template` and `content`.
pub struct HttpEmailSender {
    http_client: Client,
    api_url: String,
    api_key: Option<String>,
    from: String,
}

impl HttpEmailSender {
    pub fn new(config: &Config) -> Result<Self, SendError> {
        let http_client = Client::builder()
            .timeout(Duration::from_millis(config.send_timeout_ms))
            .build()
            .map_err(|e| SendError::Permanent(format!("Failed to create HTTP client: {}", e)))?;

        info!(api_url = %config.email_api_url, "Email client initialized");

        Ok(Self {
            http_client,
            api_url: config.email_api_url.clone(),
            api_key: config.email_api_key.clone(),
            from: config.email_from.clone(),
        })
    }
}

/// 408, 429 and 5xx are worth retrying; any other rejection is final.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl NotificationSender for HttpEmailSender {
    async fn send(&self, notification: &OutboundNotification) -> Result<(), SendError> {
        debug!(
            message_id = %notification.message_id,
            recipient = %notification.recipient,
            "Sending email notification"
        );

        let body = EmailRequest {
            from: &self.from,
            to: &notification.recipient,
            subject: notification.subject.as_deref(),
            template: notification.template.as_deref(),
            notification_type: notification.notification_type.as_str(),
            content: &notification.content,
        };

        let mut request = self
            .http_client
            .post(&self.api_url)
            .header("Idempotency-Key", &notification.message_id)
            .json(&body);

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SendError::Transient(format!("Email request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            info!(message_id = %notification.message_id, "Email notification sent successfully");
            return Ok(());
        }

        let error_text = response.text().await.unwrap_or_default();
        let reason = format!("Email API returned {}: {}", status, error_text);

        if is_retryable_status(status) {
            Err(SendError::Transient(reason))
        } else {
            Err(SendError::Permanent(reason))
        }
    }
}

/// Routes every send through a circuit breaker.
pub struct GuardedSender {
    inner: Arc<dyn NotificationSender>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedSender {
    pub fn new(inner: Arc<dyn NotificationSender>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }
}

#[async_trait]
impl NotificationSender for GuardedSender {
    async fn send(&self, notification: &OutboundNotification) -> Result<(), SendError> {
        let inner = Arc::clone(&self.inner);
        self.breaker
            .call(|| async move { inner.send(notification).await })
            .await
    }
}
