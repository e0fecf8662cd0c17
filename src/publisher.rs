//! Producer side: turns requests into envelopes and enqueues them durably.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clients::broker::Broker,
    codec,
    errors::PublishError,
    models::{
        headers::DeliveryHeaders,
        message::{BusinessFields, NotificationEnvelope, NotificationRequest, PublishReceipt},
    },
};

#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    default_queue: String,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, default_queue: impl Into<String>) -> Self {
        Self {
            broker,
            default_queue: default_queue.into(),
        }
    }

    /// Validate, derive the message id and publish with `retryCount = 0`.
    ///
    /// Nothing is sent to the broker when validation fails. On success the
    /// broker has confirmed exactly one enqueue.
    pub async fn publish(
        &self,
        queue: &str,
        request: NotificationRequest,
    ) -> Result<PublishReceipt, PublishError> {
        let (notification_type, recipient) = request.validate()?;

        let message_id = codec::compute_message_id(&BusinessFields {
            notification_type,
            recipient,
            subject: request.subject.as_deref(),
            content: &request.content,
            template: request.template.as_deref(),
        })?;

        let recipient = recipient.clone();
        let original_timestamp = Utc::now();
        let envelope = NotificationEnvelope {
            notification_type,
            recipient,
            subject: request.subject,
            content: request.content,
            template: request.template,
            message_id: message_id.clone(),
            original_timestamp,
            correlation: request.correlation,
        };

        let payload = codec::encode(&envelope)?;
        let headers = DeliveryHeaders::for_new_message(
            &message_id,
            original_timestamp,
            Uuid::new_v4().to_string(),
        );

        debug!(
            message_id = %message_id,
            queue,
            correlation_id = ?headers.correlation_id,
            "Publishing notification"
        );

        self.broker.publish(queue, &payload, &headers).await?;

        info!(
            message_id = %message_id,
            notification_type = envelope.notification_type.as_str(),
            queue,
            "Notification queued"
        );

        Ok(PublishReceipt { message_id })
    }

    pub async fn publish_default(
        &self,
        request: NotificationRequest,
    ) -> Result<PublishReceipt, PublishError> {
        self.publish(&self.default_queue, request).await
    }

    /// Fire-and-forget variant for callers whose own operation must not fail
    /// because a notification could not be queued.
    pub async fn publish_or_log(&self, request: NotificationRequest) -> Option<PublishReceipt> {
        let operation = request.correlation.operation.clone();

        match self.publish_default(request).await {
            Ok(receipt) => Some(receipt),
            Err(e) => {
                warn!(
                    error = %e,
                    operation = ?operation,
                    "Failed to queue notification, continuing without it"
                );
                None
            }
        }
    }
}
