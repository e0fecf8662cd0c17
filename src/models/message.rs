use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{DecodeError, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Email,
    Welcome,
    PasswordReset,
    TodoReminder,
    #[serde(other)]
    Generic,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Email => "email",
            NotificationType::Welcome => "welcome",
            NotificationType::PasswordReset => "password_reset",
            NotificationType::TodoReminder => "todo_reminder",
            NotificationType::Generic => "generic",
        }
    }
}

/// Correlation fields supplied by the calling service. Carried through the
/// queue untouched and never part of the message id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todo_id: Option<String>,
}

/// Inbound publish request as sent by the auth/user/todo services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    #[serde(rename = "type", default)]
    pub notification_type: Option<NotificationType>,

    #[serde(default)]
    pub recipient: Option<Value>,

    #[serde(default)]
    pub subject: Option<String>,

    #[serde(default)]
    pub content: Value,

    #[serde(default)]
    pub template: Option<String>,

    #[serde(flatten)]
    pub correlation: Correlation,
}

impl NotificationRequest {
    pub fn new(notification_type: NotificationType, recipient: impl Into<Value>) -> Self {
        Self {
            notification_type: Some(notification_type),
            recipient: Some(recipient.into()),
            ..Default::default()
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }

    /// Checks the fields without which nothing can be delivered.
    pub fn validate(&self) -> Result<(NotificationType, &Value), ValidationError> {
        let notification_type = self
            .notification_type
            .ok_or(ValidationError::MissingType)?;

        let recipient = match &self.recipient {
            None | Some(Value::Null) => return Err(ValidationError::MissingRecipient),
            Some(Value::String(s)) if s.trim().is_empty() => {
                return Err(ValidationError::MissingRecipient);
            }
            Some(recipient) => recipient,
        };

        Ok((notification_type, recipient))
    }
}

/// The hashed part of an envelope. Field order here is the canonical order.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BusinessFields<'a> {
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub recipient: &'a Value,
    pub subject: Option<&'a str>,
    pub content: &'a Value,
    pub template: Option<&'a str>,
}

/// Unit of work carried on the notification queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEnvelope {
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub recipient: Value,

    #[serde(default)]
    pub subject: Option<String>,

    #[serde(default)]
    pub content: Value,

    #[serde(default)]
    pub template: Option<String>,

    pub message_id: String,
    pub original_timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub correlation: Correlation,
}

impl NotificationEnvelope {
    pub fn business_fields(&self) -> BusinessFields<'_> {
        BusinessFields {
            notification_type: self.notification_type,
            recipient: &self.recipient,
            subject: self.subject.as_deref(),
            content: &self.content,
            template: self.template.as_deref(),
        }
    }

    /// Recipient rendered as the address handed to the sender.
    pub fn recipient_address(&self) -> Result<String, DecodeError> {
        match &self.recipient {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Null => Err(DecodeError::NonScalarRecipient("null")),
            Value::Array(_) => Err(DecodeError::NonScalarRecipient("array")),
            Value::Object(_) => Err(DecodeError::NonScalarRecipient("object")),
        }
    }
}

/// What the downstream sender receives for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundNotification {
    pub message_id: String,
    pub notification_type: NotificationType,
    pub recipient: String,
    pub subject: Option<String>,
    pub template: Option<String>,
    pub content: Value,
}

impl OutboundNotification {
    pub fn from_envelope(envelope: &NotificationEnvelope) -> Result<Self, DecodeError> {
        Ok(Self {
            message_id: envelope.message_id.clone(),
            notification_type: envelope.notification_type,
            recipient: envelope.recipient_address()?,
            subject: envelope.subject.clone(),
            template: envelope.template.clone(),
            content: envelope.content.clone(),
        })
    }
}

/// Returned to the publisher's caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    pub message_id: String,
}
