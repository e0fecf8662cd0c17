use chrono::{DateTime, Utc};

use crate::utils::rfc3339_millis;

pub const MESSAGE_ID: &str = "messageId";
pub const RETRY_COUNT: &str = "retryCount";
pub const ORIGINAL_TIMESTAMP: &str = "originalTimestamp";
pub const NEXT_RETRY_AT: &str = "nextRetryAt";
pub const CORRELATION_ID: &str = "correlationId";
pub const ORIGINAL_QUEUE: &str = "originalQueue";
pub const FAILED_AT: &str = "failedAt";
pub const FAILURE_REASON: &str = "failureReason";

/// A single transport header value, independent of the broker's wire types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Text(String),
    Int(i64),
}

impl HeaderValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            HeaderValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            HeaderValue::Text(s) => s.parse().ok(),
        }
    }
}

/// Delivery metadata travelling next to the payload. Never hashed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryHeaders {
    pub message_id: Option<String>,
    pub retry_count: u32,
    pub original_timestamp: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub original_queue: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl DeliveryHeaders {
    pub fn for_new_message(
        message_id: impl Into<String>,
        original_timestamp: DateTime<Utc>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Some(message_id.into()),
            retry_count: 0,
            original_timestamp: Some(original_timestamp),
            correlation_id: Some(correlation_id.into()),
            ..Default::default()
        }
    }

    /// Headers for the next attempt of the same message.
    pub fn next_attempt(&self, next_retry_at: Option<DateTime<Utc>>) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            next_retry_at,
            ..self.clone()
        }
    }

    /// Headers for the dead-letter copy of the message.
    pub fn dead_lettered(
        &self,
        original_queue: &str,
        failed_at: DateTime<Utc>,
        failure_reason: impl Into<String>,
    ) -> Self {
        Self {
            original_queue: Some(original_queue.to_string()),
            failed_at: Some(failed_at),
            failure_reason: Some(failure_reason.into()),
            ..self.clone()
        }
    }

    pub fn to_pairs(&self) -> Vec<(&'static str, HeaderValue)> {
        let mut pairs = vec![(RETRY_COUNT, HeaderValue::Int(i64::from(self.retry_count)))];

        let text = |key, value: &Option<String>| {
            value.as_ref().map(|v| (key, HeaderValue::Text(v.clone())))
        };
        let time = |key, value: &Option<DateTime<Utc>>| {
            value.map(|v| (key, HeaderValue::Text(rfc3339_millis(v))))
        };

        pairs.extend(text(MESSAGE_ID, &self.message_id));
        pairs.extend(time(ORIGINAL_TIMESTAMP, &self.original_timestamp));
        pairs.extend(time(NEXT_RETRY_AT, &self.next_retry_at));
        pairs.extend(text(CORRELATION_ID, &self.correlation_id));
        pairs.extend(text(ORIGINAL_QUEUE, &self.original_queue));
        pairs.extend(time(FAILED_AT, &self.failed_at));
        pairs.extend(text(FAILURE_REASON, &self.failure_reason));

        pairs
    }

    /// Rebuilds headers from wire pairs. Unknown keys are ignored and an
    /// unreadable retry count is treated as a first attempt.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, HeaderValue)>,
    {
        let mut headers = Self::default();

        for (key, value) in pairs {
            match key {
                MESSAGE_ID => headers.message_id = value.as_text().map(str::to_string),
                RETRY_COUNT => {
                    headers.retry_count = value
                        .as_int()
                        .and_then(|n| u32::try_from(n).ok())
                        .unwrap_or(0)
                }
                ORIGINAL_TIMESTAMP => headers.original_timestamp = parse_time(&value),
                NEXT_RETRY_AT => headers.next_retry_at = parse_time(&value),
                CORRELATION_ID => headers.correlation_id = value.as_text().map(str::to_string),
                ORIGINAL_QUEUE => headers.original_queue = value.as_text().map(str::to_string),
                FAILED_AT => headers.failed_at = parse_time(&value),
                FAILURE_REASON => headers.failure_reason = value.as_text().map(str::to_string),
                _ => {}
            }
        }

        headers
    }
}

fn parse_time(value: &HeaderValue) -> Option<DateTime<Utc>> {
    value
        .as_text()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}
