use thiserror::Error;

/// Publish-time rejection of a request that is missing required fields.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Notification type is required")]
    MissingType,

    #[error("Notification recipient is required")]
    MissingRecipient,
}

/// The payload could not be turned back into an envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Recipient must be a scalar value, got {0}")]
    NonScalarRecipient(&'static str),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Failed to declare queue '{queue}': {message}")]
    Declare { queue: String, message: String },

    #[error("Failed to publish to '{queue}': {message}")]
    Publish { queue: String, message: String },

    #[error("Failed to settle delivery {delivery_tag}: {message}")]
    Settle { delivery_tag: u64, message: String },

    #[error("Consumer failed: {0}")]
    Consume(String),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Outcome of a failed downstream send, split by whether a retry can help.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Transient send failure: {0}")]
    Transient(String),

    #[error("Send rejected: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger backend unavailable: {0}")]
    Unavailable(String),

    #[error("Ledger query failed: {0}")]
    Query(String),
}

impl From<redis::RedisError> for LedgerError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            LedgerError::Unavailable(err.to_string())
        } else {
            LedgerError::Query(err.to_string())
        }
    }
}

impl From<tokio_postgres::Error> for LedgerError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            LedgerError::Unavailable(err.to_string())
        } else {
            LedgerError::Query(err.to_string())
        }
    }
}
