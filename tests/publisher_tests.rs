use std::sync::Arc;

use anyhow::Result;
use notification_service::{
    clients::{broker::Broker, memory::InMemoryBroker},
    codec,
    errors::{PublishError, ValidationError},
    models::message::{Correlation, NotificationRequest, NotificationType},
    publisher::Publisher,
};
use serde_json::{Value, json};
use tokio_test::{assert_err, assert_ok};

use crate::common::{QUEUE, welcome_request};

fn publisher() -> (InMemoryBroker, Publisher) {
    let broker = InMemoryBroker::new();
    let shared: Arc<dyn Broker> = Arc::new(broker.clone());
    (broker, Publisher::new(shared, QUEUE))
}

/// Test: A valid request is enqueued once with first-attempt headers
#[tokio::test]
async fn test_publish_enqueues_envelope() -> Result<()> {
    let (broker, publisher) = publisher();

    let request = welcome_request().with_correlation(Correlation {
        user_id: Some("user-1".to_string()),
        operation: Some("registration".to_string()),
        todo_id: None,
    });
    let receipt = publisher.publish_default(request).await?;

    let queued = broker.messages(QUEUE).await;
    assert_eq!(queued.len(), 1);

    let message = &queued[0];
    assert_eq!(message.headers.retry_count, 0);
    assert_eq!(
        message.headers.message_id.as_deref(),
        Some(receipt.message_id.as_str())
    );
    assert!(message.headers.correlation_id.is_some());
    assert!(message.headers.original_timestamp.is_some());

    let envelope = codec::decode(&message.payload)?;
    assert_eq!(envelope.message_id, receipt.message_id);
    assert_eq!(envelope.notification_type, NotificationType::Welcome);
    assert_eq!(envelope.recipient, json!("a@x.com"));
    assert_eq!(envelope.correlation.user_id.as_deref(), Some("user-1"));
    assert_eq!(
        Some(envelope.original_timestamp),
        message.headers.original_timestamp
    );

    Ok(())
}

/// Test: Identical business fields publish under the same id
#[tokio::test]
async fn test_same_content_same_message_id() -> Result<()> {
    let (broker, publisher) = publisher();

    let first = publisher.publish_default(welcome_request()).await?;
    let second = publisher
        .publish_default(welcome_request().with_correlation(Correlation {
            operation: Some("resend".to_string()),
            ..Correlation::default()
        }))
        .await?;
    let different = publisher
        .publish_default(welcome_request().with_subject("Hello again"))
        .await?;

    assert_eq!(first.message_id, second.message_id);
    assert_ne!(first.message_id, different.message_id);
    assert_eq!(broker.messages(QUEUE).await.len(), 3);

    Ok(())
}

/// Test: Requests without type or recipient never reach the broker
#[tokio::test]
async fn test_invalid_requests_have_no_side_effect() -> Result<()> {
    let (broker, publisher) = publisher();

    let no_type = NotificationRequest {
        notification_type: None,
        ..welcome_request()
    };
    let no_recipient = NotificationRequest {
        recipient: None,
        ..welcome_request()
    };
    let null_recipient = NotificationRequest {
        recipient: Some(Value::Null),
        ..welcome_request()
    };
    let blank_recipient = NotificationRequest::new(NotificationType::Email, "  ");

    assert!(matches!(
        publisher.publish_default(no_type).await,
        Err(PublishError::Validation(ValidationError::MissingType))
    ));
    for request in [no_recipient, null_recipient, blank_recipient] {
        assert!(matches!(
            publisher.publish_default(request).await,
            Err(PublishError::Validation(ValidationError::MissingRecipient))
        ));
    }

    assert!(broker.messages(QUEUE).await.is_empty());

    Ok(())
}

/// Test: Requests deserialize from the wire shape callers send
#[tokio::test]
async fn test_publish_from_json_request() -> Result<()> {
    let (broker, publisher) = publisher();

    let request: NotificationRequest = serde_json::from_value(json!({
        "type": "todo_reminder",
        "recipient": "a@x.com",
        "subject": "Due soon",
        "content": { "title": "Ship it" },
        "userId": "user-1",
        "todoId": "todo-9"
    }))?;

    assert_ok!(publisher.publish(QUEUE, request).await);

    let envelope = codec::decode(&broker.messages(QUEUE).await[0].payload)?;
    assert_eq!(envelope.notification_type, NotificationType::TodoReminder);
    assert_eq!(envelope.correlation.todo_id.as_deref(), Some("todo-9"));

    Ok(())
}

/// Test: Broker failures surface as publish errors
#[tokio::test]
async fn test_broker_failure_is_reported() -> Result<()> {
    let (broker, publisher) = publisher();
    broker.reject_publishes_to(QUEUE).await;

    let result = assert_err!(publisher.publish_default(welcome_request()).await);
    assert!(matches!(result, PublishError::Broker(_)));

    Ok(())
}

/// Test: The fire-and-forget variant swallows failures
#[tokio::test]
async fn test_publish_or_log_never_fails_the_caller() -> Result<()> {
    let (broker, publisher) = publisher();

    assert!(publisher.publish_or_log(welcome_request()).await.is_some());

    broker.reject_publishes_to(QUEUE).await;
    assert!(publisher.publish_or_log(welcome_request()).await.is_none());
    assert!(
        publisher
            .publish_or_log(NotificationRequest::default())
            .await
            .is_none()
    );

    assert_eq!(broker.messages(QUEUE).await.len(), 1);

    Ok(())
}
