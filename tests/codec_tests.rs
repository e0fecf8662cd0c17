use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use notification_service::{
    codec,
    errors::DecodeError,
    models::message::{Correlation, NotificationEnvelope, NotificationType},
};
use serde_json::{Value, json};

fn envelope(content: Value) -> Result<NotificationEnvelope> {
    let mut envelope = NotificationEnvelope {
        notification_type: NotificationType::Welcome,
        recipient: json!("a@x.com"),
        subject: Some("Welcome".to_string()),
        content,
        template: Some("welcome".to_string()),
        message_id: String::new(),
        original_timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap(),
        correlation: Correlation::default(),
    };
    envelope.message_id = codec::compute_message_id(&envelope.business_fields())?;

    Ok(envelope)
}

/// Test: Message ids are 64 lowercase hex characters
#[test]
fn test_message_id_format() -> Result<()> {
    let envelope = envelope(json!({ "name": "A" }))?;

    assert_eq!(envelope.message_id.len(), 64);
    assert!(
        envelope
            .message_id
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    );

    Ok(())
}

/// Test: Timestamps and correlation fields do not affect the id
#[test]
fn test_message_id_ignores_metadata() -> Result<()> {
    let first = envelope(json!({ "name": "A" }))?;

    let mut second = first.clone();
    second.original_timestamp = first.original_timestamp + Duration::hours(6);
    second.correlation = Correlation {
        user_id: Some("user-1".to_string()),
        operation: Some("registration".to_string()),
        todo_id: None,
    };

    assert_eq!(
        codec::compute_message_id(&second.business_fields())?,
        first.message_id
    );

    Ok(())
}

/// Test: Content key order does not change the id
#[test]
fn test_message_id_ignores_content_key_order() -> Result<()> {
    let ordered = envelope(json!({ "a": 1, "b": { "x": true, "y": [1, 2] } }))?;
    let shuffled: Value = serde_json::from_str(r#"{"b":{"y":[1,2],"x":true},"a":1}"#)?;
    let shuffled = envelope(shuffled)?;

    assert_eq!(ordered.message_id, shuffled.message_id);

    Ok(())
}

/// Test: Any business field change yields a new id
#[test]
fn test_message_id_changes_with_business_fields() -> Result<()> {
    let base = envelope(json!({ "name": "A" }))?;

    let mut other_content = base.clone();
    other_content.content = json!({ "name": "B" });

    let mut other_subject = base.clone();
    other_subject.subject = None;

    let mut other_type = base.clone();
    other_type.notification_type = NotificationType::PasswordReset;

    for changed in [other_content, other_subject, other_type] {
        assert_ne!(
            codec::compute_message_id(&changed.business_fields())?,
            base.message_id
        );
    }

    Ok(())
}

/// Test: Encoded envelopes decode to the same value with camelCase keys
#[test]
fn test_encode_decode() -> Result<()> {
    let mut original = envelope(json!({ "name": "A" }))?;
    original.correlation.user_id = Some("user-1".to_string());

    let payload = codec::encode(&original)?;
    let raw: Value = serde_json::from_slice(&payload)?;
    assert_eq!(raw["type"], "welcome");
    assert_eq!(raw["messageId"], original.message_id.as_str());
    assert_eq!(raw["userId"], "user-1");
    assert!(raw.get("originalTimestamp").is_some());

    assert_eq!(codec::decode(&payload)?, original);

    Ok(())
}

/// Test: Unknown notification types decode as generic
#[test]
fn test_unknown_type_decodes_as_generic() -> Result<()> {
    let payload = json!({
        "type": "sms_blast",
        "recipient": "a@x.com",
        "content": {},
        "messageId": "abc",
        "originalTimestamp": "2025-03-01T09:30:00Z"
    });

    let decoded = codec::decode(&serde_json::to_vec(&payload)?)?;
    assert_eq!(decoded.notification_type, NotificationType::Generic);

    Ok(())
}

/// Test: Garbage and incomplete payloads are decode errors
#[test]
fn test_malformed_payloads_fail_to_decode() {
    assert!(matches!(
        codec::decode(b"not json"),
        Err(DecodeError::Json(_))
    ));
    assert!(matches!(
        codec::decode(br#"{"type":"welcome","recipient":"a@x.com"}"#),
        Err(DecodeError::Json(_))
    ));
}

/// Test: Only scalar recipients can be addressed
#[test]
fn test_recipient_address_requires_scalar() -> Result<()> {
    let mut envelope = envelope(json!({}))?;
    assert_eq!(envelope.recipient_address()?, "a@x.com");

    envelope.recipient = json!(12345);
    assert_eq!(envelope.recipient_address()?, "12345");

    envelope.recipient = json!({ "email": "a@x.com" });
    assert!(matches!(
        envelope.recipient_address(),
        Err(DecodeError::NonScalarRecipient("object"))
    ));

    envelope.recipient = json!(["a@x.com"]);
    assert!(matches!(
        envelope.recipient_address(),
        Err(DecodeError::NonScalarRecipient("array"))
    ));

    Ok(())
}
