use std::time::Duration;

use chrono::{TimeZone, Utc};
use notification_service::models::retry::{BackoffPolicy, RetrySchedule};

/// Test: Default policy matches the documented schedule
#[test]
fn test_default_policy_schedule() {
    let policy = BackoffPolicy::default();

    assert_eq!(policy.max_retries, 3);
    assert_eq!(policy.base_delay(0), Duration::from_millis(1_000));
    assert_eq!(policy.base_delay(1), Duration::from_millis(2_000));
    assert_eq!(policy.base_delay(2), Duration::from_millis(4_000));
    assert_eq!(policy.base_delay(5), Duration::from_millis(30_000));
}

/// Test: Base delay never decreases and never exceeds the cap
#[test]
fn test_base_delay_is_monotonic_and_capped() {
    let policy = BackoffPolicy::default();
    let cap = Duration::from_millis(policy.max_delay_ms);

    let mut previous = Duration::ZERO;
    for retry_count in 0..70 {
        let delay = policy.base_delay(retry_count);
        assert!(delay >= previous, "delay shrank at retry {}", retry_count);
        assert!(delay <= cap, "delay above cap at retry {}", retry_count);
        previous = delay;
    }
}

/// Test: Huge retry counts saturate instead of overflowing
#[test]
fn test_base_delay_saturates() {
    let policy = BackoffPolicy::default();

    assert_eq!(policy.base_delay(64), Duration::from_millis(30_000));
    assert_eq!(policy.base_delay(u32::MAX), Duration::from_millis(30_000));
}

/// Test: Jitter samples are clamped to the configured window
#[test]
fn test_explicit_jitter_is_clamped() {
    let policy = BackoffPolicy::default();

    assert_eq!(policy.delay_with_jitter(0, 0), Duration::from_millis(1_000));
    assert_eq!(policy.delay_with_jitter(0, 250), Duration::from_millis(1_250));
    assert_eq!(
        policy.delay_with_jitter(0, 50_000),
        Duration::from_millis(2_000)
    );
}

/// Test: Random delays stay inside [base, base + jitter]
#[test]
fn test_random_delay_within_bounds() {
    let policy = BackoffPolicy::default();

    for retry_count in 0..6 {
        let base = policy.base_delay(retry_count);
        let ceiling = base + Duration::from_millis(policy.jitter_ms);

        for _ in 0..50 {
            let delay = policy.delay(retry_count);
            assert!(delay >= base && delay <= ceiling);
        }
    }
}

/// Test: Zero jitter gives deterministic delays
#[test]
fn test_zero_jitter_is_deterministic() {
    let policy = BackoffPolicy {
        jitter_ms: 0,
        ..BackoffPolicy::default()
    };

    assert_eq!(policy.delay(1), policy.base_delay(1));
    assert_eq!(policy.delay(1), policy.delay(1));
}

/// Test: Retries are exhausted exactly at max_retries
#[test]
fn test_exhaustion_boundary() {
    let policy = BackoffPolicy::default();

    assert!(!policy.is_exhausted(0));
    assert!(!policy.is_exhausted(2));
    assert!(policy.is_exhausted(3));
    assert!(policy.is_exhausted(10));

    let no_retries = BackoffPolicy {
        max_retries: 0,
        ..BackoffPolicy::default()
    };
    assert!(no_retries.is_exhausted(0));
}

/// Test: Immediate requeue unless delayed delivery is enabled
#[test]
fn test_retry_schedule_planning() {
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
    let delay = Duration::from_millis(2_500);

    let immediate = RetrySchedule::plan(now, delay, false);
    assert_eq!(immediate, RetrySchedule::Immediate);
    assert_eq!(immediate.not_before(), None);
    assert_eq!(immediate.remaining(now), Duration::ZERO);

    let delayed = RetrySchedule::plan(now, delay, true);
    let due = now + chrono::Duration::milliseconds(2_500);
    assert_eq!(delayed, RetrySchedule::DelayedUntil(due));
    assert_eq!(delayed.remaining(now), delay);
    assert_eq!(delayed.remaining(due), Duration::ZERO);
    assert_eq!(
        delayed.remaining(due + chrono::Duration::seconds(1)),
        Duration::ZERO
    );

    assert_eq!(
        RetrySchedule::plan(now, Duration::ZERO, true),
        RetrySchedule::Immediate
    );
}
