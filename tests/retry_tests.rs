use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use anyhow::Result;
use notification_service::{
    errors::LedgerError, models::retry::RetryConfig, utils::retry_with_backoff,
};
use tokio::{sync::Mutex, time::Instant};

fn ledger_retry(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms,
        max_delay_ms,
        backoff_multiplier: 2,
    }
}

/// Test: A ledger write that succeeds first time is not repeated
#[tokio::test]
async fn test_ledger_write_succeeds_without_retry() -> Result<()> {
    let config = ledger_retry(3, 20, 200);
    let attempts = Arc::new(AtomicU32::new(0));

    let written = retry_with_backoff("ledger settle", &config, || {
        let attempts = Arc::clone(&attempts);
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok::<_, LedgerError>("sent")
        }
    })
    .await?;

    assert_eq!(written, "sent");
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    Ok(())
}

/// Test: An unavailable backend is retried until it answers
#[tokio::test]
async fn test_unavailable_backend_is_retried() -> Result<()> {
    let config = ledger_retry(5, 20, 200);
    let attempts = Arc::new(AtomicU32::new(0));

    retry_with_backoff("ledger settle", &config, || {
        let attempts = Arc::clone(&attempts);
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(LedgerError::Unavailable("connection reset".to_string()))
            } else {
                Ok(())
            }
        }
    })
    .await?;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    Ok(())
}

/// Test: The last error surfaces once attempts are exhausted
#[tokio::test]
async fn test_exhausted_attempts_return_last_error() -> Result<()> {
    let config = ledger_retry(4, 10, 100);
    let attempts = Arc::new(AtomicU32::new(0));

    let result = retry_with_backoff("ledger settle", &config, || {
        let attempts = Arc::clone(&attempts);
        async move {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(LedgerError::Query(format!("attempt {}", n + 1)))
        }
    })
    .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    match result {
        Err(LedgerError::Query(message)) => assert_eq!(message, "attempt 4"),
        other => panic!("expected the fourth query error, got {:?}", other),
    }

    Ok(())
}

/// Test: A single configured attempt never sleeps
#[tokio::test]
async fn test_single_attempt_does_not_back_off() -> Result<()> {
    let config = ledger_retry(1, 5_000, 5_000);
    let start = Instant::now();

    let result = retry_with_backoff("ledger settle", &config, || async {
        Err::<(), _>(LedgerError::Unavailable("down".to_string()))
    })
    .await;

    assert!(result.is_err());
    assert!(start.elapsed().as_millis() < 1_000);

    Ok(())
}

/// Test: Gaps between attempts grow and stay under the cap
#[tokio::test]
async fn test_backoff_grows_and_is_capped() -> Result<()> {
    let config = ledger_retry(5, 40, 100);
    let start = Instant::now();
    let times = Arc::new(Mutex::new(Vec::new()));

    let _ = retry_with_backoff("ledger settle", &config, || {
        let times = Arc::clone(&times);
        async move {
            times.lock().await.push(start.elapsed().as_millis());
            Err::<(), _>(LedgerError::Unavailable("down".to_string()))
        }
    })
    .await;

    let times = times.lock().await;
    assert_eq!(times.len(), 5);

    // 40ms, 80ms, then capped at 100ms, each within ±10% jitter
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(first_gap >= 36, "first gap was {}ms", first_gap);
    assert!(second_gap >= 72, "second gap was {}ms", second_gap);

    for i in 3..times.len() {
        let gap = times[i] - times[i - 1];
        assert!(gap >= 90, "gap {} was {}ms", i, gap);
        assert!(gap < 250, "gap {} was {}ms", i, gap);
    }

    Ok(())
}

/// Test: Concurrent writers retry independently
#[tokio::test]
async fn test_concurrent_writers_are_independent() -> Result<()> {
    let config = Arc::new(ledger_retry(3, 10, 100));
    let succeeded = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();

    for i in 0..10 {
        let config = Arc::clone(&config);
        let succeeded = Arc::clone(&succeeded);

        handles.push(tokio::spawn(async move {
            let attempts = Arc::new(AtomicU32::new(0));

            let result = retry_with_backoff("ledger settle", &config, || {
                let attempts = Arc::clone(&attempts);
                async move {
                    if i % 2 == 0 && attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(LedgerError::Unavailable("first write lost".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

            if result.is_ok() {
                succeeded.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    futures_util::future::join_all(handles).await;
    assert_eq!(succeeded.load(Ordering::SeqCst), 10);

    Ok(())
}
