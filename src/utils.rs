use std::future::Future;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use crate::models::retry::RetryConfig;

pub fn rfc3339_millis(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Delay before attempt `attempt + 1`, with ±10% jitter.
fn jittered(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = config
        .backoff_multiplier
        .checked_pow(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    let delay_ms = config
        .initial_delay_ms
        .saturating_mul(factor)
        .min(config.max_delay_ms);

    let jitter = rand::random_range(-0.1..=0.1);
    Duration::from_millis((delay_ms as f64 * (1.0 + jitter)) as u64)
}

/// Runs `operation` until it succeeds or `max_attempts` is reached.
pub async fn retry_with_backoff<F, Fut, T, E>(
    what: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let error = match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(what, attempt, "Retry succeeded");
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        if attempt >= config.max_attempts {
            warn!(
                what,
                max_attempts = config.max_attempts,
                error = %error,
                "Retry failed after exhausting all attempts"
            );
            return Err(error);
        }

        let delay = jittered(config, attempt);
        debug!(
            what,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, backing off"
        );

        sleep(delay).await;
    }
}
