use std::{future::Future, time::Duration};

use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    errors::SendError,
    models::circuit_breaker::{CircuitBreakerConfig, CircuitState},
};

struct Counters {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
}

/// Guards the downstream sender. Only transient failures count towards
/// opening; a permanent rejection means the provider is up.
pub struct CircuitBreaker {
    service_name: String,
    config: CircuitBreakerConfig,
    counters: Mutex<Counters>,
}

impl CircuitBreaker {
    pub fn new(service_name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let service_name = service_name.into();
        info!(service = %service_name, "Circuit breaker initialized");

        Self {
            service_name,
            config,
            counters: Mutex::new(Counters {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub async fn state(&self) -> CircuitState {
        self.counters.lock().await.state
    }

    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, SendError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SendError>>,
    {
        self.admit().await?;

        let result = operation().await;

        match &result {
            Ok(_) => self.record_success().await,
            Err(SendError::Transient(_)) => self.record_failure().await,
            Err(SendError::Permanent(_)) => self.record_success().await,
        }

        result
    }

    async fn admit(&self) -> Result<(), SendError> {
        let mut counters = self.counters.lock().await;

        if counters.state != CircuitState::Open {
            return Ok(());
        }

        let reset_after = Duration::from_secs(self.config.timeout_seconds);
        let elapsed = counters.opened_at.map(|at| at.elapsed());

        if elapsed.is_some_and(|elapsed| elapsed >= reset_after) {
            info!(service = %self.service_name, "Circuit breaker attempting reset");
            counters.state = CircuitState::HalfOpen;
            counters.successes = 0;
            return Ok(());
        }

        warn!(service = %self.service_name, "Circuit breaker is open, rejecting request");
        Err(SendError::Transient(format!(
            "Circuit breaker is open for {}",
            self.service_name
        )))
    }

    async fn record_success(&self) {
        let mut counters = self.counters.lock().await;

        match counters.state {
            CircuitState::HalfOpen => {
                counters.successes += 1;
                debug!(
                    service = %self.service_name,
                    successes = counters.successes,
                    threshold = self.config.success_threshold,
                    "Circuit breaker success recorded"
                );

                if counters.successes >= self.config.success_threshold {
                    counters.state = CircuitState::Closed;
                    counters.failures = 0;
                    counters.successes = 0;
                    counters.opened_at = None;
                    info!(service = %self.service_name, "Circuit breaker closed after successful recovery");
                }
            }
            CircuitState::Closed => counters.failures = 0,
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut counters = self.counters.lock().await;

        if counters.state == CircuitState::HalfOpen {
            counters.state = CircuitState::Open;
            counters.opened_at = Some(Instant::now());
            warn!(service = %self.service_name, "Circuit breaker reopened after failed recovery attempt");
            return;
        }

        counters.failures += 1;
        debug!(
            service = %self.service_name,
            failures = counters.failures,
            threshold = self.config.failure_threshold,
            "Circuit breaker failure recorded"
        );

        if counters.failures >= self.config.failure_threshold {
            counters.state = CircuitState::Open;
            counters.opened_at = Some(Instant::now());
            warn!(
                service = %self.service_name,
                failures = counters.failures,
                "Circuit breaker opened due to consecutive failures"
            );
        }
    }
}
