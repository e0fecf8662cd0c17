use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    clients::{broker::Broker, circuit_breaker::CircuitBreaker, ledger::IdempotencyLedger},
    models::{
        circuit_breaker::CircuitState,
        health::{HealthCheckResponse, HealthStatus, ServiceHealth},
    },
};

const MESSAGE_BROKER: &str = "message_broker";
const IDEMPOTENCY_LEDGER: &str = "idempotency_ledger";
const CONSUMERS: &str = "consumers";

/// Number of dispatchers currently attached to the main queue.
#[derive(Debug, Clone)]
pub struct ConsumerLiveness {
    running: Arc<AtomicUsize>,
    expected: usize,
}

impl ConsumerLiveness {
    pub fn new(expected: usize) -> Self {
        Self {
            running: Arc::new(AtomicUsize::new(0)),
            expected,
        }
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Count one consumer as running until the guard is dropped.
    pub fn enter(&self) -> ConsumerGuard {
        self.running.fetch_add(1, Ordering::SeqCst);
        ConsumerGuard {
            running: Arc::clone(&self.running),
        }
    }
}

pub struct ConsumerGuard {
    running: Arc<AtomicUsize>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct HealthChecker {
    broker: Arc<dyn Broker>,
    ledger: Arc<dyn IdempotencyLedger>,
    breaker: Option<Arc<CircuitBreaker>>,
    consumers: Option<ConsumerLiveness>,
    queues: Vec<String>,
}

impl HealthChecker {
    pub fn new(
        broker: Arc<dyn Broker>,
        ledger: Arc<dyn IdempotencyLedger>,
        queues: Vec<String>,
    ) -> Self {
        Self {
            broker,
            ledger,
            breaker: None,
            consumers: None,
            queues,
        }
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_consumers(mut self, consumers: ConsumerLiveness) -> Self {
        self.consumers = Some(consumers);
        self
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        let (broker_health, queues) = self.check_broker().await;
        checks.insert(MESSAGE_BROKER.to_string(), broker_health);

        let ledger_health = self.check_ledger().await;
        checks.insert(IDEMPOTENCY_LEDGER.to_string(), ledger_health);

        if let Some(breaker) = &self.breaker {
            let sender_health = self.check_circuit_breaker(breaker).await;
            checks.insert(breaker.service_name().to_string(), sender_health);
        }

        if let Some(consumers) = &self.consumers {
            checks.insert(CONSUMERS.to_string(), check_consumers(consumers));
        }

        HealthCheckResponse {
            status: determine_overall_status(&checks),
            timestamp: Utc::now(),
            checks,
            queues,
        }
    }

    async fn check_broker(&self) -> (ServiceHealth, BTreeMap<String, u32>) {
        let start = Instant::now();
        let mut depths = BTreeMap::new();

        for queue in &self.queues {
            match self.broker.queue_depth(queue).await {
                Ok(depth) => {
                    depths.insert(queue.clone(), depth);
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Broker health check failed");
                    return (ServiceHealth::unhealthy(e.to_string()), depths);
                }
            }
        }

        let elapsed = start.elapsed().as_millis() as u64;
        debug!(response_time_ms = elapsed, "Broker health check passed");

        (ServiceHealth::healthy(elapsed), depths)
    }

    async fn check_ledger(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.ledger.ping().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(
                    backend = self.ledger.backend(),
                    response_time_ms = elapsed,
                    "Ledger health check passed"
                );
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(backend = self.ledger.backend(), error = %e, "Ledger health check failed");
                ServiceHealth::unhealthy(e.to_string())
            }
        }
    }

    async fn check_circuit_breaker(&self, breaker: &CircuitBreaker) -> ServiceHealth {
        let state = breaker.state().await;
        let state_str = state.as_str().to_string();

        match state {
            CircuitState::Closed => ServiceHealth::healthy(0).with_circuit_breaker(state_str),
            CircuitState::HalfOpen => {
                ServiceHealth::degraded("Circuit breaker in recovery mode".to_string())
                    .with_circuit_breaker(state_str)
            }
            CircuitState::Open => {
                ServiceHealth::degraded("Circuit breaker is open".to_string())
                    .with_circuit_breaker(state_str)
            }
        }
    }
}

fn check_consumers(consumers: &ConsumerLiveness) -> ServiceHealth {
    let running = consumers.running();
    let expected = consumers.expected();

    if running >= expected {
        ServiceHealth::healthy(0)
    } else if running == 0 {
        warn!(expected, "No consumers attached to the notification queue");
        ServiceHealth::unhealthy(format!("0 of {} consumers running", expected))
    } else {
        ServiceHealth::degraded(format!("{} of {} consumers running", running, expected))
    }
}

/// Broker, ledger or every consumer down makes the service unhealthy; an
/// open sender circuit or a missing consumer only degrades it.
fn determine_overall_status(checks: &HashMap<String, ServiceHealth>) -> HealthStatus {
    let critical_unhealthy = [MESSAGE_BROKER, IDEMPOTENCY_LEDGER, CONSUMERS].iter().any(|name| {
        checks
            .get(*name)
            .is_some_and(|health| health.status == HealthStatus::Unhealthy)
    });

    let has_degraded = checks
        .values()
        .any(|health| health.status != HealthStatus::Healthy);

    if critical_unhealthy {
        HealthStatus::Unhealthy
    } else if has_degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
