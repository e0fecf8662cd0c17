use std::{collections::VecDeque, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use notification_service::{
    clients::{
        broker::Broker, email::NotificationSender, ledger::InMemoryLedger, memory::InMemoryBroker,
    },
    config::{Config, LedgerBackend},
    dispatcher::{DispatchSettings, Dispatcher},
    errors::SendError,
    models::{
        message::{NotificationRequest, NotificationType, OutboundNotification},
        retry::{BackoffPolicy, RetryConfig},
        status::Disposition,
    },
    publisher::Publisher,
};
use serde_json::json;
use tokio::sync::Mutex;

pub const QUEUE: &str = "notifications";
pub const DLQ: &str = "notifications.dlq";

/// Sender that replays a script of outcomes, then falls back to a default.
pub struct ScriptedSender {
    script: Mutex<VecDeque<Result<(), SendError>>>,
    fallback: Result<(), SendError>,
    delay: Duration,
    calls: Mutex<Vec<(OutboundNotification, bool)>>,
}

impl ScriptedSender {
    pub fn succeeding() -> Self {
        Self::with_script(Vec::new(), Ok(()))
    }

    pub fn failing(error: SendError) -> Self {
        Self::with_script(Vec::new(), Err(error))
    }

    pub fn with_script(script: Vec<Result<(), SendError>>, fallback: Result<(), SendError>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub async fn attempts(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn successful_sends(&self) -> Vec<OutboundNotification> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(_, ok)| *ok)
            .map(|(n, _)| n.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationSender for ScriptedSender {
    async fn send(&self, notification: &OutboundNotification) -> Result<(), SendError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let outcome = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        self.calls
            .lock()
            .await
            .push((notification.clone(), outcome.is_ok()));

        outcome
    }
}

pub fn settings() -> DispatchSettings {
    DispatchSettings {
        queue: QUEUE.to_string(),
        dead_letter_queue: DLQ.to_string(),
        backoff: BackoffPolicy {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter_ms: 0,
        },
        delayed_retry: false,
        send_timeout: Duration::from_millis(500),
        processing_lease: Duration::from_secs(30),
        ledger_retry: RetryConfig {
            max_attempts: 1,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            backoff_multiplier: 2,
        },
    }
}

pub struct Harness {
    pub broker: InMemoryBroker,
    pub ledger: Arc<InMemoryLedger>,
    pub sender: Arc<ScriptedSender>,
    pub publisher: Publisher,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new(sender: ScriptedSender) -> Self {
        Self::with_settings(sender, settings())
    }

    pub fn with_settings(sender: ScriptedSender, settings: DispatchSettings) -> Self {
        let broker = InMemoryBroker::new();
        let ledger = Arc::new(InMemoryLedger::new());
        let sender = Arc::new(sender);

        let shared: Arc<dyn Broker> = Arc::new(broker.clone());
        let publisher = Publisher::new(Arc::clone(&shared), QUEUE);
        let dispatcher = Dispatcher::new(shared, sender.clone(), ledger.clone(), settings);

        Self {
            broker,
            ledger,
            sender,
            publisher,
            dispatcher,
        }
    }

    /// Handle ready deliveries on the main queue until none are left.
    pub async fn drain(&self) -> Result<Vec<Disposition>> {
        let mut dispositions = Vec::new();

        while let Some(delivery) = self.broker.try_next(QUEUE).await {
            dispositions.push(self.dispatcher.handle(delivery).await?);
        }

        Ok(dispositions)
    }
}

pub fn welcome_request() -> NotificationRequest {
    NotificationRequest::new(NotificationType::Welcome, "a@x.com")
        .with_subject("Welcome")
        .with_content(json!({ "name": "A" }))
        .with_template("welcome")
}

pub fn test_config(email_api_url: &str) -> Config {
    Config {
        rabbitmq_url: "amqp://localhost:5672".to_string(),
        notification_queue_name: QUEUE.to_string(),
        failed_queue_name: DLQ.to_string(),
        prefetch_count: 1,
        delayed_retry: false,
        ledger_backend: LedgerBackend::Memory,
        redis_url: None,
        database_url: None,
        idempotency_ttl_seconds: 60,
        processing_lease_seconds: 30,
        ledger_write_attempts: 1,
        email_api_url: email_api_url.to_string(),
        email_api_key: Some("test-key".to_string()),
        email_from: "no-reply@example.com".to_string(),
        send_timeout_ms: 2_000,
        circuit_breaker_failure_threshold: 5,
        circuit_breaker_timeout_seconds: 30,
        circuit_breaker_success_threshold: 2,
        max_retries: 3,
        base_retry_delay_ms: 1_000,
        max_retry_delay_ms: 30_000,
        retry_jitter_ms: 1_000,
        worker_concurrency: 1,
        server_port: 0,
    }
}
