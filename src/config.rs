use anyhow::{Context, Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::models::{
    circuit_breaker::CircuitBreakerConfig,
    retry::{BackoffPolicy, RetryConfig},
};

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Memory,
    Redis,
    Postgres,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_notification_queue")]
    pub notification_queue_name: String,
    #[serde(default = "default_failed_queue")]
    pub failed_queue_name: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default = "default_true")]
    pub delayed_retry: bool,

    #[serde(default)]
    pub ledger_backend: LedgerBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_seconds: u64,
    #[serde(default = "default_processing_lease")]
    pub processing_lease_seconds: u64,
    #[serde(default = "default_ledger_write_attempts")]
    pub ledger_write_attempts: u32,

    pub email_api_url: String,
    #[serde(default)]
    pub email_api_key: Option<String>,
    #[serde(default = "default_email_from")]
    pub email_from: String,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_timeout")]
    pub circuit_breaker_timeout_seconds: u64,
    #[serde(default = "default_success_threshold")]
    pub circuit_breaker_success_threshold: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

fn default_notification_queue() -> String {
    "notifications".to_string()
}

fn default_failed_queue() -> String {
    "notifications.dlq".to_string()
}

fn default_prefetch_count() -> u16 {
    1
}

fn default_true() -> bool {
    true
}

fn default_idempotency_ttl() -> u64 {
    86_400
}

fn default_processing_lease() -> u64 {
    60
}

fn default_ledger_write_attempts() -> u32 {
    3
}

fn default_email_from() -> String {
    "no-reply@localhost".to_string()
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_timeout() -> u64 {
    30
}

fn default_success_threshold() -> u32 {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_retry_jitter_ms() -> u64 {
    1_000
}

fn default_worker_concurrency() -> usize {
    1
}

fn default_server_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .context("Invalid or missing environmental variable")?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        match self.ledger_backend {
            LedgerBackend::Redis if self.redis_url.is_none() => {
                Err(anyhow!("REDIS_URL is required for the redis ledger backend"))
            }
            LedgerBackend::Postgres if self.database_url.is_none() => {
                Err(anyhow!("DATABASE_URL is required for the postgres ledger backend"))
            }
            _ if self.worker_concurrency == 0 => {
                Err(anyhow!("WORKER_CONCURRENCY must be at least 1"))
            }
            // A lease that can lapse mid-send lets a second worker send too.
            _ if self.processing_lease_seconds.saturating_mul(1_000) <= self.send_timeout_ms => {
                Err(anyhow!(
                    "PROCESSING_LEASE_SECONDS ({}s) must outlast SEND_TIMEOUT_MS ({}ms)",
                    self.processing_lease_seconds,
                    self.send_timeout_ms
                ))
            }
            _ => Ok(()),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.base_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            jitter_ms: self.retry_jitter_ms,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.ledger_write_attempts.max(1),
            initial_delay_ms: 50,
            max_delay_ms: 1_000,
            backoff_multiplier: 2,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            timeout_seconds: self.circuit_breaker_timeout_seconds,
            success_threshold: self.circuit_breaker_success_threshold,
        }
    }
}
