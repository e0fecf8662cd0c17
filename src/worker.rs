//! Process wiring: broker channels, ledger, sender, workers and the HTTP API.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{Context, Error, Result};
use tokio::{sync::watch, task::JoinSet};
use tracing::{error, info, warn};

use crate::{
    api::{AppState, run_api_server},
    clients::{
        broker::Broker,
        circuit_breaker::CircuitBreaker,
        database::PostgresLedger,
        email::{GuardedSender, HttpEmailSender, NotificationSender},
        health::{ConsumerLiveness, HealthChecker},
        ledger::{IdempotencyLedger, InMemoryLedger},
        rbmq::RabbitMqClient,
        redis::RedisLedger,
    },
    config::{Config, LedgerBackend},
    dispatcher::{DispatchSettings, Dispatcher},
    errors::BrokerError,
    publisher::Publisher,
};

const WORKER_RESTART_DELAY: Duration = Duration::from_secs(5);

pub async fn build_ledger(config: &Config) -> Result<Arc<dyn IdempotencyLedger>, Error> {
    let ledger: Arc<dyn IdempotencyLedger> = match config.ledger_backend {
        LedgerBackend::Memory => {
            info!("Using in-process idempotency ledger, duplicates are only suppressed per instance");
            Arc::new(InMemoryLedger::new())
        }
        LedgerBackend::Redis => {
            let url = config.redis_url.as_deref().context("REDIS_URL is not set")?;
            Arc::new(RedisLedger::connect(url, config.idempotency_ttl_seconds).await?)
        }
        LedgerBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is not set")?;
            Arc::new(PostgresLedger::connect(url).await?)
        }
    };

    Ok(ledger)
}

async fn declare_topology(client: &RabbitMqClient, config: &Config) -> Result<(), Error> {
    client.declare_queue(&config.notification_queue_name).await?;
    client.declare_queue(&config.failed_queue_name).await?;

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Keep one dispatcher consuming until `shutdown` flips.
///
/// `open` builds a fresh dispatcher, normally on a new channel. When the
/// dispatcher's stream fails or closes, or `open` itself fails, another one
/// is built after `restart_delay`. `liveness` counts the worker as running
/// only while a dispatcher is attached.
pub async fn supervise<F, Fut>(
    worker_id: usize,
    mut open: F,
    liveness: ConsumerLiveness,
    mut shutdown: watch::Receiver<bool>,
    restart_delay: Duration,
) where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Dispatcher, BrokerError>> + Send,
{
    loop {
        if *shutdown.borrow() {
            break;
        }

        match open().await {
            Ok(dispatcher) => {
                let _consuming = liveness.enter();
                match dispatcher.run(shutdown.clone()).await {
                    Ok(()) if *shutdown.borrow() => break,
                    Ok(()) => warn!(worker_id, "Delivery stream closed, restarting worker"),
                    Err(e) => error!(worker_id, error = %e, "Worker failed, restarting"),
                }
            }
            Err(e) => error!(worker_id, error = %e, "Failed to start worker"),
        }

        tokio::select! {
            _ = tokio::time::sleep(restart_delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(worker_id, "Worker supervisor stopped");
}

/// Start `worker_concurrency` dispatchers, each on its own channel, plus the
/// API, and run until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<(), Error> {
    let primary = RabbitMqClient::connect(&config).await?;
    declare_topology(&primary, &config).await?;
    let primary = Arc::new(primary);

    let ledger = build_ledger(&config).await?;

    let breaker = Arc::new(CircuitBreaker::new(
        "email_provider",
        config.circuit_breaker_config(),
    ));
    let email: Arc<dyn NotificationSender> = Arc::new(HttpEmailSender::new(&config)?);
    let sender: Arc<dyn NotificationSender> =
        Arc::new(GuardedSender::new(email, Arc::clone(&breaker)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let liveness = ConsumerLiveness::new(config.worker_concurrency);
    let mut workers = JoinSet::new();

    for worker_id in 1..=config.worker_concurrency {
        let primary = Arc::clone(&primary);
        let sender = Arc::clone(&sender);
        let ledger = Arc::clone(&ledger);
        let settings = DispatchSettings::from_config(&config);

        let open = move || {
            let primary = Arc::clone(&primary);
            let sender = Arc::clone(&sender);
            let ledger = Arc::clone(&ledger);
            let settings = settings.clone();

            async move {
                let broker: Arc<dyn Broker> = Arc::new(primary.open_worker(worker_id).await?);
                Ok::<_, BrokerError>(Dispatcher::new(broker, sender, ledger, settings))
            }
        };

        workers.spawn(supervise(
            worker_id,
            open,
            liveness.clone(),
            shutdown_rx.clone(),
            WORKER_RESTART_DELAY,
        ));
    }

    info!(
        workers = config.worker_concurrency,
        queue = %config.notification_queue_name,
        "Notification workers running"
    );

    let api_broker: Arc<dyn Broker> = primary;
    let health_checker = HealthChecker::new(
        Arc::clone(&api_broker),
        Arc::clone(&ledger),
        vec![
            config.notification_queue_name.clone(),
            config.failed_queue_name.clone(),
        ],
    )
    .with_circuit_breaker(breaker)
    .with_consumers(liveness);
    let publisher = Publisher::new(api_broker, config.notification_queue_name.clone());
    let state = Arc::new(AppState::new(publisher, health_checker));

    let api = tokio::spawn(run_api_server(
        config.server_port,
        state,
        shutdown_rx.clone(),
    ));

    wait_for_signal().await;
    info!("Shutdown requested, draining in-flight deliveries");
    let _ = shutdown_tx.send(true);

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Worker task panicked");
        }
    }

    match api.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }

    info!("Notification service stopped");
    Ok(())
}
