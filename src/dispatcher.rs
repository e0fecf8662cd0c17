//! Consumer side: one delivery at a time through
//! dedup → decode → send → ack | requeue | defer | dead-letter | discard.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    clients::{
        broker::{Broker, Delivery},
        email::NotificationSender,
        ledger::IdempotencyLedger,
    },
    codec,
    config::Config,
    errors::{BrokerError, SendError},
    models::{
        headers::DeliveryHeaders,
        message::OutboundNotification,
        retry::{BackoffPolicy, RetryConfig, RetrySchedule},
        status::{ClaimOutcome, ClaimToken, Disposition, LedgerStatus},
    },
    utils::retry_with_backoff,
};

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub queue: String,
    pub dead_letter_queue: String,
    pub backoff: BackoffPolicy,
    pub delayed_retry: bool,
    pub send_timeout: Duration,
    pub processing_lease: Duration,
    pub ledger_retry: RetryConfig,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue: config.notification_queue_name.clone(),
            dead_letter_queue: config.failed_queue_name.clone(),
            backoff: config.backoff_policy(),
            delayed_retry: config.delayed_retry,
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            processing_lease: Duration::from_secs(config.processing_lease_seconds),
            ledger_retry: config.retry_config(),
        }
    }
}

/// Whether the failing worker holds the ledger claim for the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim<'a> {
    Held(&'a ClaimToken),
    NotHeld,
}

pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    sender: Arc<dyn NotificationSender>,
    ledger: Arc<dyn IdempotencyLedger>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        sender: Arc<dyn NotificationSender>,
        ledger: Arc<dyn IdempotencyLedger>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            broker,
            sender,
            ledger,
            settings,
        }
    }

    /// Consume the main queue until the stream ends or `shutdown` flips.
    ///
    /// A delivery that is already being handled is finished before the loop
    /// exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        let mut deliveries = self.broker.consume(&self.settings.queue).await?;
        info!(queue = %self.settings.queue, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => match self.handle(delivery).await {
                    Ok(disposition) => debug!(disposition = %disposition, "Delivery settled"),
                    Err(e) => error!(error = %e, "Failed to settle delivery"),
                },
                Some(Err(e)) => {
                    error!(error = %e, "Delivery stream failed");
                    return Err(e);
                }
                None => {
                    info!(queue = %self.settings.queue, "Delivery stream closed");
                    break;
                }
            }
        }

        info!(queue = %self.settings.queue, "Worker stopped");
        Ok(())
    }

    /// Process one delivery and settle it with the broker.
    pub async fn handle(&self, delivery: Delivery) -> Result<Disposition, BrokerError> {
        let message_id = match &delivery.headers.message_id {
            Some(id) => id.clone(),
            None => match codec::decode(&delivery.payload) {
                Ok(envelope) => envelope.message_id,
                Err(e) => return self.discard(&delivery, None, e.to_string()).await,
            },
        };

        let span = info_span!(
            "dispatch",
            message_id = %message_id,
            retry_count = delivery.headers.retry_count,
            delivery_tag = delivery.delivery_tag,
        );

        self.process(&delivery, &message_id).instrument(span).await
    }

    async fn process(
        &self,
        delivery: &Delivery,
        message_id: &str,
    ) -> Result<Disposition, BrokerError> {
        let token = match self
            .ledger
            .try_claim(message_id, self.settings.processing_lease)
            .await
        {
            Ok(ClaimOutcome::Claimed(token)) => token,
            Ok(ClaimOutcome::Settled(status)) => {
                info!(status = %status, "Message already processed, skipping");
                self.broker.ack(delivery.delivery_tag).await?;
                return Ok(Disposition::Duplicate(status));
            }
            Ok(ClaimOutcome::InFlight) => return self.defer(delivery, message_id).await,
            Err(e) => {
                warn!(error = %e, "Idempotency ledger unavailable");
                return self
                    .retry_or_dead_letter(
                        delivery,
                        message_id,
                        format!("Idempotency ledger unavailable: {}", e),
                        Claim::NotHeld,
                    )
                    .await;
            }
        };
        let claim = Claim::Held(&token);

        let outbound = match codec::decode(&delivery.payload)
            .and_then(|envelope| OutboundNotification::from_envelope(&envelope))
        {
            Ok(outbound) => outbound,
            Err(e) => {
                self.release(message_id, &token).await;
                return self.discard(delivery, Some(message_id), e.to_string()).await;
            }
        };

        let result = tokio::time::timeout(self.settings.send_timeout, self.sender.send(&outbound))
            .await
            .unwrap_or_else(|_| {
                Err(SendError::Transient(format!(
                    "Send timed out after {}ms",
                    self.settings.send_timeout.as_millis()
                )))
            });

        match result {
            Ok(()) => {
                self.settle(message_id, LedgerStatus::Delivered).await;
                self.broker.ack(delivery.delivery_tag).await?;
                info!(recipient = %outbound.recipient, "Notification delivered");
                Ok(Disposition::Delivered)
            }
            Err(SendError::Transient(reason)) => {
                self.release(message_id, &token).await;
                self.retry_or_dead_letter(delivery, message_id, reason, claim)
                    .await
            }
            Err(SendError::Permanent(reason)) => {
                warn!(reason = %reason, "Notification rejected by sender");
                self.dead_letter(delivery, message_id, reason, claim).await
            }
        }
    }

    /// Park a message whose id is leased by another worker until that lease
    /// can have lapsed. The retry count is unchanged.
    async fn defer(
        &self,
        delivery: &Delivery,
        message_id: &str,
    ) -> Result<Disposition, BrokerError> {
        let delay = self.settings.processing_lease;
        let next_retry_at = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);

        let mut headers = DeliveryHeaders {
            next_retry_at,
            ..delivery.headers.clone()
        };
        headers.message_id.get_or_insert_with(|| message_id.to_string());

        if let Err(e) = self
            .broker
            .publish_delayed(&self.settings.queue, &delivery.payload, &headers, delay)
            .await
        {
            error!(error = %e, "Failed to park in-flight message, returning it to the broker");
            self.broker.nack(delivery.delivery_tag, true).await?;
            return Ok(Disposition::Returned);
        }

        self.broker.ack(delivery.delivery_tag).await?;

        info!(
            delay_ms = delay.as_millis() as u64,
            "Message is being processed elsewhere, deferred"
        );

        Ok(Disposition::Deferred { delay })
    }

    async fn retry_or_dead_letter(
        &self,
        delivery: &Delivery,
        message_id: &str,
        reason: String,
        claim: Claim<'_>,
    ) -> Result<Disposition, BrokerError> {
        let retry_count = delivery.headers.retry_count;
        let backoff = &self.settings.backoff;

        if backoff.is_exhausted(retry_count) {
            let reason = format!("Retries exhausted after {} attempts: {}", retry_count, reason);
            return self.dead_letter(delivery, message_id, reason, claim).await;
        }

        let delay = backoff.delay(retry_count);
        let now = Utc::now();
        let schedule = RetrySchedule::plan(now, delay, self.settings.delayed_retry);
        let next_retry_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);

        let mut headers = delivery.headers.next_attempt(next_retry_at);
        headers.message_id.get_or_insert_with(|| message_id.to_string());

        let republished = match schedule {
            RetrySchedule::Immediate => {
                self.broker
                    .publish(&self.settings.queue, &delivery.payload, &headers)
                    .await
            }
            RetrySchedule::DelayedUntil(_) => {
                self.broker
                    .publish_delayed(
                        &self.settings.queue,
                        &delivery.payload,
                        &headers,
                        schedule.remaining(now),
                    )
                    .await
            }
        };

        if let Err(e) = republished {
            error!(error = %e, "Failed to requeue message, returning it to the broker");
            self.broker.nack(delivery.delivery_tag, true).await?;
            return Ok(Disposition::Returned);
        }

        self.broker.ack(delivery.delivery_tag).await?;

        warn!(
            reason = %reason,
            next_retry_count = headers.retry_count,
            delay_ms = delay.as_millis() as u64,
            "Notification attempt failed, requeued"
        );

        Ok(Disposition::Requeued {
            retry_count: headers.retry_count,
            delay,
        })
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        message_id: &str,
        reason: String,
        claim: Claim<'_>,
    ) -> Result<Disposition, BrokerError> {
        let mut headers =
            delivery
                .headers
                .dead_lettered(&self.settings.queue, Utc::now(), reason.clone());
        headers.message_id.get_or_insert_with(|| message_id.to_string());

        match self
            .broker
            .publish(&self.settings.dead_letter_queue, &delivery.payload, &headers)
            .await
        {
            Ok(()) => {
                if let Claim::Held(_) = claim {
                    self.settle(message_id, LedgerStatus::DeadLettered).await;
                }
                self.broker.ack(delivery.delivery_tag).await?;

                warn!(
                    reason = %reason,
                    dead_letter_queue = %self.settings.dead_letter_queue,
                    "Notification moved to dead letter queue"
                );
                Ok(Disposition::DeadLettered { reason })
            }
            Err(e) => {
                error!(
                    error = %e,
                    reason = %reason,
                    "Failed to publish to dead letter queue, discarding message"
                );
                if let Claim::Held(token) = claim {
                    self.release(message_id, token).await;
                }
                self.broker.ack(delivery.delivery_tag).await?;

                Ok(Disposition::Discarded {
                    reason: format!("Dead letter publish failed: {}", e),
                })
            }
        }
    }

    async fn discard(
        &self,
        delivery: &Delivery,
        message_id: Option<&str>,
        reason: String,
    ) -> Result<Disposition, BrokerError> {
        warn!(
            message_id = ?message_id,
            delivery_tag = delivery.delivery_tag,
            reason = %reason,
            "Discarding malformed notification"
        );

        self.broker.ack(delivery.delivery_tag).await?;
        Ok(Disposition::Discarded { reason })
    }

    async fn settle(&self, message_id: &str, status: LedgerStatus) {
        let ledger = &self.ledger;

        let settled = retry_with_backoff("ledger settle", &self.settings.ledger_retry, || {
            ledger.settle(message_id, status)
        })
        .await;

        if let Err(e) = settled {
            error!(error = %e, status = %status, "Failed to record message outcome in ledger");
        }
    }

    async fn release(&self, message_id: &str, token: &ClaimToken) {
        if let Err(e) = self.ledger.release(message_id, token).await {
            warn!(error = %e, "Failed to release ledger claim, it will lapse on its own");
        }
    }
}
