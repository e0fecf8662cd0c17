use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::{errors::BrokerError, models::headers::DeliveryHeaders};

/// One message handed to a worker, unsettled until acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub headers: DeliveryHeaders,
    pub redelivered: bool,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Acknowledgement-based queue broker.
///
/// Implementations:
/// - `RabbitMqClient`: AMQP 0.9.1 via lapin, one channel per instance
/// - `InMemoryBroker`: process-local queues for tests and local runs
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a durable queue. Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Publish a persistent message and wait for the broker's confirmation.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        headers: &DeliveryHeaders,
    ) -> Result<(), BrokerError>;

    /// Publish a message that must not be delivered before `delay` elapses.
    ///
    /// Brokers without delayed delivery publish immediately.
    async fn publish_delayed(
        &self,
        queue: &str,
        payload: &[u8],
        headers: &DeliveryHeaders,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let _ = delay;
        self.publish(queue, payload, headers).await
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Number of ready messages in `queue`.
    async fn queue_depth(&self, queue: &str) -> Result<u32, BrokerError>;
}
