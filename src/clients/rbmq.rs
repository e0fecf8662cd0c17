use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    clients::broker::{Broker, Delivery, DeliveryStream},
    config::Config,
    errors::BrokerError,
    models::headers::{DeliveryHeaders, HeaderValue},
};

const PERSISTENT: u8 = 2;

/// Upper bound, in milliseconds, of the power-of-two bucket `delay` falls in.
pub fn delay_bucket_ms(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
        .checked_next_power_of_two()
        .unwrap_or(u64::MAX)
}

/// TTL queue that parks messages delayed by about `delay` before they return
/// to `queue`.
///
/// RabbitMQ only expires messages at the head of a queue, so delays share a
/// queue only with delays of the same bucket. A message can wait behind a
/// longer one by at most half its bucket.
pub fn delay_queue_name(queue: &str, delay: Duration) -> String {
    format!("{}.delay.{}ms", queue, delay_bucket_ms(delay))
}

/// RabbitMQ broker bound to a single channel.
///
/// Channels are not shared between workers; call [`RabbitMqClient::open_worker`]
/// to get a client with its own channel on the same connection.
pub struct RabbitMqClient {
    connection: Arc<Connection>,
    channel: Channel,
    prefetch_count: u16,
    consumer_tag: String,
    delay_queues: Mutex<HashSet<String>>,
}

impl RabbitMqClient {
    pub async fn connect(config: &Config) -> Result<Self, BrokerError> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        info!("RabbitMQ connection established");

        Self::with_channel(Arc::new(connection), config.prefetch_count, 0).await
    }

    /// A client with its own channel on this client's connection.
    pub async fn open_worker(&self, worker_id: usize) -> Result<Self, BrokerError> {
        Self::with_channel(
            Arc::clone(&self.connection),
            self.prefetch_count,
            worker_id,
        )
        .await
    }

    async fn with_channel(
        connection: Arc<Connection>,
        prefetch_count: u16,
        worker_id: usize,
    ) -> Result<Self, BrokerError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("channel creation failed: {}", e)))?;

        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to set QoS: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to enable confirms: {}", e)))?;

        debug!(worker_id, prefetch_count, "RabbitMQ channel created");

        Ok(Self {
            connection,
            channel,
            prefetch_count,
            consumer_tag: format!("notification_worker_{}", worker_id),
            delay_queues: Mutex::new(HashSet::new()),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Declare the delay queue for `delay`, whose expired messages
    /// dead-letter back into `queue`. Returns the delay queue's name.
    pub async fn declare_delay_queue(
        &self,
        queue: &str,
        delay: Duration,
    ) -> Result<String, BrokerError> {
        let name = delay_queue_name(queue, delay);

        let mut declared = self.delay_queues.lock().await;
        if declared.contains(&name) {
            return Ok(name);
        }

        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from("")),
        );
        arguments.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(queue)),
        );

        self.declare(&name, arguments).await?;
        declared.insert(name.clone());

        Ok(name)
    }

    async fn declare(&self, queue: &str, arguments: FieldTable) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| BrokerError::Declare {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        debug!(queue, "Queue declared");
        Ok(())
    }

    async fn basic_publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError> {
        let publish_err = |e: lapin::Error| BrokerError::Publish {
            queue: queue.to_string(),
            message: e.to_string(),
        };

        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(publish_err)?
            .await
            .map_err(publish_err)?;

        if confirmation.is_nack() {
            return Err(BrokerError::Publish {
                queue: queue.to_string(),
                message: "broker nacked the publish".to_string(),
            });
        }

        Ok(())
    }
}

fn to_field_table(headers: &DeliveryHeaders) -> FieldTable {
    let mut table = FieldTable::default();

    for (key, value) in headers.to_pairs() {
        let value = match value {
            HeaderValue::Text(s) => AMQPValue::LongString(LongString::from(s)),
            HeaderValue::Int(i) => AMQPValue::LongLongInt(i),
        };
        table.insert(ShortString::from(key), value);
    }

    table
}

fn from_field_table(table: Option<&FieldTable>) -> DeliveryHeaders {
    let Some(table) = table else {
        return DeliveryHeaders::default();
    };

    let pairs = table.inner().iter().filter_map(|(key, value)| {
        let value = match value {
            AMQPValue::LongString(s) => {
                HeaderValue::Text(String::from_utf8_lossy(s.as_bytes()).into_owned())
            }
            AMQPValue::ShortString(s) => HeaderValue::Text(s.as_str().to_string()),
            AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
            AMQPValue::LongInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::LongUInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::ShortInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::ShortUInt(i) => HeaderValue::Int(i64::from(*i)),
            _ => return None,
        };
        Some((key.as_str(), value))
    });

    DeliveryHeaders::from_pairs(pairs)
}

fn properties_for(headers: &DeliveryHeaders) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_content_type(ShortString::from("application/json"))
        .with_headers(to_field_table(headers));

    if let Some(message_id) = &headers.message_id {
        properties = properties.with_message_id(ShortString::from(message_id.as_str()));
    }

    properties
}

#[async_trait]
impl Broker for RabbitMqClient {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.declare(queue, FieldTable::default()).await
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        headers: &DeliveryHeaders,
    ) -> Result<(), BrokerError> {
        self.basic_publish(queue, payload, properties_for(headers))
            .await
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        payload: &[u8],
        headers: &DeliveryHeaders,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        if delay.is_zero() {
            return self.publish(queue, payload, headers).await;
        }

        let delay_queue = self.declare_delay_queue(queue, delay).await?;
        let expiration = ShortString::from(delay.as_millis().to_string());
        let properties = properties_for(headers).with_expiration(expiration);

        self.basic_publish(&delay_queue, payload, properties).await
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        info!(queue, consumer_tag = %self.consumer_tag, "Consumer created for queue");

        let stream = consumer.map(|result| {
            result
                .map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    headers: from_field_table(delivery.properties.headers().as_ref()),
                    redelivered: delivery.redelivered,
                    payload: delivery.data,
                })
                .map_err(|e| BrokerError::Consume(e.to_string()))
        });

        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Settle {
                delivery_tag,
                message: e.to_string(),
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| BrokerError::Settle {
                delivery_tag,
                message: e.to_string(),
            })
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32, BrokerError> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        Ok(declared.message_count())
    }
}
