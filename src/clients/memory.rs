use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    sync::{Mutex, Notify},
    time::Instant,
};
use tracing::debug;

use crate::{
    clients::broker::{Broker, Delivery, DeliveryStream},
    errors::BrokerError,
    models::headers::DeliveryHeaders,
};

/// A message sitting in an in-memory queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: Vec<u8>,
    pub headers: DeliveryHeaders,
    pub available_at: Instant,
    pub redelivered: bool,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    unacked: HashMap<u64, (String, QueuedMessage)>,
    next_tag: u64,
    acked: u64,
    rejected_queues: HashSet<String>,
}

enum Poll {
    Ready(Delivery),
    WaitUntil(Instant),
    Empty,
}

impl State {
    fn poll(&mut self, queue: &str, now: Instant) -> Poll {
        let Some(messages) = self.queues.get_mut(queue) else {
            return Poll::Empty;
        };

        match messages.iter().position(|m| m.available_at <= now) {
            Some(index) => {
                let Some(message) = messages.remove(index) else {
                    return Poll::Empty;
                };

                self.next_tag += 1;
                let delivery = Delivery {
                    delivery_tag: self.next_tag,
                    payload: message.payload.clone(),
                    headers: message.headers.clone(),
                    redelivered: message.redelivered,
                };
                self.unacked
                    .insert(self.next_tag, (queue.to_string(), message));

                Poll::Ready(delivery)
            }
            None => match messages.iter().map(|m| m.available_at).min() {
                Some(at) => Poll::WaitUntil(at),
                None => Poll::Empty,
            },
        }
    }
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    closed: AtomicBool,
}

/// Process-local broker with ack/nack semantics and delayed delivery.
///
/// Clones share the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the messages currently waiting in `queue`.
    pub async fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        let state = self.inner.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Pull the next ready delivery without waiting.
    pub async fn try_next(&self, queue: &str) -> Option<Delivery> {
        let mut state = self.inner.state.lock().await;
        match state.poll(queue, Instant::now()) {
            Poll::Ready(delivery) => Some(delivery),
            _ => None,
        }
    }

    pub async fn unacked_count(&self) -> usize {
        self.inner.state.lock().await.unacked.len()
    }

    pub async fn acked_count(&self) -> u64 {
        self.inner.state.lock().await.acked
    }

    /// Make every later publish to `queue` fail.
    pub async fn reject_publishes_to(&self, queue: &str) {
        let mut state = self.inner.state.lock().await;
        state.rejected_queues.insert(queue.to_string());
    }

    /// End all delivery streams. Pending messages stay queued.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    async fn enqueue(
        &self,
        queue: &str,
        payload: &[u8],
        headers: &DeliveryHeaders,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.inner.state.lock().await;

            if state.rejected_queues.contains(queue) {
                return Err(BrokerError::Publish {
                    queue: queue.to_string(),
                    message: "queue rejects publishes".to_string(),
                });
            }

            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(QueuedMessage {
                    payload: payload.to_vec(),
                    headers: headers.clone(),
                    available_at: Instant::now() + delay,
                    redelivered: false,
                });
        }

        debug!(queue, delay_ms = delay.as_millis() as u64, "Message enqueued in memory");
        self.inner.notify.notify_waiters();

        Ok(())
    }

    async fn next_delivery(inner: Arc<Inner>, queue: String) -> Option<Delivery> {
        loop {
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if inner.closed.load(Ordering::SeqCst) {
                return None;
            }

            let poll = {
                let mut state = inner.state.lock().await;
                state.poll(&queue, Instant::now())
            };

            match poll {
                Poll::Ready(delivery) => return Some(delivery),
                Poll::WaitUntil(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                Poll::Empty => notified.await,
            }
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().await;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        headers: &DeliveryHeaders,
    ) -> Result<(), BrokerError> {
        self.enqueue(queue, payload, headers, Duration::ZERO).await
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        payload: &[u8],
        headers: &DeliveryHeaders,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        self.enqueue(queue, payload, headers, delay).await
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        let stream = futures_util::stream::unfold(
            (Arc::clone(&self.inner), queue.to_string()),
            |(inner, queue)| async move {
                let delivery = Self::next_delivery(Arc::clone(&inner), queue.clone()).await?;
                Some((Ok(delivery), (inner, queue)))
            },
        );

        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().await;
        state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::Settle {
                delivery_tag,
                message: "unknown delivery tag".to_string(),
            })?;
        state.acked += 1;

        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        {
            let mut state = self.inner.state.lock().await;
            let (queue, mut message) =
                state
                    .unacked
                    .remove(&delivery_tag)
                    .ok_or_else(|| BrokerError::Settle {
                        delivery_tag,
                        message: "unknown delivery tag".to_string(),
                    })?;

            if !requeue {
                return Ok(());
            }

            message.redelivered = true;
            message.available_at = Instant::now();
            state.queues.entry(queue).or_default().push_front(message);
        }

        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32, BrokerError> {
        let state = self.inner.state.lock().await;
        let now = Instant::now();
        let depth = state
            .queues
            .get(queue)
            .map(|q| q.iter().filter(|m| m.available_at <= now).count())
            .unwrap_or(0);

        Ok(u32::try_from(depth).unwrap_or(u32::MAX))
    }
}
