//! # In-Memory Transport
//!
//! Thread-safe in-process broker for tests and single-process deployments.
//!
//! - **Visibility timeout**: received messages are hidden until acked or
//!   until the timeout passes, after which they are redelivered
//! - **Delayed delivery**: checkpoints become visible after their delay
//! - **Dead-letter queues**: nacked messages move to `dlq_<queue>`
//! - **Publish log**: every send and broadcast is recorded for assertions
//!
//! Time is read from an injected [`Clock`], so tests can step through
//! delays without sleeping.
//!
//! ```rust
//! use dlstbx::messaging::{InMemoryTransport, Transport};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let transport = InMemoryTransport::new();
//! transport.send("trigger", json!({"dcid": 1}), None, None).await?;
//!
//! let deliveries = transport.receive("trigger", 10, Duration::from_secs(30)).await?;
//! assert_eq!(deliveries.len(), 1);
//! transport.ack(&deliveries[0].header, None).await?;
//! assert_eq!(transport.queue_length("trigger").await, 0);
//! # Ok::<(), dlstbx::messaging::TransportError>(())
//! # }).unwrap();
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::errors::{TransportError, TransportResult};
use super::transport::Transport;
use super::types::{Delivery, DeliveryHeader, TransportOperation};
use crate::clock::{epoch_to_utc, Clock, SystemClock};
use crate::constants::queues;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    message: Value,
    enqueued_at: DateTime<Utc>,
    /// Epoch seconds from which the message may be received
    visible_at: f64,
    delay: Option<Duration>,
    receive_count: u32,
}

/// A message removed from a queue by [`InMemoryTransport::take_messages`]
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub message: Value,
    /// Scheduled-delivery hint the message was published with
    pub delay: Option<Duration>,
}

/// Record of one publish, in commit order
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRecord {
    pub destination: String,
    pub message: Value,
    pub delay: Option<Duration>,
    pub broadcast: bool,
}

#[derive(Debug)]
pub struct InMemoryTransport {
    queues: RwLock<HashMap<String, VecDeque<StoredMessage>>>,
    next_id: AtomicI64,
    clock: Arc<dyn Clock>,
    publish_log: Mutex<Vec<PublishRecord>>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            clock,
            publish_log: Mutex::new(Vec::new()),
        }
    }

    /// Number of messages held in a queue, visible or not
    pub async fn queue_length(&self, queue: &str) -> usize {
        self.queues.read().await.get(queue).map_or(0, VecDeque::len)
    }

    /// Remove and return every message in a queue regardless of visibility
    pub async fn take_messages(&self, queue: &str) -> Vec<QueuedMessage> {
        let mut queues = self.queues.write().await;
        queues
            .get_mut(queue)
            .map(|messages| {
                messages
                    .drain(..)
                    .map(|stored| QueuedMessage {
                        message: stored.message,
                        delay: stored.delay,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Copies of the messages parked in a queue's dead-letter queue
    pub async fn dead_letters(&self, queue: &str) -> Vec<Value> {
        let dlq = queues::dead_letter_queue(queue);
        self.queues
            .read()
            .await
            .get(&dlq)
            .map(|messages| messages.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<PublishRecord> {
        self.publish_log.lock().clone()
    }

    /// Published messages addressed to one destination
    pub fn published_to(&self, destination: &str) -> Vec<Value> {
        self.publish_log
            .lock()
            .iter()
            .filter(|record| record.destination == destination)
            .map(|record| record.message.clone())
            .collect()
    }

    pub fn clear_publish_log(&self) {
        self.publish_log.lock().clear();
    }

    fn enqueue(
        &self,
        queues: &mut HashMap<String, VecDeque<StoredMessage>>,
        destination: &str,
        message: Value,
        delay: Option<Duration>,
    ) -> i64 {
        let now = self.clock.epoch_secs();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        queues
            .entry(destination.to_string())
            .or_default()
            .push_back(StoredMessage {
                id,
                message,
                enqueued_at: epoch_to_utc(now),
                visible_at: now + delay.map_or(0.0, |d| d.as_secs_f64()),
                delay,
                receive_count: 0,
            });
        id
    }

    fn check_settlement(
        queues: &HashMap<String, VecDeque<StoredMessage>>,
        header: &DeliveryHeader,
    ) -> TransportResult<()> {
        let messages = queues
            .get(&header.queue)
            .ok_or_else(|| TransportError::queue_not_found(&header.queue))?;
        if messages.iter().any(|m| m.id == header.message_id) {
            Ok(())
        } else {
            Err(TransportError::message_not_found(
                &header.queue,
                header.message_id,
            ))
        }
    }

    fn remove(
        queues: &mut HashMap<String, VecDeque<StoredMessage>>,
        header: &DeliveryHeader,
    ) -> Option<StoredMessage> {
        let messages = queues.get_mut(&header.queue)?;
        let position = messages.iter().position(|m| m.id == header.message_id)?;
        messages.remove(position)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn provider_name(&self) -> &'static str {
        "memory"
    }

    async fn ensure_queue(&self, queue: &str) -> TransportResult<()> {
        if queue.is_empty() {
            return Err(TransportError::invalid_queue_name(
                queue,
                "queue names must not be empty",
            ));
        }
        let mut queues = self.queues.write().await;
        queues.entry(queue.to_string()).or_default();
        queues.entry(queues::dead_letter_queue(queue)).or_default();
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> TransportResult<Vec<Delivery>> {
        let now = self.clock.epoch_secs();
        let mut queues = self.queues.write().await;
        let messages = queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::queue_not_found(queue))?;

        let mut received = Vec::new();
        for stored in messages.iter_mut() {
            if received.len() >= max_messages {
                break;
            }
            if stored.visible_at > now {
                continue;
            }
            stored.visible_at = now + visibility_timeout.as_secs_f64();
            stored.receive_count += 1;

            let header = DeliveryHeader::new(queue, stored.id, stored.receive_count)
                .with_enqueued_at(stored.enqueued_at)
                .with_message_headers(&stored.message);
            received.push(Delivery {
                header,
                message: stored.message.clone(),
            });
        }

        if !received.is_empty() {
            trace!(queue = %queue, count = received.len(), "Received messages");
        }
        Ok(received)
    }

    async fn apply(&self, operations: Vec<TransportOperation>) -> TransportResult<()> {
        let mut queues = self.queues.write().await;

        // Validate every settlement first so a failing batch changes nothing
        for operation in &operations {
            if let TransportOperation::Ack { header } | TransportOperation::Nack { header } =
                operation
            {
                Self::check_settlement(&queues, header)?;
            }
        }

        for operation in operations {
            match operation {
                TransportOperation::Send {
                    destination,
                    message,
                    delay,
                } => {
                    self.publish_log.lock().push(PublishRecord {
                        destination: destination.clone(),
                        message: message.clone(),
                        delay,
                        broadcast: false,
                    });
                    self.enqueue(&mut queues, &destination, message, delay);
                }
                TransportOperation::Broadcast {
                    destination,
                    message,
                } => {
                    self.publish_log.lock().push(PublishRecord {
                        destination: destination.clone(),
                        message: message.clone(),
                        delay: None,
                        broadcast: true,
                    });
                    self.enqueue(&mut queues, &destination, message, None);
                }
                TransportOperation::Ack { header } => {
                    Self::remove(&mut queues, &header);
                    trace!(queue = %header.queue, message_id = header.message_id, "Acked");
                }
                TransportOperation::Nack { header } => {
                    if let Some(stored) = Self::remove(&mut queues, &header) {
                        let dlq = queues::dead_letter_queue(&header.queue);
                        self.enqueue(&mut queues, &dlq, stored.message, None);
                        debug!(
                            queue = %header.queue,
                            message_id = header.message_id,
                            dead_letter_queue = %dlq,
                            "Nacked message moved to dead-letter queue"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
