//! # Subscriptions
//!
//! A subscription is a background poller that feeds deliveries from one queue
//! into a bounded channel consumed by the service runtime.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::errors::TransportResult;
use super::transport::Transport;
use super::types::Delivery;
use crate::config::TransportConfig;
use crate::constants::{envelope, queues};

/// Polling parameters of one subscription
#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    pub batch_size: usize,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for SubscriptionSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            visibility_timeout: config.visibility_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Handle on a running subscription
#[derive(Debug)]
pub struct Subscription {
    id: String,
    queue: String,
    receiver: mpsc::Receiver<Delivery>,
    shutdown: Arc<Notify>,
    poller: JoinHandle<()>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Next delivery; `None` once the poller has stopped
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Stop polling; deliveries already buffered remain readable
    pub async fn unsubscribe(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.poller.await {
            warn!(queue = %self.queue, error = %e, "Subscription poller ended abnormally");
        }
        debug!(queue = %self.queue, subscription_id = %self.id, "Unsubscribed");
    }
}

/// Register a consumer on `queue`
///
/// With `acknowledgement` disabled every delivery is acked as soon as it is
/// received; otherwise the handler must ack or nack it and the broker
/// redelivers anything left unsettled past the visibility timeout.
pub async fn subscribe(
    transport: Arc<dyn Transport>,
    queue: &str,
    acknowledgement: bool,
    settings: SubscriptionSettings,
) -> TransportResult<Subscription> {
    transport.ensure_queue(queue).await?;

    let id = Uuid::new_v4().to_string();
    let (sender, receiver) = mpsc::channel(settings.batch_size.max(1));
    let shutdown = Arc::new(Notify::new());

    let poller = tokio::spawn(poll_queue(
        transport,
        queue.to_string(),
        id.clone(),
        acknowledgement,
        settings,
        sender,
        shutdown.clone(),
    ));

    info!(queue = %queue, subscription_id = %id, acknowledgement, "Subscribed");
    Ok(Subscription {
        id,
        queue: queue.to_string(),
        receiver,
        shutdown,
        poller,
    })
}

async fn poll_queue(
    transport: Arc<dyn Transport>,
    queue: String,
    subscription_id: String,
    acknowledgement: bool,
    settings: SubscriptionSettings,
    sender: mpsc::Sender<Delivery>,
    shutdown: Arc<Notify>,
) {
    loop {
        let batch = tokio::select! {
            _ = shutdown.notified() => break,
            batch = transport.receive(&queue, settings.batch_size, settings.visibility_timeout) => batch,
        };

        let deliveries = match batch {
            Ok(deliveries) => deliveries,
            Err(e) => {
                warn!(queue = %queue, error = %e, "Receive failed, backing off");
                Vec::new()
            }
        };

        if deliveries.is_empty() {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = tokio::time::sleep(settings.poll_interval) => continue,
            }
        }

        for mut delivery in deliveries {
            delivery.header.subscription_id = Some(subscription_id.clone());
            if !acknowledgement {
                if let Err(e) = transport.ack(&delivery.header, None).await {
                    warn!(queue = %queue, error = %e, "Auto-ack failed");
                    continue;
                }
            }
            if sender.send(delivery).await.is_err() {
                debug!(queue = %queue, "Subscription receiver dropped, stopping poller");
                return;
            }
        }
    }
    debug!(queue = %queue, subscription_id = %subscription_id, "Poller stopped");
}

/// Move up to `limit` messages from `dlq_<queue>` back onto `queue`
///
/// Each message is stamped with the `dlq-reinjected` header so handlers can
/// tell it apart from a first delivery. Returns the number reinjected.
pub async fn reinject_dead_letters(
    transport: &dyn Transport,
    queue: &str,
    limit: usize,
) -> TransportResult<usize> {
    let dlq = queues::dead_letter_queue(queue);
    transport.ensure_queue(queue).await?;

    let mut reinjected = 0;
    while reinjected < limit {
        let deliveries = transport
            .receive(&dlq, limit - reinjected, Duration::from_secs(60))
            .await?;
        if deliveries.is_empty() {
            break;
        }
        for delivery in deliveries {
            let mut message = delivery.message;
            mark_reinjected(&mut message);

            let mut transaction = transport.transaction_begin(None);
            transport
                .send(queue, message, None, Some(&mut transaction))
                .await?;
            transport
                .ack(&delivery.header, Some(&mut transaction))
                .await?;
            transport.transaction_commit(transaction).await?;
            reinjected += 1;
        }
    }

    if reinjected > 0 {
        info!(queue = %queue, count = reinjected, "Reinjected dead-lettered messages");
    }
    Ok(reinjected)
}

fn mark_reinjected(message: &mut Value) {
    if let Value::Object(map) = message {
        let headers = map
            .entry(envelope::HEADERS)
            .or_insert_with(|| Value::Object(Default::default()));
        if !headers.is_object() {
            *headers = Value::Object(Default::default());
        }
        if let Value::Object(headers) = headers {
            headers.insert(envelope::DLQ_REINJECTED.to_string(), Value::Bool(true));
        }
    }
}
