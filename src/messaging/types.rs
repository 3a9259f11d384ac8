//! # Transport Types
//!
//! Deliveries, delivery headers and the buffered operations that make up a
//! transport transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::constants::envelope;

/// Broker metadata of one in-flight message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryHeader {
    /// Queue the message was received from
    pub queue: String,
    /// Broker-assigned message identifier
    pub message_id: i64,
    /// Subscription that received the message
    pub subscription_id: Option<String>,
    /// The broker delivered this message before without an ack
    pub redelivered: bool,
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
    /// The message was moved back out of a dead-letter queue
    pub dlq_reinjected: bool,
}

impl DeliveryHeader {
    pub fn new(queue: impl Into<String>, message_id: i64, receive_count: u32) -> Self {
        Self {
            queue: queue.into(),
            message_id,
            subscription_id: None,
            redelivered: receive_count > 1,
            receive_count,
            enqueued_at: Utc::now(),
            dlq_reinjected: false,
        }
    }

    pub fn with_enqueued_at(mut self, enqueued_at: DateTime<Utc>) -> Self {
        self.enqueued_at = enqueued_at;
        self
    }

    /// Pick up flags carried in the message's own `headers` map
    pub fn with_message_headers(mut self, message: &Value) -> Self {
        self.dlq_reinjected = message
            .get(envelope::HEADERS)
            .and_then(|headers| headers.get(envelope::DLQ_REINJECTED))
            .is_some_and(is_truthy);
        self
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// A received message and its broker metadata
#[derive(Debug, Clone)]
pub struct Delivery {
    pub header: DeliveryHeader,
    pub message: Value,
}

/// One broker side effect, applied immediately or as part of a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOperation {
    Send {
        destination: String,
        message: Value,
        /// Scheduled-delivery hint
        delay: Option<Duration>,
    },
    Broadcast {
        destination: String,
        message: Value,
    },
    Ack {
        header: DeliveryHeader,
    },
    Nack {
        header: DeliveryHeader,
    },
}

impl TransportOperation {
    pub fn is_publish(&self) -> bool {
        matches!(self, Self::Send { .. } | Self::Broadcast { .. })
    }

    pub fn operation_name(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Broadcast { .. } => "broadcast",
            Self::Ack { .. } => "ack",
            Self::Nack { .. } => "nack",
        }
    }
}

/// Buffered group of operations committed or discarded together
///
/// Dropping a transaction without committing it discards everything it holds.
#[derive(Debug)]
pub struct Transaction {
    id: Uuid,
    subscription_id: Option<String>,
    operations: Vec<TransportOperation>,
}

impl Transaction {
    pub fn new(subscription_id: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id: subscription_id.map(str::to_string),
            operations: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    pub fn push(&mut self, operation: TransportOperation) {
        self.operations.push(operation);
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[TransportOperation] {
        &self.operations
    }

    /// Operations in commit order: publishes first, then ack/nack, each group
    /// keeping its original order
    pub fn into_ordered_operations(self) -> Vec<TransportOperation> {
        let (mut publishes, settlements): (Vec<_>, Vec<_>) = self
            .operations
            .into_iter()
            .partition(TransportOperation::is_publish);
        publishes.extend(settlements);
        publishes
    }
}
