//! # Transport Trait
//!
//! The narrow broker interface the runtime depends on. Implementations
//! provide queue creation, polling and an atomic `apply` of a batch of
//! operations; publishing, acknowledgement and transactions are built on
//! top of those three primitives.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::errors::TransportResult;
use super::types::{Delivery, DeliveryHeader, Transaction, TransportOperation};

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Short provider name used in logs
    fn provider_name(&self) -> &'static str;

    /// Create the queue (and its dead-letter queue) if it does not exist
    async fn ensure_queue(&self, queue: &str) -> TransportResult<()>;

    /// Fetch up to `max_messages` visible messages, hiding them for
    /// `visibility_timeout`
    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> TransportResult<Vec<Delivery>>;

    /// Apply operations atomically, in the given order
    async fn apply(&self, operations: Vec<TransportOperation>) -> TransportResult<()>;

    async fn send(
        &self,
        destination: &str,
        message: Value,
        delay: Option<Duration>,
        transaction: Option<&mut Transaction>,
    ) -> TransportResult<()> {
        let operation = TransportOperation::Send {
            destination: destination.to_string(),
            message,
            delay,
        };
        self.submit(operation, transaction).await
    }

    async fn broadcast(
        &self,
        destination: &str,
        message: Value,
        transaction: Option<&mut Transaction>,
    ) -> TransportResult<()> {
        let operation = TransportOperation::Broadcast {
            destination: destination.to_string(),
            message,
        };
        self.submit(operation, transaction).await
    }

    async fn ack(
        &self,
        header: &DeliveryHeader,
        transaction: Option<&mut Transaction>,
    ) -> TransportResult<()> {
        let operation = TransportOperation::Ack {
            header: header.clone(),
        };
        self.submit(operation, transaction).await
    }

    /// Negative acknowledgement: the message moves to the dead-letter queue
    async fn nack(
        &self,
        header: &DeliveryHeader,
        transaction: Option<&mut Transaction>,
    ) -> TransportResult<()> {
        let operation = TransportOperation::Nack {
            header: header.clone(),
        };
        self.submit(operation, transaction).await
    }

    fn transaction_begin(&self, subscription_id: Option<&str>) -> Transaction {
        let transaction = Transaction::new(subscription_id);
        debug!(
            transport = self.provider_name(),
            transaction_id = %transaction.id(),
            subscription_id = ?subscription_id,
            "Transaction started"
        );
        transaction
    }

    async fn transaction_commit(&self, transaction: Transaction) -> TransportResult<()> {
        let transaction_id = transaction.id();
        let operation_count = transaction.len();
        self.apply(transaction.into_ordered_operations()).await?;
        debug!(
            transport = self.provider_name(),
            transaction_id = %transaction_id,
            operation_count = operation_count,
            "Transaction committed"
        );
        Ok(())
    }

    fn transaction_abort(&self, transaction: Transaction) {
        debug!(
            transport = self.provider_name(),
            transaction_id = %transaction.id(),
            discarded_operations = transaction.len(),
            "Transaction aborted"
        );
    }

    /// Buffer the operation in the transaction, or apply it immediately
    async fn submit(
        &self,
        operation: TransportOperation,
        transaction: Option<&mut Transaction>,
    ) -> TransportResult<()> {
        match transaction {
            Some(transaction) => {
                transaction.push(operation);
                Ok(())
            }
            None => self.apply(vec![operation]).await,
        }
    }
}
