//! # PGMQ Transport
//!
//! Broker backed by the PostgreSQL `pgmq` extension. A batch of operations is
//! applied inside one database transaction, so publishes and the ack of the
//! triggering message become visible together or not at all.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, info};

use super::errors::{TransportError, TransportResult};
use super::transport::Transport;
use super::types::{Delivery, DeliveryHeader, TransportOperation};
use crate::constants::queues;

/// Longest queue name pgmq accepts once its table prefixes are added
const MAX_QUEUE_NAME_LENGTH: usize = 47;

#[derive(Debug, Clone)]
pub struct PgmqTransport {
    pool: PgPool,
    known_queues: Arc<RwLock<HashSet<String>>>,
}

impl PgmqTransport {
    /// Connect with a dedicated pool
    pub async fn connect(database_url: &str, max_connections: u32) -> TransportResult<Self> {
        info!("Connecting pgmq transport");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::with_pool(pool))
    }

    /// Share an existing connection pool
    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            known_queues: Default::default(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn validate_queue_name(queue: &str) -> TransportResult<()> {
        if queue.is_empty() {
            return Err(TransportError::invalid_queue_name(
                queue,
                "queue names must not be empty",
            ));
        }
        if queue.len() > MAX_QUEUE_NAME_LENGTH {
            return Err(TransportError::invalid_queue_name(
                queue,
                format!("longer than {MAX_QUEUE_NAME_LENGTH} characters"),
            ));
        }
        if !queue
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(TransportError::invalid_queue_name(
                queue,
                "only ASCII letters, digits and underscores are allowed",
            ));
        }
        Ok(())
    }

    async fn create_queue<'e, E>(&self, executor: E, queue: &str) -> TransportResult<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        Self::validate_queue_name(queue)?;
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue)
            .execute(executor)
            .await
            .map_err(|e| TransportError::queue_operation(queue, "create", e.to_string()))?;
        Ok(())
    }

    async fn send_in(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        queue: &str,
        message: &Value,
        delay: Option<Duration>,
    ) -> TransportResult<()> {
        if !self.known_queues.read().contains(queue) {
            self.create_queue(&mut **tx, queue).await?;
        }
        let delay_seconds = delay.map_or(0, |d| d.as_secs_f64().ceil() as i32);
        sqlx::query("SELECT pgmq.send($1, $2, $3)")
            .bind(queue)
            .bind(Json(message))
            .bind(delay_seconds)
            .execute(&mut **tx)
            .await
            .map_err(|e| TransportError::queue_operation(queue, "send", e.to_string()))?;
        Ok(())
    }

    async fn delete_in(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        header: &DeliveryHeader,
    ) -> TransportResult<()> {
        let deleted: bool = sqlx::query_scalar("SELECT pgmq.delete($1, $2)")
            .bind(&header.queue)
            .bind(header.message_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| TransportError::queue_operation(&header.queue, "delete", e.to_string()))?;
        if deleted {
            Ok(())
        } else {
            Err(TransportError::message_not_found(
                &header.queue,
                header.message_id,
            ))
        }
    }

    async fn fetch_message(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        header: &DeliveryHeader,
    ) -> TransportResult<Value> {
        let table = format!("pgmq.q_{}", header.queue);
        Self::validate_queue_name(&header.queue)?;
        let row = sqlx::query(&format!("SELECT message FROM {table} WHERE msg_id = $1"))
            .bind(header.message_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| TransportError::message_not_found(&header.queue, header.message_id))?;
        let Json(message): Json<Value> = row.try_get("message")?;
        Ok(message)
    }
}

#[async_trait]
impl Transport for PgmqTransport {
    fn provider_name(&self) -> &'static str {
        "pgmq"
    }

    async fn ensure_queue(&self, queue: &str) -> TransportResult<()> {
        let dlq = queues::dead_letter_queue(queue);
        for name in [queue, dlq.as_str()] {
            if self.known_queues.read().contains(name) {
                continue;
            }
            self.create_queue(&self.pool, name).await?;
            self.known_queues.write().insert(name.to_string());
            debug!(queue = %name, "Queue ensured");
        }
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> TransportResult<Vec<Delivery>> {
        let rows = sqlx::query(
            "SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, $3)",
        )
        .bind(queue)
        .bind(visibility_timeout.as_secs() as i32)
        .bind(max_messages as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TransportError::queue_operation(queue, "read", e.to_string()))?;

        rows.into_iter()
            .map(|row| -> TransportResult<Delivery> {
                let message_id: i64 = row.try_get("msg_id")?;
                let read_count: i32 = row.try_get("read_ct")?;
                let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at")?;
                let Json(message): Json<Value> = row.try_get("message")?;
                let header = DeliveryHeader::new(queue, message_id, read_count.max(0) as u32)
                    .with_enqueued_at(enqueued_at)
                    .with_message_headers(&message);
                Ok(Delivery { header, message })
            })
            .collect()
    }

    async fn apply(&self, operations: Vec<TransportOperation>) -> TransportResult<()> {
        if operations.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::new();

        for operation in &operations {
            match operation {
                TransportOperation::Send {
                    destination,
                    message,
                    delay,
                } => {
                    self.send_in(&mut tx, destination, message, *delay).await?;
                    created.push(destination.clone());
                }
                TransportOperation::Broadcast {
                    destination,
                    message,
                } => {
                    self.send_in(&mut tx, destination, message, None).await?;
                    created.push(destination.clone());
                }
                TransportOperation::Ack { header } => {
                    Self::delete_in(&mut tx, header).await?;
                }
                TransportOperation::Nack { header } => {
                    let message = Self::fetch_message(&mut tx, header).await?;
                    let dlq = queues::dead_letter_queue(&header.queue);
                    self.send_in(&mut tx, &dlq, &message, None).await?;
                    Self::delete_in(&mut tx, header).await?;
                    created.push(dlq);
                    debug!(
                        queue = %header.queue,
                        message_id = header.message_id,
                        "Nacked message moved to dead-letter queue"
                    );
                }
            }
        }

        tx.commit().await?;
        self.known_queues.write().extend(created);
        Ok(())
    }
}
