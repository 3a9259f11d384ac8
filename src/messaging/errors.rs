//! # Transport Error Types
//!
//! Structured errors for broker operations, shared by every transport
//! implementation.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message not found: {queue_name}/{message_id}")]
    MessageNotFound { queue_name: String, message_id: i64 },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Invalid queue name: {queue_name}: {reason}")]
    InvalidQueueName { queue_name: String, reason: String },

    #[error("Subscription closed: {queue_name}")]
    SubscriptionClosed { queue_name: String },
}

impl TransportError {
    pub fn database_connection<S: Into<String>>(message: S) -> Self {
        Self::DatabaseConnection {
            message: message.into(),
        }
    }

    pub fn queue_operation<Q: Into<String>, O: Into<String>, M: Into<String>>(
        queue_name: Q,
        operation: O,
        message: M,
    ) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn queue_not_found<S: Into<String>>(queue_name: S) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    pub fn message_not_found<S: Into<String>>(queue_name: S, message_id: i64) -> Self {
        Self::MessageNotFound {
            queue_name: queue_name.into(),
            message_id,
        }
    }

    pub fn message_serialization<S: Into<String>>(message: S) -> Self {
        Self::MessageSerialization {
            message: message.into(),
        }
    }

    pub fn invalid_queue_name<Q: Into<String>, R: Into<String>>(queue_name: Q, reason: R) -> Self {
        Self::InvalidQueueName {
            queue_name: queue_name.into(),
            reason: reason.into(),
        }
    }

    pub fn subscription_closed<S: Into<String>>(queue_name: S) -> Self {
        Self::SubscriptionClosed {
            queue_name: queue_name.into(),
        }
    }
}

impl From<sqlx::Error> for TransportError {
    fn from(err: sqlx::Error) -> Self {
        Self::database_connection(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::message_serialization(err.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
