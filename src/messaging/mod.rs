//! # Messaging
//!
//! Broker access for the services: the [`Transport`] trait, its in-memory
//! and pgmq implementations, transactions and queue subscriptions.

pub mod errors;
pub mod in_memory;
pub mod pgmq;
pub mod subscription;
pub mod transport;
pub mod types;

use std::sync::Arc;

pub use errors::{TransportError, TransportResult};
pub use in_memory::{InMemoryTransport, PublishRecord, QueuedMessage};
pub use pgmq::PgmqTransport;
pub use subscription::{reinject_dead_letters, subscribe, Subscription, SubscriptionSettings};
pub use transport::Transport;
pub use types::{Delivery, DeliveryHeader, Transaction, TransportOperation};

use crate::clock::Clock;
use crate::config::{ConfigurationError, DlstbxConfig};

/// Build the transport selected by the configuration
pub async fn connect_transport(
    config: &DlstbxConfig,
    clock: Arc<dyn Clock>,
) -> crate::error::Result<Arc<dyn Transport>> {
    match config.transport.provider() {
        "memory" => Ok(Arc::new(InMemoryTransport::with_clock(clock))),
        "pgmq" => {
            let transport =
                PgmqTransport::connect(config.transport_url(), config.database.max_connections)
                    .await?;
            Ok(Arc::new(transport))
        }
        other => Err(ConfigurationError::unsupported_transport(
            other,
            crate::config::SUPPORTED_TRANSPORTS,
        )
        .into()),
    }
}
