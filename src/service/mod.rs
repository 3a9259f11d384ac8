//! # Service Runtime
//!
//! Long-lived consumers. A [`CommonService`] names the queue it consumes and
//! handles one delivery at a time; [`ServiceRuntime`] subscribes to that queue
//! and runs a bounded pool of concurrent handler invocations.
//!
//! ## Failure handling
//!
//! A handler owns its transport transaction. When it returns an error the
//! runtime nacks the delivery, which moves it to the dead-letter queue.
//! Errors caused by the message itself (see
//! [`DlstbxError::is_malformed`](crate::error::DlstbxError::is_malformed))
//! stop there. Any other error also asks the instance to terminate, unless
//! the service opts out; a supervisor is expected to start a fresh one.

pub mod runtime;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::error;

use crate::clock::Clock;
use crate::messaging::{Delivery, Transport};
use crate::recipe::{RecipeResult, RecipeWrapper};

pub use runtime::{dispatch_delivery, ServiceExit, ServiceRuntime};

#[derive(Error, Debug)]
pub enum ServiceError {
    /// The message can never be processed; it is nacked without termination
    #[error("Malformed message: {reason}")]
    Malformed { reason: String },

    #[error("Unknown service '{name}'")]
    UnknownService { name: String },

    #[error("Service startup failed: {message}")]
    Startup { message: String },
}

impl ServiceError {
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    pub fn unknown_service<S: Into<String>>(name: S) -> Self {
        Self::UnknownService { name: name.into() }
    }

    pub fn startup<S: Into<String>>(message: S) -> Self {
        Self::Startup {
            message: message.into(),
        }
    }
}

/// Shared handles passed to every handler invocation
#[derive(Debug, Clone)]
pub struct ServiceContext {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    shutdown: Arc<Notify>,
    termination_requested: Arc<AtomicBool>,
}

impl ServiceContext {
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            clock,
            shutdown: Arc::new(Notify::new()),
            termination_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Interpret a delivery as a recipe message
    pub fn recipe_wrapper(&self, delivery: &Delivery) -> RecipeResult<RecipeWrapper> {
        RecipeWrapper::from_envelope(&delivery.message, self.transport.clone())
    }

    /// Stop consuming; in-flight messages are allowed to finish
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// Stop consuming and exit with a failure status
    pub fn request_termination(&self, reason: &str) {
        error!(reason = %reason, "Service instance requested termination");
        self.termination_requested.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub fn termination_requested(&self) -> bool {
        self.termination_requested.load(Ordering::SeqCst)
    }

    pub(crate) async fn stopped(&self) {
        self.shutdown.notified().await;
    }
}

/// A message handler bound to one queue
#[async_trait]
pub trait CommonService: Send + Sync + std::fmt::Debug {
    /// Name used in logs and on the command line
    fn name(&self) -> &'static str;

    /// Queue the service consumes
    fn queue(&self) -> String;

    /// Whether deliveries must be settled by the handler
    fn acknowledgement(&self) -> bool {
        true
    }

    /// Terminate the instance on a handler error that is not a malformed message
    fn terminate_on_failure(&self) -> bool {
        true
    }

    /// Runs once before the subscription is created
    async fn initializing(&self, _context: &ServiceContext) -> crate::error::Result<()> {
        Ok(())
    }

    /// Process one delivery, settling it through the transport
    async fn on_message(
        &self,
        context: &ServiceContext,
        delivery: Delivery,
    ) -> crate::error::Result<()>;
}

