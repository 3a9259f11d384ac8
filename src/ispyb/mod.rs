//! # ISPyB Connector
//!
//! Consumes `ispyb_connector` and turns each message into metadata-store
//! writes. A message names one `ispyb_command`, either in its body or in the
//! step parameters. Besides the concrete commands in [`commands`], two
//! generic commands compose others:
//!
//! - `multipart_message` runs an `ispyb_command_list` one entry per
//!   activation, checkpointing the rest of the list (see [`multipart`]);
//! - `buffer` resolves references stored by other steps before running an
//!   inner command, and can store the inner result in turn (see [`buffer`]).
//!
//! Parameters resolve through the sub-command's own fields, then the message
//! body, then the step parameters.
//!
//! Non-recipe messages of the form `{parameters, content}` are accepted too;
//! they cannot checkpoint, so neither generic command works for them.

pub mod buffer;
pub mod commands;
pub mod multipart;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::IspybConfig;
use crate::constants::{body, queues};
use crate::database::{MetadataStore, StoreError};
use crate::messaging::{Delivery, TransportError};
use crate::recipe::wrapper::is_recipe_message;
use crate::recipe::{MessageBody, ParameterChain, RecipeError, RecipeWrapper};
use crate::service::{CommonService, ServiceContext};

pub use commands::{CommandCall, CommandOutcome, CommandRegistry, IspybCommand};
pub use crate::database::RetryPolicy;

#[derive(Error, Debug)]
pub enum IspybError {
    #[error("Message is neither recipe-wrapped nor a {{parameters, content}} message")]
    UnrecognisedMessage,

    #[error("No ispyb_command given")]
    MissingCommand,

    #[error("Unknown ISPyB command '{command}'")]
    UnknownCommand { command: String },

    #[error("Missing parameter '{name}'")]
    MissingParameter { name: String },

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("{command} requires a recipe-wrapped message")]
    RequiresRecipe { command: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl IspybError {
    pub fn missing_parameter<S: Into<String>>(name: S) -> Self {
        Self::MissingParameter { name: name.into() }
    }

    pub fn invalid_parameter<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn is_malformed(&self) -> bool {
        match self {
            Self::UnrecognisedMessage
            | Self::MissingCommand
            | Self::UnknownCommand { .. }
            | Self::MissingParameter { .. }
            | Self::InvalidParameter { .. }
            | Self::RequiresRecipe { .. } => true,
            Self::Recipe(e) => e.is_malformed(),
            _ => false,
        }
    }
}

/// State shared by the (possibly nested) commands of one activation
#[derive(Debug)]
pub struct Invocation {
    pub rw: RecipeWrapper,
    pub now: DateTime<Utc>,
    /// Set on a message moved back out of the dead-letter queue
    pub dlq_reinjected: bool,
}

impl Invocation {
    pub fn now_epoch(&self) -> f64 {
        self.now.timestamp_millis() as f64 / 1000.0
    }
}

#[derive(Debug)]
pub struct IspybConnector {
    registry: CommandRegistry,
    store: Arc<dyn MetadataStore>,
    config: IspybConfig,
    retry: RetryPolicy,
}

impl IspybConnector {
    pub fn new(store: Arc<dyn MetadataStore>, config: IspybConfig) -> Self {
        Self {
            registry: CommandRegistry::with_defaults(),
            retry: RetryPolicy::new(config.transient_retry_attempts),
            store,
            config,
        }
    }

    pub fn with_registry(mut self, registry: CommandRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn config(&self) -> &IspybConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn is_known(&self, command: &str) -> bool {
        command == body::MULTIPART_MESSAGE || command == body::BUFFER || self.registry.contains(command)
    }

    /// Run `command`, recursing into the generic commands
    pub fn dispatch<'a>(
        &'a self,
        invocation: &'a mut Invocation,
        command: String,
        parameters: ParameterChain,
        message: Value,
    ) -> BoxFuture<'a, Result<CommandOutcome, IspybError>> {
        Box::pin(async move {
            debug!(command = %command, "Dispatching ISPyB command");
            match command.as_str() {
                body::MULTIPART_MESSAGE => {
                    multipart::run(self, invocation, parameters, message).await
                }
                body::BUFFER => buffer::run(self, invocation, parameters, message).await,
                _ => {
                    let handler = self
                        .registry
                        .get(&command)
                        .ok_or_else(|| IspybError::UnknownCommand {
                            command: command.clone(),
                        })?;
                    let mut call = CommandCall::new(
                        command,
                        parameters,
                        message,
                        invocation.now,
                        self.store.as_ref(),
                        &self.retry,
                    );
                    handler.run(&mut call).await
                }
            }
        })
    }

    /// Process one delivery; returns the outcome of its command
    pub async fn process(
        &self,
        context: &ServiceContext,
        delivery: &Delivery,
    ) -> Result<CommandOutcome, IspybError> {
        if delivery.header.redelivered {
            // Give a lagging database replica time to catch up
            tokio::time::sleep(self.config.redelivery_delay()).await;
        }

        let (rw, message) = if is_recipe_message(&delivery.message) {
            let rw = context.recipe_wrapper(delivery)?;
            let message = rw.payload().clone();
            (rw, message)
        } else {
            match MessageBody::classify(&delivery.message) {
                MessageBody::Simple {
                    parameters,
                    content,
                } => {
                    let rw = RecipeWrapper::synthetic(
                        parameters,
                        content.clone(),
                        context.transport().clone(),
                    );
                    (rw, content)
                }
                _ => return Err(IspybError::UnrecognisedMessage),
            }
        };

        let parameters = rw.parameters_with(&message);
        let command = message
            .get(body::ISPYB_COMMAND)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| parameters.get_str(body::ISPYB_COMMAND))
            .filter(|c| !c.is_empty())
            .ok_or(IspybError::MissingCommand)?;
        if !self.is_known(&command) {
            return Err(IspybError::UnknownCommand { command });
        }
        let store_result = rw
            .current_step()
            .parameters
            .get(body::STORE_RESULT)
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut invocation = Invocation {
            rw,
            now: context.clock().now_utc(),
            dlq_reinjected: delivery.header.dlq_reinjected,
        };
        let transport = context.transport();
        let mut transaction = transport.transaction_begin(delivery.header.subscription_id.as_deref());

        let outcome = match self
            .dispatch(&mut invocation, command.clone(), parameters, message)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                transport.transaction_abort(transaction);
                return Err(e);
            }
        };
        let mut rw = invocation.rw;

        match &outcome {
            CommandOutcome::Success { return_value } => {
                if let Some(name) = &store_result {
                    rw.environment_mut().insert(name.clone(), return_value.clone());
                }
                rw.send(json!({ "result": return_value }), Some(&mut transaction))
                    .await?;
                transport.ack(&delivery.header, Some(&mut transaction)).await?;
                transport.transaction_commit(transaction).await?;
                info!(command = %command, return_value = %return_value, "ISPyB command succeeded");
            }
            CommandOutcome::Checkpoint { message, delay } => {
                rw.checkpoint(message.clone(), *delay, Some(&mut transaction))
                    .await?;
                transport.ack(&delivery.header, Some(&mut transaction)).await?;
                transport.transaction_commit(transaction).await?;
            }
            CommandOutcome::Failure { reason } => {
                error!(command = %command, reason = %reason, "ISPyB command failed, rejecting message");
                transport.transaction_abort(transaction);
                transport.nack(&delivery.header, None).await?;
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl CommonService for IspybConnector {
    fn name(&self) -> &'static str {
        "ispyb_connector"
    }

    fn queue(&self) -> String {
        queues::ISPYB_CONNECTOR.to_string()
    }

    /// Evict expired buffer entries; failures are logged and ignored
    async fn initializing(&self, context: &ServiceContext) -> crate::error::Result<()> {
        match self.store.buffer_evict_expired(context.clock().now_utc()).await {
            Ok(evicted) => info!(evicted, "Evicted expired buffer entries"),
            Err(e) => warn!(error = %e, "Buffer eviction failed"),
        }
        Ok(())
    }

    async fn on_message(
        &self,
        context: &ServiceContext,
        delivery: Delivery,
    ) -> crate::error::Result<()> {
        self.process(context, &delivery).await?;
        Ok(())
    }
}
