//! # Trigger Dispatcher
//!
//! Consumes the `trigger` queue. Each message names a `target`; the target's
//! [`Trigger`] checks its preconditions, optionally waits on predecessor
//! jobs, creates a processing job and hands it to `processing_recipe`.
//!
//! Every target returns a [`TriggerResult`]. A success carrying a value is
//! published on the step's `output` channel; any success is acked; a failure
//! aborts the transaction and nacks the message.

pub mod targets;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::TriggerConfig;
use crate::constants::{body, outputs, queues};
use crate::database::{MetadataStore, NewProcessingJob, RetryPolicy, StoreError};
use crate::messaging::{Delivery, Transaction, TransportError};
use crate::recipe::{ParameterChain, RecipeError, RecipeWrapper};
use crate::service::{CommonService, ServiceContext};

pub use targets::{BigEp, Dimple, EpPredict, FastEp, Mrbump, Multiplex};

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Message names no trigger target")]
    MissingTarget,

    #[error("Unknown trigger target '{target}'")]
    UnknownTarget { target: String },

    #[error("Missing parameter '{name}'")]
    MissingParameter { name: String },

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl TriggerError {
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
            Self::MissingTarget
            | Self::UnknownTarget { .. }
            | Self::MissingParameter { .. }
            | Self::InvalidParameter { .. } => true,
            Self::Recipe(e) => e.is_malformed(),
            _ => false,
        }
    }
}

/// Result contract shared by all targets
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerResult {
    pub success: bool,
    pub return_value: Option<Value>,
}

impl TriggerResult {
    pub fn success(return_value: Value) -> Self {
        Self {
            success: true,
            return_value: Some(return_value),
        }
    }

    /// Nothing to do; acked without a downstream send
    pub fn skipped() -> Self {
        Self {
            success: true,
            return_value: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            return_value: None,
        }
    }
}

/// Exponential backoff while waiting on predecessor jobs
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub delay: f64,
    pub multiplier: f64,
    pub max_try: u32,
}

impl BackoffPolicy {
    /// `backoff-delay`, `backoff-multiplier` and `backoff-max-try` over the service defaults
    pub fn from_parameters(
        parameters: &ParameterChain,
        defaults: &TriggerConfig,
    ) -> Result<Self, TriggerError> {
        let positive = |name: &str, default: f64| match parameters.get_raw(name) {
            None => Ok(default),
            Some(_) => parameters
                .get_f64(name)
                .filter(|v| v.is_finite() && *v > 0.0)
                .ok_or_else(|| TriggerError::invalid_parameter(name, "positive number required")),
        };
        Ok(Self {
            delay: positive("backoff-delay", defaults.backoff_delay_seconds)?,
            multiplier: positive("backoff-multiplier", defaults.backoff_multiplier)?,
            max_try: match parameters.get_raw("backoff-max-try") {
                None => defaults.backoff_max_try,
                Some(_) => parameters
                    .get_i64("backoff-max-try")
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| {
                        TriggerError::invalid_parameter("backoff-max-try", "non-negative integer required")
                    })?,
            },
        })
    }

    /// Delay before attempt `ntry + 1`
    pub fn delay_for(&self, ntry: u32) -> Duration {
        let seconds = self.delay * self.multiplier.powi(ntry.min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(seconds.clamp(0.0, 86_400.0))
    }

    pub fn exhausted(&self, ntry: u32) -> bool {
        ntry >= self.max_try
    }
}

/// One target invocation
pub struct TriggerCall<'a> {
    pub target: String,
    pub parameters: ParameterChain,
    rw: &'a RecipeWrapper,
    store: &'a dyn MetadataStore,
    retry: &'a RetryPolicy,
    transaction: &'a mut Transaction,
    backoff: BackoffPolicy,
    /// Identifies the delivery, so a redelivered request finds its job
    request_key: String,
}

impl<'a> TriggerCall<'a> {
    pub fn store(&self) -> &'a dyn MetadataStore {
        self.store
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Number of times this message has already waited on predecessors
    pub fn ntry(&self) -> u32 {
        self.rw
            .payload()
            .get(body::TRIGGER_STATUS)
            .and_then(|status| status.get("ntry"))
            .and_then(Value::as_u64)
            .map_or(0, |n| n.min(u32::MAX as u64) as u32)
    }

    pub fn required_i64(&self, name: &str) -> Result<i64, TriggerError> {
        match self.parameters.get_raw(name) {
            None => Err(TriggerError::missing_parameter(name)),
            Some(_) => self
                .parameters
                .get_i64(name)
                .ok_or_else(|| TriggerError::invalid_parameter(name, "integer required")),
        }
    }

    pub fn optional_i64(&self, name: &str) -> Result<Option<i64>, TriggerError> {
        match self.parameters.get_raw(name) {
            None => Ok(None),
            Some(_) => self.required_i64(name).map(Some),
        }
    }

    pub fn required_str(&self, name: &str) -> Result<String, TriggerError> {
        self.parameters
            .get_str(name)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TriggerError::missing_parameter(name))
    }

    /// A string or list of strings; absent means empty
    pub fn string_list(&self, name: &str) -> Vec<String> {
        match self.parameters.get(name) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) if !s.is_empty() => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            Some(Value::String(s)) if !s.is_empty() => vec![s],
            _ => Vec::new(),
        }
    }

    pub fn automatic(&self) -> bool {
        self.parameters.get_bool("automatic").unwrap_or(true)
    }

    pub fn comment(&self) -> Option<String> {
        self.parameters.get_str("comment").filter(|c| !c.is_empty())
    }

    /// Checkpoint this message with the next backoff delay; the message is acked
    pub async fn retry_later(&mut self) -> Result<TriggerResult, TriggerError> {
        let ntry = self.ntry();
        let delay = self.backoff.delay_for(ntry);
        let mut payload = match self.rw.payload() {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        payload.insert(body::TRIGGER_STATUS.to_string(), json!({"ntry": ntry + 1}));
        info!(
            trigger = %self.target,
            ntry = ntry + 1,
            delay_seconds = delay.as_secs_f64(),
            "Waiting on predecessor jobs"
        );
        self.rw
            .checkpoint(Value::Object(payload), Some(delay), Some(&mut *self.transaction))
            .await?;
        Ok(TriggerResult::skipped())
    }

    /// Create `job` and hand it to the processing recipe queue
    ///
    /// The job is created at most once per delivery. If the broker
    /// transaction fails after the insert, the redelivered message reuses
    /// the job instead of creating another.
    pub async fn hand_off(&mut self, job: NewProcessingJob) -> Result<TriggerResult, TriggerError> {
        let store = self.store;
        let request_key = self.request_key.as_str();
        let job_id = self
            .retry
            .run("create_processing_job", || {
                store.create_processing_job_once(request_key, &job)
            })
            .await?;
        info!(
            trigger = %self.target,
            dcid = job.dcid,
            job_id,
            recipe = %job.recipe,
            request_key = %self.request_key,
            "Created processing job"
        );
        self.rw
            .transport()
            .send(
                queues::PROCESSING_RECIPE,
                json!({"recipes": [], "parameters": {"ispyb_process": job_id}}),
                None,
                Some(&mut *self.transaction),
            )
            .await?;
        Ok(TriggerResult::success(json!(job_id)))
    }
}

#[async_trait]
pub trait Trigger: Send + Sync + std::fmt::Debug {
    async fn run(&self, call: &mut TriggerCall<'_>) -> Result<TriggerResult, TriggerError>;
}

/// Targets by name
#[derive(Debug, Clone, Default)]
pub struct TriggerRegistry {
    targets: HashMap<String, Arc<dyn Trigger>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every shipped target
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("dimple", Arc::new(Dimple));
        registry.register("ep_predict", Arc::new(EpPredict));
        registry.register("fast_ep", Arc::new(FastEp));
        registry.register("mrbump", Arc::new(Mrbump));
        registry.register("big_ep", Arc::new(BigEp::default()));
        registry.register("multiplex", Arc::new(Multiplex::default()));
        registry
    }

    pub fn register<S: Into<String>>(&mut self, name: S, trigger: Arc<dyn Trigger>) {
        self.targets.insert(name.into(), trigger);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Trigger>> {
        self.targets.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.targets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug)]
pub struct TriggerService {
    registry: TriggerRegistry,
    store: Arc<dyn MetadataStore>,
    defaults: TriggerConfig,
    retry: RetryPolicy,
}

impl TriggerService {
    pub fn new(store: Arc<dyn MetadataStore>, defaults: TriggerConfig) -> Self {
        Self {
            registry: TriggerRegistry::with_defaults(),
            retry: RetryPolicy::new(defaults.transient_retry_attempts),
            store,
            defaults,
        }
    }

    pub fn with_registry(mut self, registry: TriggerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &TriggerRegistry {
        &self.registry
    }

    /// Dispatch one message; returns the target's result
    pub async fn process(
        &self,
        context: &ServiceContext,
        delivery: &Delivery,
    ) -> Result<TriggerResult, TriggerError> {
        let mut rw = context.recipe_wrapper(delivery)?;
        rw.set_default_channel(outputs::OUTPUT);
        let parameters = rw.parameters_with(rw.payload());

        let target = parameters
            .get_str("target")
            .filter(|t| !t.is_empty())
            .ok_or(TriggerError::MissingTarget)?;
        let trigger = self
            .registry
            .get(&target)
            .ok_or_else(|| TriggerError::UnknownTarget {
                target: target.clone(),
            })?;
        let backoff = BackoffPolicy::from_parameters(&parameters, &self.defaults)?;

        let transport = context.transport();
        let mut transaction = transport.transaction_begin(delivery.header.subscription_id.as_deref());
        debug!(trigger = %target, recipe_pointer = rw.pointer(), "Dispatching trigger");

        let result = {
            let mut call = TriggerCall {
                target: target.clone(),
                parameters,
                rw: &rw,
                store: self.store.as_ref(),
                retry: &self.retry,
                transaction: &mut transaction,
                backoff,
                request_key: format!("{}:{}", delivery.header.queue, delivery.header.message_id),
            };
            trigger.run(&mut call).await
        };

        match result {
            Ok(result) if result.success => {
                if let Some(value) = &result.return_value {
                    rw.send(value.clone(), Some(&mut transaction)).await?;
                }
                transport.ack(&delivery.header, Some(&mut transaction)).await?;
                transport.transaction_commit(transaction).await?;
                Ok(result)
            }
            Ok(result) => {
                error!(trigger = %target, "Trigger failed, rejecting message");
                transport.transaction_abort(transaction);
                transport.nack(&delivery.header, None).await?;
                Ok(result)
            }
            Err(e) => {
                transport.transaction_abort(transaction);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl CommonService for TriggerService {
    fn name(&self) -> &'static str {
        "trigger"
    }

    fn queue(&self) -> String {
        queues::TRIGGER.to_string()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::database::InMemoryMetadataStore;
    use crate::messaging::{InMemoryTransport, Transport};

    #[derive(Debug)]
    struct Fixed(TriggerResult);

    #[async_trait]
    impl Trigger for Fixed {
        async fn run(&self, _call: &mut TriggerCall<'_>) -> Result<TriggerResult, TriggerError> {
            Ok(self.0.clone())
        }
    }

    fn envelope(payload: Value) -> Value {
        json!({
            "recipe": {
                "1": {"queue": "trigger", "parameters": {"target": "fixed"}, "output": {"output": 2}},
                "2": {"queue": "downstream"},
                "start": [[1, []]]
            },
            "recipe-pointer": 1,
            "payload": payload
        })
    }

    async fn run(result: TriggerResult, payload: Value) -> (Arc<InMemoryTransport>, Result<TriggerResult, TriggerError>) {
        let clock = FakeClock::new();
        let transport = Arc::new(InMemoryTransport::with_clock(Arc::new(clock.clone())));
        let context = ServiceContext::new(transport.clone(), Arc::new(clock));
        let mut registry = TriggerRegistry::new();
        registry.register("fixed", Arc::new(Fixed(result)));
        let service = TriggerService::new(Arc::new(InMemoryMetadataStore::new()), TriggerConfig::default())
            .with_registry(registry);

        transport.send("trigger", envelope(payload), None, None).await.unwrap();
        let delivery = transport
            .receive("trigger", 1, Duration::from_secs(60))
            .await
            .unwrap()
            .remove(0);
        let outcome = service.process(&context, &delivery).await;
        (transport, outcome)
    }

    #[test]
    fn test_backoff_delay_grows_geometrically() {
        let policy = BackoffPolicy::from_parameters(
            &ParameterChain::new(Map::new()),
            &TriggerConfig::default(),
        )
        .unwrap();
        assert_eq!(policy.delay_for(0), Duration::from_secs(8));
        assert_eq!(policy.delay_for(3), Duration::from_secs(64));
        assert!(!policy.exhausted(9));
        assert!(policy.exhausted(10));
    }

    #[tokio::test]
    async fn test_success_with_value_is_forwarded_and_acked() {
        let (transport, outcome) = run(TriggerResult::success(json!(17)), json!({})).await;
        assert!(outcome.unwrap().success);
        let forwarded = transport.published_to("downstream");
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0]["payload"], 17);
        assert_eq!(transport.queue_length("trigger").await, 0);
    }

    #[tokio::test]
    async fn test_skip_acks_without_sending() {
        let (transport, outcome) = run(TriggerResult::skipped(), json!({})).await;
        assert!(outcome.unwrap().success);
        assert!(transport.published_to("downstream").is_empty());
        assert_eq!(transport.queue_length("trigger").await, 0);
    }

    #[tokio::test]
    async fn test_failure_is_nacked() {
        let (transport, outcome) = run(TriggerResult::failure(), json!({})).await;
        assert!(!outcome.unwrap().success);
        assert!(transport.published_to("downstream").is_empty());
        assert_eq!(transport.dead_letters("trigger").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_target_is_malformed() {
        let (_, outcome) = run(TriggerResult::skipped(), json!({"target": "nonesuch"})).await;
        let err = outcome.unwrap_err();
        assert!(err.is_malformed());
        assert!(matches!(err, TriggerError::UnknownTarget { target } if target == "nonesuch"));
    }
}
