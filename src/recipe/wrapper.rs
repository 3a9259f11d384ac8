//! Per-message recipe view.
//!
//! A [`RecipeWrapper`] is built for every received recipe message. It knows
//! the current step, carries the mutable environment and publishes to the
//! step's outputs or back to the step itself (a checkpoint).

use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::graph::{Recipe, RecipeStep, StepLabel, UNNAMED_OUTPUT};
use super::parameters::ParameterChain;
use super::{RecipeError, RecipeResult};
use crate::constants::envelope;
use crate::messaging::{Transaction, Transport};

/// True if the message carries a recipe envelope
pub fn is_recipe_message(message: &Value) -> bool {
    message.get(envelope::RECIPE).is_some()
}

#[derive(Debug, Clone)]
pub struct RecipeWrapper {
    recipe: Arc<Recipe>,
    step: RecipeStep,
    pointer: StepLabel,
    path: Vec<StepLabel>,
    environment: Map<String, Value>,
    payload: Value,
    transport: Arc<dyn Transport>,
    default_channel: Option<String>,
    synthetic: bool,
}

impl RecipeWrapper {
    /// Interpret a received recipe message
    pub fn from_envelope(message: &Value, transport: Arc<dyn Transport>) -> RecipeResult<Self> {
        let object = message
            .as_object()
            .ok_or_else(|| RecipeError::invalid_envelope("message is not a mapping"))?;
        let recipe = Recipe::parse(
            object
                .get(envelope::RECIPE)
                .ok_or_else(|| RecipeError::invalid_envelope("missing recipe"))?,
        )?;

        let pointer = object
            .get(envelope::RECIPE_POINTER)
            .and_then(|p| match p {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .and_then(|p| StepLabel::try_from(p).ok())
            .ok_or_else(|| RecipeError::invalid_envelope("missing or invalid recipe-pointer"))?;
        let step = recipe.step(pointer)?.clone();

        let path = match object.get(envelope::RECIPE_PATH) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_u64().and_then(|l| StepLabel::try_from(l).ok()))
                .collect(),
            Some(_) => return Err(RecipeError::invalid_envelope("recipe-path is not a list")),
        };

        let environment = match object.get(envelope::ENVIRONMENT) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(RecipeError::invalid_envelope(
                    "environment is not a mapping",
                ))
            }
        };

        Ok(Self {
            recipe: Arc::new(recipe),
            step,
            pointer,
            path,
            environment,
            payload: object.get(envelope::PAYLOAD).cloned().unwrap_or(Value::Null),
            transport,
            default_channel: None,
            synthetic: false,
        })
    }

    /// Wrapper around a simple `{parameters, content}` message
    ///
    /// Publishing is a no-op and checkpointing is refused, so handlers can
    /// treat both message kinds alike.
    pub fn synthetic(
        parameters: Map<String, Value>,
        payload: Value,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let mut environment = Map::new();
        environment.insert(envelope::HAS_RECIPE_WRAPPER.to_string(), Value::Bool(false));
        let step = RecipeStep::parameters_only(1, parameters.clone());
        let recipe = Recipe::single_step(parameters);
        Self {
            recipe: Arc::new(recipe),
            step,
            pointer: 1,
            path: Vec::new(),
            environment,
            payload,
            transport,
            default_channel: None,
            synthetic: true,
        }
    }

    /// Load a wrapper serialized with [`RecipeWrapper::to_envelope`]
    pub async fn from_file(path: &Path, transport: Arc<dyn Transport>) -> RecipeResult<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            RecipeError::invalid_envelope(format!("cannot read {}: {e}", path.display()))
        })?;
        let message: Value = serde_json::from_str(&text).map_err(|e| {
            RecipeError::invalid_envelope(format!("{} is not valid JSON: {e}", path.display()))
        })?;
        Self::from_envelope(&message, transport)
    }

    pub fn current_step(&self) -> &RecipeStep {
        &self.step
    }

    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    pub fn pointer(&self) -> StepLabel {
        self.pointer
    }

    pub fn path(&self) -> &[StepLabel] {
        &self.path
    }

    pub fn environment(&self) -> &Map<String, Value> {
        &self.environment
    }

    pub fn environment_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.environment
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    /// Step parameters with environment substitution
    pub fn parameters(&self) -> ParameterChain {
        ParameterChain::new(self.environment.clone())
            .with_layer(self.current_step().parameters.clone())
    }

    /// Step parameters behind a higher-precedence mapping such as the message body
    pub fn parameters_with(&self, front: &Value) -> ParameterChain {
        ParameterChain::new(self.environment.clone())
            .with_value_layer(front)
            .with_layer(self.current_step().parameters.clone())
    }

    pub fn set_default_channel(&mut self, channel: impl Into<String>) {
        self.default_channel = Some(channel.into());
    }

    /// Publish on the default channel, or the unnamed output if none is set
    pub async fn send(
        &self,
        payload: Value,
        transaction: Option<&mut Transaction>,
    ) -> RecipeResult<()> {
        let channel = self
            .default_channel
            .clone()
            .unwrap_or_else(|| UNNAMED_OUTPUT.to_string());
        self.send_to(&channel, payload, transaction).await
    }

    /// Publish `payload` to every step listed under `output`
    ///
    /// Outputs the current step does not declare are skipped silently.
    pub async fn send_to(
        &self,
        output: &str,
        payload: Value,
        mut transaction: Option<&mut Transaction>,
    ) -> RecipeResult<()> {
        if self.synthetic {
            debug!(output = %output, "Simple message: not forwarding output");
            return Ok(());
        }

        let mut path = self.path.clone();
        path.push(self.pointer);

        for destination in self.current_step().output(output) {
            let step = self.recipe.step(*destination)?;
            let message = self.envelope_for(*destination, &path, payload.clone());
            if !self
                .publish(step, message, None, transaction.as_deref_mut())
                .await?
            {
                warn!(
                    output = %output,
                    destination = *destination,
                    "Downstream step has no queue or topic, message dropped"
                );
            }
        }
        Ok(())
    }

    /// Redeliver a message to the current step, optionally after `delay`
    pub async fn checkpoint(
        &self,
        payload: Value,
        delay: Option<Duration>,
        transaction: Option<&mut Transaction>,
    ) -> RecipeResult<()> {
        if self.synthetic {
            return Err(RecipeError::not_recipe_wrapped("checkpoint"));
        }
        let step = self.current_step();
        let message = self.envelope_for(self.pointer, &self.path, payload);
        if self.publish(step, message, delay, transaction).await? {
            debug!(
                recipe_pointer = self.pointer,
                delay_seconds = delay.map(|d| d.as_secs_f64()),
                "Checkpointed"
            );
            Ok(())
        } else {
            Err(RecipeError::NoDestination { label: self.pointer })
        }
    }

    /// The current message as an envelope, for hand-over to another process
    pub fn to_envelope(&self) -> Value {
        self.envelope_for(self.pointer, &self.path, self.payload.clone())
    }

    fn envelope_for(&self, pointer: StepLabel, path: &[StepLabel], payload: Value) -> Value {
        let mut message = Map::new();
        message.insert(envelope::RECIPE.to_string(), self.recipe.to_value());
        message.insert(envelope::RECIPE_POINTER.to_string(), json!(pointer));
        message.insert(envelope::RECIPE_PATH.to_string(), json!(path));
        message.insert(
            envelope::ENVIRONMENT.to_string(),
            Value::Object(self.environment.clone()),
        );
        message.insert(envelope::PAYLOAD.to_string(), payload);
        Value::Object(message)
    }

    /// Returns false if the step has nowhere to publish to
    async fn publish(
        &self,
        step: &RecipeStep,
        message: Value,
        delay: Option<Duration>,
        transaction: Option<&mut Transaction>,
    ) -> RecipeResult<bool> {
        if let Some(queue) = &step.queue {
            self.transport
                .send(queue, message, delay, transaction)
                .await?;
            Ok(true)
        } else if let Some(topic) = &step.topic {
            self.transport.broadcast(topic, message, transaction).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryTransport;

    fn message() -> Value {
        json!({
            "recipe": {
                "1": {
                    "queue": "trigger",
                    "parameters": {"target": "dimple", "dcid": "$ispyb_dcid"},
                    "output": {"output": [2, 3], "other": 4}
                },
                "2": {"queue": "processing_recipe"},
                "3": {"topic": "transient_status"},
                "4": {"service": "none"},
                "start": [[1, []]]
            },
            "recipe-pointer": 1,
            "recipe-path": [],
            "environment": {"ispyb_dcid": 99},
            "payload": {"x": 1}
        })
    }

    fn wrapper() -> (RecipeWrapper, Arc<InMemoryTransport>) {
        let transport = Arc::new(InMemoryTransport::new());
        let rw = RecipeWrapper::from_envelope(&message(), transport.clone()).unwrap();
        (rw, transport)
    }

    #[test]
    fn test_envelope_accessors() {
        let (rw, _) = wrapper();
        assert_eq!(rw.pointer(), 1);
        assert_eq!(rw.payload(), &json!({"x": 1}));
        assert_eq!(rw.current_step().queue.as_deref(), Some("trigger"));
        assert_eq!(rw.parameters().get_str("dcid").as_deref(), Some("99"));
    }

    #[test]
    fn test_missing_pointer_is_malformed() {
        let mut msg = message();
        msg.as_object_mut().unwrap().remove("recipe-pointer");
        let err = RecipeWrapper::from_envelope(&msg, Arc::new(InMemoryTransport::new()))
            .unwrap_err();
        assert!(err.is_malformed());

        msg["recipe-pointer"] = json!(12);
        let err = RecipeWrapper::from_envelope(&msg, Arc::new(InMemoryTransport::new()))
            .unwrap_err();
        assert!(matches!(err, RecipeError::MissingStep { label: 12 }));
    }

    #[tokio::test]
    async fn test_send_to_fans_out_with_extended_path() {
        let (mut rw, transport) = wrapper();
        rw.environment_mut().insert("jobid".into(), json!(5));
        rw.send_to("output", json!({"result": 1}), None).await.unwrap();

        let sent = transport.published();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].destination, "processing_recipe");
        assert!(!sent[0].broadcast);
        assert_eq!(sent[0].message["recipe-pointer"], 2);
        assert_eq!(sent[0].message["recipe-path"], json!([1]));
        assert_eq!(sent[0].message["environment"]["jobid"], 5);
        assert_eq!(sent[1].destination, "transient_status");
        assert!(sent[1].broadcast);

        // Absent outputs are skipped, queue-less steps dropped
        rw.send_to("missing", json!(1), None).await.unwrap();
        rw.send_to("other", json!(1), None).await.unwrap();
        assert_eq!(transport.published().len(), 2);
    }

    #[tokio::test]
    async fn test_default_channel_and_checkpoint() {
        let (mut rw, transport) = wrapper();
        rw.set_default_channel("output");
        let mut txn = transport.transaction_begin(None);
        rw.send(json!("r"), Some(&mut txn)).await.unwrap();
        rw.checkpoint(json!({"n": 2}), Some(Duration::from_secs(8)), Some(&mut txn))
            .await
            .unwrap();
        assert!(transport.published().is_empty());
        transport.transaction_commit(txn).await.unwrap();

        let checkpoints = transport.take_messages("trigger").await;
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].delay, Some(Duration::from_secs(8)));
        assert_eq!(checkpoints[0].message["recipe-pointer"], 1);
        assert_eq!(checkpoints[0].message["payload"], json!({"n": 2}));
        assert_eq!(transport.published_to("processing_recipe").len(), 1);
    }

    #[tokio::test]
    async fn test_synthetic_wrapper() {
        let transport = Arc::new(InMemoryTransport::new());
        let params = json!({"ispyb_command": "update"}).as_object().cloned().unwrap();
        let rw = RecipeWrapper::synthetic(params, json!({}), transport.clone());

        assert_eq!(rw.environment()["has_recipe_wrapper"], json!(false));
        assert_eq!(
            rw.parameters().get_str("ispyb_command").as_deref(),
            Some("update")
        );
        rw.send_to("output", json!(1), None).await.unwrap();
        assert!(transport.published().is_empty());
        assert!(matches!(
            rw.checkpoint(json!(1), None, None).await,
            Err(RecipeError::NotRecipeWrapped { .. })
        ));
    }
}
