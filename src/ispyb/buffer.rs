//! Buffered references between recipe steps.
//!
//! A step that produces an identifier stores it under a UUID chosen by the
//! recipe author (`buffer_store`); a step that needs it names the same UUID in
//! `buffer_lookup`. Entries are keyed by `(program_id, uuid)`. A lookup that
//! misses is retried by checkpointing until `buffer_expiry_time`.

use chrono::Duration as ChronoDuration;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{error, info};

use super::{CommandOutcome, Invocation, IspybConnector, IspybError};
use crate::constants::body;
use crate::recipe::ParameterChain;

pub async fn run(
    connector: &IspybConnector,
    invocation: &mut Invocation,
    parameters: ParameterChain,
    message: Value,
) -> Result<CommandOutcome, IspybError> {
    let Value::Object(mut envelope) = message else {
        return Err(IspybError::invalid_parameter(
            body::BUFFER,
            "buffer message must be a mapping",
        ));
    };
    let Some(Value::Object(mut command)) = envelope.get(body::BUFFER_COMMAND).cloned() else {
        return Err(IspybError::missing_parameter(body::BUFFER_COMMAND));
    };
    let program_id = match parameters.get_raw("program_id") {
        None => return Err(IspybError::missing_parameter("program_id")),
        Some(_) => parameters
            .get_i64("program_id")
            .ok_or_else(|| IspybError::invalid_parameter("program_id", "integer required"))?,
    };

    let config = connector.config();
    let now = invocation.now_epoch();
    let expiry = match envelope.get(body::BUFFER_EXPIRY_TIME).and_then(Value::as_f64) {
        Some(expiry) if !invocation.dlq_reinjected => expiry,
        _ => {
            let expiry = now + config.buffer_lookup_window_seconds;
            envelope.insert(body::BUFFER_EXPIRY_TIME.to_string(), json!(expiry));
            expiry
        }
    };

    let mut lookup = match envelope.get(body::BUFFER_LOOKUP) {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(lookup)) => lookup.clone(),
        Some(_) => {
            return Err(IspybError::invalid_parameter(
                body::BUFFER_LOOKUP,
                "mapping of field to uuid required",
            ))
        }
    };
    if !lookup.is_empty() {
        let store = connector.store().as_ref();
        for (field, uuid) in lookup.clone() {
            let uuid = match uuid {
                Value::String(uuid) => uuid,
                other => other.to_string(),
            };
            let (key, load_time) = (uuid.as_str(), invocation.now);
            let found = connector
                .retry_policy()
                .run("buffer_load", move || store.buffer_load(program_id, key, load_time))
                .await?;
            if let Some(value) = found {
                info!(program_id, uuid = %uuid, field = %field, "Resolved buffered reference");
                command.insert(field.clone(), value);
                lookup.remove(&field);
            }
        }
        envelope.insert(body::BUFFER_COMMAND.to_string(), Value::Object(command.clone()));
        envelope.insert(body::BUFFER_LOOKUP.to_string(), Value::Object(lookup.clone()));

        if !lookup.is_empty() {
            let unresolved: Vec<&String> = lookup.keys().collect();
            if now > expiry {
                error!(program_id, ?unresolved, "Buffered references expired unresolved");
                return Ok(CommandOutcome::failure(format!(
                    "buffer lookup for {unresolved:?} expired"
                )));
            }
            info!(program_id, ?unresolved, "Buffered references not yet available");
            return Ok(CommandOutcome::Checkpoint {
                message: Value::Object(envelope),
                delay: Some(Duration::from_secs_f64(config.buffer_checkpoint_delay_seconds)),
            });
        }
    }

    let inner = command
        .get(body::ISPYB_COMMAND)
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| IspybError::missing_parameter(body::ISPYB_COMMAND))?
        .to_string();
    let inner_parameters = parameters.with_front_layer(command.clone());
    let outcome = connector
        .dispatch(invocation, inner, inner_parameters, Value::Object(command))
        .await?;

    match outcome {
        CommandOutcome::Success { return_value } => {
            if let Some(uuid) = envelope.get(body::BUFFER_STORE).and_then(Value::as_str) {
                let store = connector.store().as_ref();
                let ttl = ChronoDuration::milliseconds((config.buffer_entry_ttl_seconds * 1000.0) as i64);
                let expires_at = invocation.now + ttl;
                let value = &return_value;
                connector
                    .retry_policy()
                    .run("buffer_store", move || {
                        store.buffer_store(program_id, uuid, value, expires_at)
                    })
                    .await?;
                info!(
                    program_id,
                    uuid = %uuid,
                    expires_at = %expires_at,
                    "Stored buffered reference"
                );
            }
            Ok(CommandOutcome::Success { return_value })
        }
        CommandOutcome::Checkpoint { message, delay } => {
            envelope.insert(body::BUFFER_COMMAND.to_string(), message);
            Ok(CommandOutcome::Checkpoint {
                message: Value::Object(envelope),
                delay,
            })
        }
        failure @ CommandOutcome::Failure { .. } => Ok(failure),
    }
}
