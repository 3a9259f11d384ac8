//! Multipart command sequences.
//!
//! The remaining sequence travels in the message, so each activation runs
//! exactly one sub-command and a worker failure never repeats a finished one.
//! A sub-command that checkpoints is resumed from `step_message` with the
//! list unchanged.
//!
//! Sub-command parameters resolve through the sub-command's fields, its
//! resume state, the message body and finally the step parameters.

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{CommandOutcome, Invocation, IspybConnector, IspybError};
use crate::constants::body;
use crate::recipe::ParameterChain;

pub async fn run(
    connector: &IspybConnector,
    invocation: &mut Invocation,
    parameters: ParameterChain,
    message: Value,
) -> Result<CommandOutcome, IspybError> {
    if invocation.rw.is_synthetic() {
        return Err(IspybError::RequiresRecipe {
            command: body::MULTIPART_MESSAGE.to_string(),
        });
    }

    let commands = match message.get(body::ISPYB_COMMAND_LIST) {
        Some(list) => list.clone(),
        None => parameters
            .get_raw(body::ISPYB_COMMAND_LIST)
            .cloned()
            .unwrap_or(Value::Null),
    };
    let Value::Array(commands) = commands else {
        return Err(IspybError::invalid_parameter(
            body::ISPYB_COMMAND_LIST,
            "list of commands required",
        ));
    };
    let Some(Value::Object(head)) = commands.first() else {
        return Err(IspybError::invalid_parameter(
            body::ISPYB_COMMAND_LIST,
            "first entry must be a command mapping",
        ));
    };
    let head = head.clone();
    let command = head
        .get(body::ISPYB_COMMAND)
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| IspybError::missing_parameter(body::ISPYB_COMMAND))?
        .to_string();
    let position = message
        .get(body::CHECKPOINT)
        .and_then(Value::as_u64)
        .unwrap_or(0);

    // A fresh sub-command is dispatched with its own fields as the message
    let step_message = message
        .get(body::STEP_MESSAGE)
        .cloned()
        .unwrap_or_else(|| Value::Object(head.clone()));
    let mut sub_parameters = invocation.rw.parameters_with(&message);
    if let Value::Object(resume) = &step_message {
        sub_parameters = sub_parameters.with_front_layer(resume.clone());
    }
    let sub_parameters = sub_parameters.with_front_layer(head.clone());

    info!(
        command = %command,
        position = position + 1,
        remaining = commands.len(),
        "Running multipart sub-command"
    );
    let outcome = connector
        .dispatch(invocation, command.clone(), sub_parameters, step_message)
        .await?;

    match outcome {
        CommandOutcome::Checkpoint {
            message: resume,
            delay,
        } => {
            let mut next = carrier(&message, &commands, position);
            next.insert(body::STEP_MESSAGE.to_string(), resume);
            Ok(CommandOutcome::Checkpoint {
                message: Value::Object(next),
                delay,
            })
        }
        CommandOutcome::Failure { reason } => {
            warn!(
                command = %command,
                position = position + 1,
                "Multipart sub-command failed, abandoning the remaining commands"
            );
            Ok(CommandOutcome::Failure { reason })
        }
        CommandOutcome::Success { return_value } => {
            if let Some(name) = head.get(body::STORE_RESULT).and_then(Value::as_str) {
                invocation
                    .rw
                    .environment_mut()
                    .insert(name.to_string(), return_value.clone());
            }
            if commands.len() == 1 {
                return Ok(CommandOutcome::Success { return_value });
            }
            let next = carrier(&message, &commands[1..], position + 1);
            Ok(CommandOutcome::Checkpoint {
                message: Value::Object(next),
                delay: None,
            })
        }
    }
}

/// Message carrying `commands` from `position` on, without any resume state
fn carrier(message: &Value, commands: &[Value], position: u64) -> Map<String, Value> {
    let mut next = match message {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    next.remove(body::STEP_MESSAGE);
    next.insert(body::ISPYB_COMMAND_LIST.to_string(), json!(commands));
    next.insert(body::CHECKPOINT.to_string(), json!(position));
    next
}
