//! Tagged view over message bodies.
//!
//! Bodies arriving at the services come in several shapes, told apart by a
//! discriminator key already present in the body.

use serde_json::{Map, Value};

use crate::constants::body;

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// `ispyb_command_list`: a multipart command sequence
    Multipart(Map<String, Value>),
    /// `buffer_command`: a command waiting on buffered references
    Buffer(Map<String, Value>),
    /// `filewatcher-status`: a checkpointed watch
    FilewatcherStatus(Map<String, Value>),
    /// `trigger-status`: a checkpointed trigger waiting on predecessors
    TriggerStatus(Map<String, Value>),
    /// `ispyb_command`: a single command
    Command(Map<String, Value>),
    /// Non-recipe `{parameters, content}` message
    Simple {
        parameters: Map<String, Value>,
        content: Value,
    },
    Other(Value),
}

impl MessageBody {
    pub fn classify(value: &Value) -> Self {
        let Value::Object(map) = value else {
            return Self::Other(value.clone());
        };
        if map.contains_key(body::ISPYB_COMMAND_LIST) {
            Self::Multipart(map.clone())
        } else if map.contains_key(body::BUFFER_COMMAND) {
            Self::Buffer(map.clone())
        } else if map.contains_key(body::FILEWATCHER_STATUS) {
            Self::FilewatcherStatus(map.clone())
        } else if map.contains_key(body::TRIGGER_STATUS) {
            Self::TriggerStatus(map.clone())
        } else if map.contains_key(body::ISPYB_COMMAND) {
            Self::Command(map.clone())
        } else if let (Some(Value::Object(parameters)), Some(content)) =
            (map.get(body::PARAMETERS), map.get(body::CONTENT))
        {
            Self::Simple {
                parameters: parameters.clone(),
                content: content.clone(),
            }
        } else {
            Self::Other(value.clone())
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Multipart(_) => "multipart",
            Self::Buffer(_) => "buffer",
            Self::FilewatcherStatus(_) => "filewatcher-status",
            Self::TriggerStatus(_) => "trigger-status",
            Self::Command(_) => "command",
            Self::Simple { .. } => "simple",
            Self::Other(_) => "other",
        }
    }
}
