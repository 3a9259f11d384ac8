//! Concrete ISPyB commands and their registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::database::RetryPolicy;
use super::IspybError;
use crate::database::{
    ImageSweep, MetadataStore, NewProcessingJob, ProgramAttachment, ProgramMessage,
    ProgramRegistration, ProgramStatus, ProgramStatusUpdate,
};
use crate::recipe::ParameterChain;

/// What a command asks the connector to do with its message
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Success { return_value: Value },
    /// Redeliver `message` to the current step, optionally after `delay`
    Checkpoint {
        message: Value,
        delay: Option<Duration>,
    },
    Failure { reason: String },
}

impl CommandOutcome {
    pub fn success(return_value: Value) -> Self {
        Self::Success { return_value }
    }

    pub fn failure<S: Into<String>>(reason: S) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }
}

/// Arguments of one command invocation
pub struct CommandCall<'a> {
    pub command: String,
    pub parameters: ParameterChain,
    /// Body the command was dispatched with
    pub message: Value,
    pub now: DateTime<Utc>,
    store: &'a dyn MetadataStore,
    retry: &'a RetryPolicy,
}

impl<'a> CommandCall<'a> {
    pub fn new(
        command: impl Into<String>,
        parameters: ParameterChain,
        message: Value,
        now: DateTime<Utc>,
        store: &'a dyn MetadataStore,
        retry: &'a RetryPolicy,
    ) -> Self {
        Self {
            command: command.into(),
            parameters,
            message,
            now,
            store,
            retry,
        }
    }

    pub fn store(&self) -> &'a dyn MetadataStore {
        self.store
    }

    pub fn retry(&self) -> &'a RetryPolicy {
        self.retry
    }

    pub fn required_i64(&self, name: &str) -> Result<i64, IspybError> {
        match self.parameters.get_raw(name) {
            None => Err(IspybError::missing_parameter(name)),
            Some(_) => self
                .parameters
                .get_i64(name)
                .ok_or_else(|| IspybError::invalid_parameter(name, "integer required")),
        }
    }

    pub fn optional_i64(&self, name: &str) -> Result<Option<i64>, IspybError> {
        match self.parameters.get_raw(name) {
            None => Ok(None),
            Some(_) => self.required_i64(name).map(Some),
        }
    }

    pub fn required_str(&self, name: &str) -> Result<String, IspybError> {
        self.optional_str(name)
            .ok_or_else(|| IspybError::missing_parameter(name))
    }

    pub fn optional_str(&self, name: &str) -> Option<String> {
        self.parameters.get_str(name).filter(|s| !s.is_empty())
    }

    /// RFC 3339 timestamp parameter
    pub fn optional_time(&self, name: &str) -> Result<Option<DateTime<Utc>>, IspybError> {
        match self.optional_str(name) {
            None => Ok(None),
            Some(text) => DateTime::parse_from_rfc3339(&text)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| IspybError::invalid_parameter(name, e.to_string())),
        }
    }
}

#[async_trait]
pub trait IspybCommand: Send + Sync + std::fmt::Debug {
    async fn run(&self, call: &mut CommandCall<'_>) -> Result<CommandOutcome, IspybError>;
}

/// Commands by name
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn IspybCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("create_ispyb_job", Arc::new(CreateIspybJob));
        registry.register("register_processing", Arc::new(RegisterProcessing));
        registry.register("update_processing_status", Arc::new(UpdateProcessingStatus));
        registry.register("add_program_attachment", Arc::new(AddProgramAttachment));
        registry.register("add_program_message", Arc::new(AddProgramMessage));
        registry
    }

    pub fn register<S: Into<String>>(&mut self, name: S, command: Arc<dyn IspybCommand>) {
        self.commands.insert(name.into(), command);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn IspybCommand>> {
        self.commands.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }
}

/// Processing job with parameters and image sweeps; returns the job id
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateIspybJob;

impl CreateIspybJob {
    fn job_parameters(call: &CommandCall<'_>) -> Result<Vec<(String, String)>, IspybError> {
        let pair = |key: &str, value: &Value| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.to_string(), value)
        };
        match call.parameters.get("job_parameters") {
            None => Ok(Vec::new()),
            Some(Value::Object(map)) => Ok(map.iter().map(|(k, v)| pair(k, v)).collect()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Array(kv) if kv.len() == 2 => match &kv[0] {
                        Value::String(key) => Ok(pair(key, &kv[1])),
                        _ => Err(IspybError::invalid_parameter(
                            "job_parameters",
                            "keys must be strings",
                        )),
                    },
                    _ => Err(IspybError::invalid_parameter(
                        "job_parameters",
                        "entries must be [key, value] pairs",
                    )),
                })
                .collect(),
            Some(_) => Err(IspybError::invalid_parameter(
                "job_parameters",
                "mapping or list of pairs required",
            )),
        }
    }

    fn sweeps(call: &CommandCall<'_>, dcid: i64) -> Result<Vec<ImageSweep>, IspybError> {
        let Some(value) = call.parameters.get("sweeps") else {
            return Ok(Vec::new());
        };
        let Value::Array(items) = value else {
            return Err(IspybError::invalid_parameter("sweeps", "list required"));
        };
        items
            .iter()
            .map(|item| {
                let field = |name: &str| item.get(name).and_then(crate::recipe::parameters::as_i64);
                match (field("start_image"), field("end_image")) {
                    (Some(start_image), Some(end_image)) if start_image <= end_image => {
                        Ok(ImageSweep {
                            dcid: field("dcid").unwrap_or(dcid),
                            start_image,
                            end_image,
                        })
                    }
                    _ => Err(IspybError::invalid_parameter(
                        "sweeps",
                        "each sweep needs start_image <= end_image",
                    )),
                }
            })
            .collect()
    }
}

#[async_trait]
impl IspybCommand for CreateIspybJob {
    async fn run(&self, call: &mut CommandCall<'_>) -> Result<CommandOutcome, IspybError> {
        let dcid = call.required_i64("dcid")?;
        let job = NewProcessingJob {
            dcid,
            display_name: call.optional_str("display_name").unwrap_or_default(),
            comments: call.optional_str("comment"),
            recipe: call.required_str("recipe")?,
            automatic: call.parameters.get_bool("automatic").unwrap_or(false),
            parameters: Self::job_parameters(call)?,
            sweeps: Self::sweeps(call, dcid)?,
        };
        let job_id = call.store().create_processing_job(&job).await?;
        info!(dcid, job_id, recipe = %job.recipe, "Created processing job");
        Ok(CommandOutcome::success(json!(job_id)))
    }
}

/// New processing program; returns the program id
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterProcessing;

#[async_trait]
impl IspybCommand for RegisterProcessing {
    async fn run(&self, call: &mut CommandCall<'_>) -> Result<CommandOutcome, IspybError> {
        let registration = ProgramRegistration {
            job_id: call.optional_i64("rpid")?,
            program: call.required_str("program")?,
            command_line: call.optional_str("cmdline"),
            environment: call.optional_str("environment"),
        };
        let store = call.store();
        let registration = &registration;
        let program_id = call
            .retry()
            .run("register_processing", move || {
                store.register_processing(registration)
            })
            .await?;
        info!(
            program_id,
            program = %registration.program,
            job_id = ?registration.job_id,
            "Registered processing program"
        );
        Ok(CommandOutcome::success(json!(program_id)))
    }
}

/// Status of a processing program; returns the program id
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateProcessingStatus;

#[async_trait]
impl IspybCommand for UpdateProcessingStatus {
    async fn run(&self, call: &mut CommandCall<'_>) -> Result<CommandOutcome, IspybError> {
        let program_id = call.required_i64("program_id")?;
        let status_text = call.required_str("status")?;
        let status = ProgramStatus::parse(&status_text).ok_or_else(|| {
            IspybError::invalid_parameter("status", format!("unknown status '{status_text}'"))
        })?;
        let update = ProgramStatusUpdate {
            program_id,
            status,
            message: call.optional_str("message"),
            start_time: call.optional_time("start_time")?,
            end_time: match call.optional_time("update_time")? {
                Some(time) => Some(time),
                None if status.is_finished() => Some(call.now),
                None => None,
            },
        };
        let store = call.store();
        let update = &update;
        let program_id = call
            .retry()
            .run("update_processing_status", move || {
                store.update_processing_status(update)
            })
            .await?;
        info!(program_id, status = ?update.status, "Updated processing status");
        Ok(CommandOutcome::success(json!(program_id)))
    }
}

/// Attach an existing file to a program; returns the attachment id
#[derive(Debug, Clone, Copy, Default)]
pub struct AddProgramAttachment;

#[async_trait]
impl IspybCommand for AddProgramAttachment {
    async fn run(&self, call: &mut CommandCall<'_>) -> Result<CommandOutcome, IspybError> {
        let program_id = call.required_i64("program_id")?;
        let file_name = call.required_str("file_name")?;
        let file_path = call.required_str("file_path")?;
        let full_path = Path::new(&file_path).join(&file_name);
        if !tokio::fs::try_exists(&full_path).await.unwrap_or(false) {
            return Ok(CommandOutcome::failure(format!(
                "attachment {} does not exist",
                full_path.display()
            )));
        }
        let attachment = ProgramAttachment {
            program_id,
            file_path,
            file_name,
            file_type: call
                .optional_str("file_type")
                .unwrap_or_else(|| "log".to_string()),
            importance_rank: call.optional_i64("importance_rank")?,
        };
        let attachment_id = call.store().add_program_attachment(&attachment).await?;
        debug!(
            program_id,
            attachment_id,
            file = %full_path.display(),
            "Added program attachment"
        );
        Ok(CommandOutcome::success(json!(attachment_id)))
    }
}

/// Log a message against a program; returns the message id
#[derive(Debug, Clone, Copy, Default)]
pub struct AddProgramMessage;

#[async_trait]
impl IspybCommand for AddProgramMessage {
    async fn run(&self, call: &mut CommandCall<'_>) -> Result<CommandOutcome, IspybError> {
        let message = ProgramMessage {
            program_id: call.required_i64("program_id")?,
            severity: call
                .optional_str("severity")
                .unwrap_or_else(|| "INFO".to_string())
                .to_ascii_uppercase(),
            message: call.required_str("message")?,
            description: call.optional_str("description"),
        };
        let message_id = call.store().add_program_message(&message).await?;
        Ok(CommandOutcome::success(json!(message_id)))
    }
}
