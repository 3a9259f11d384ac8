//! # Wrapper Runner
//!
//! Runs one external job for one recipe step. The runner loads a serialized
//! recipe wrapper, picks a [`Wrapper`] plugin from the [`WrapperRegistry`] by
//! name, announces the job on the status topic, runs it, and publishes the
//! step payload to the `success` or `failure` output.
//!
//! Plugins see the recipe through a [`WrapperContext`], which also carries the
//! result-file hooks that feed attachments back into ISPyB.

pub mod subprocess;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::constants::{outputs, queues};
use crate::messaging::TransportError;
use crate::recipe::{ParameterChain, RecipeError, RecipeWrapper};

pub use subprocess::SubprocessWrapper;

#[derive(Error, Debug)]
pub enum WrapperError {
    #[error("Unknown wrapper '{name}' (available: {available})")]
    UnknownWrapper { name: String, available: String },

    #[error("Missing wrapper parameter '{name}'")]
    MissingParameter { name: String },

    #[error("Invalid wrapper parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Cannot start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl WrapperError {
    pub fn unknown_wrapper<S: Into<String>>(name: S, available: &[&str]) -> Self {
        Self::UnknownWrapper {
            name: name.into(),
            available: available.join(", "),
        }
    }

    pub fn missing_parameter<S: Into<String>>(name: S) -> Self {
        Self::MissingParameter { name: name.into() }
    }

    pub fn invalid_parameter<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type WrapperResult<T> = Result<T, WrapperError>;

/// A file produced by a job, to be attached to its processing program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultFile {
    pub file_path: String,
    pub file_name: String,
    pub file_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance_rank: Option<i64>,
}

impl ResultFile {
    /// Split `path` into directory and file name
    pub fn from_path(path: &std::path::Path, file_type: &str) -> Self {
        Self {
            file_path: path
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_type: file_type.to_string(),
            importance_rank: None,
        }
    }

    pub fn with_importance_rank(mut self, rank: i64) -> Self {
        self.importance_rank = Some(rank);
        self
    }
}

/// What a wrapper plugin sees of its job
#[derive(Debug)]
pub struct WrapperContext {
    rw: RecipeWrapper,
    clock: Arc<dyn Clock>,
}

impl WrapperContext {
    pub fn new(rw: RecipeWrapper, clock: Arc<dyn Clock>) -> Self {
        Self { rw, clock }
    }

    pub fn recipe_wrapper(&self) -> &RecipeWrapper {
        &self.rw
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The step's `wrapper` mapping ahead of its ordinary parameters
    pub fn parameters(&self) -> ParameterChain {
        let chain = self.rw.parameters();
        match &self.rw.current_step().wrapper {
            Some(Value::Object(wrapper)) => chain.with_front_layer(wrapper.clone()),
            _ => chain,
        }
    }

    /// Publish one result file on `result-individual-file`
    pub async fn record_result_individual_file(&self, file: &ResultFile) -> WrapperResult<()> {
        let payload = serde_json::to_value(file).map_err(TransportError::from)?;
        info!(
            file_path = %file.file_path,
            file_name = %file.file_name,
            file_type = %file.file_type,
            "Recording result file"
        );
        self.rw
            .send_to(outputs::RESULT_INDIVIDUAL_FILE, payload, None)
            .await?;
        Ok(())
    }

    /// Publish a batch of result files on `result-all-files`
    pub async fn record_result_all_files(&self, files: &[ResultFile]) -> WrapperResult<()> {
        if files.is_empty() {
            return Ok(());
        }
        let filelist = serde_json::to_value(files).map_err(TransportError::from)?;
        info!(count = files.len(), "Recording result file list");
        self.rw
            .send_to(outputs::RESULT_ALL_FILES, json!({ "filelist": filelist }), None)
            .await?;
        Ok(())
    }
}

/// A job plugin
///
/// `run` returns whether the job succeeded. An error is reported the same
/// way as an unsuccessful job.
#[async_trait]
pub trait Wrapper: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    async fn run(&self, context: &WrapperContext) -> WrapperResult<bool>;
}

/// Wrapper plugins by name
#[derive(Debug, Default)]
pub struct WrapperRegistry {
    wrappers: HashMap<String, Arc<dyn Wrapper>>,
}

impl WrapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SubprocessWrapper));
        registry
    }

    pub fn register(&mut self, wrapper: Arc<dyn Wrapper>) {
        self.wrappers.insert(wrapper.name().to_string(), wrapper);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Wrapper>> {
        self.wrappers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.wrappers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Starting,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

/// Drives one wrapper invocation from start to status notification
#[derive(Debug)]
pub struct WrapperRunner {
    registry: WrapperRegistry,
    clock: Arc<dyn Clock>,
}

impl WrapperRunner {
    pub fn new(registry: WrapperRegistry, clock: Arc<dyn Clock>) -> Self {
        Self { registry, clock }
    }

    /// Run wrapper `name` against `rw`; returns whether the job succeeded
    ///
    /// Only an unknown wrapper or a failure to publish is an error; a failing
    /// job is reported on the `failure` output.
    pub async fn run(&self, name: &str, rw: RecipeWrapper) -> WrapperResult<bool> {
        let wrapper = self
            .registry
            .get(name)
            .ok_or_else(|| WrapperError::unknown_wrapper(name, &self.registry.names()))?;
        let context = WrapperContext::new(rw, self.clock.clone());

        self.notify(&context, name, JobStatus::Starting).await?;
        info!(
            wrapper = name,
            recipe_pointer = context.rw.pointer(),
            "Starting wrapped job"
        );

        let success = match wrapper.run(&context).await {
            Ok(success) => success,
            Err(e) => {
                error!(wrapper = name, error = %e, "Wrapped job raised an error");
                false
            }
        };

        let (output, status) = if success {
            (outputs::SUCCESS, JobStatus::Finished)
        } else {
            warn!(wrapper = name, "Wrapped job failed");
            (outputs::FAILURE, JobStatus::Failed)
        };
        context
            .rw
            .send_to(output, context.rw.payload().clone(), None)
            .await?;
        self.notify(&context, name, status).await?;
        info!(wrapper = name, status = status.as_str(), "Wrapped job done");
        Ok(success)
    }

    async fn notify(
        &self,
        context: &WrapperContext,
        wrapper: &str,
        status: JobStatus,
    ) -> WrapperResult<()> {
        let mut message = Map::new();
        message.insert("wrapper".to_string(), json!(wrapper));
        message.insert("status".to_string(), json!(status.as_str()));
        message.insert("pid".to_string(), json!(std::process::id()));
        message.insert(
            "host".to_string(),
            json!(std::env::var("HOSTNAME").unwrap_or_default()),
        );
        message.insert("recipe_pointer".to_string(), json!(context.rw.pointer()));
        message.insert(
            "timestamp".to_string(),
            json!(self.clock.now_utc().to_rfc3339()),
        );
        context
            .rw
            .transport()
            .broadcast(queues::STATUS_TOPIC, Value::Object(message), None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::messaging::{InMemoryTransport, Transport};

    #[derive(Debug)]
    struct Fixed(bool);

    #[async_trait]
    impl Wrapper for Fixed {
        fn name(&self) -> &'static str {
            if self.0 {
                "pass"
            } else {
                "fail"
            }
        }

        async fn run(&self, context: &WrapperContext) -> WrapperResult<bool> {
            context
                .record_result_individual_file(
                    &ResultFile::from_path(std::path::Path::new("/dls/x/fast_dp.log"), "log")
                        .with_importance_rank(1),
                )
                .await?;
            Ok(self.0)
        }
    }

    fn wrapper(transport: Arc<InMemoryTransport>) -> RecipeWrapper {
        let message = json!({
            "recipe": {
                "1": {
                    "queue": "job",
                    "parameters": {"dcid": 5},
                    "wrapper": {"timeout": 10},
                    "output": {
                        "success": [2],
                        "failure": [3],
                        "result-individual-file": [4]
                    }
                },
                "2": {"queue": "done"},
                "3": {"queue": "broken"},
                "4": {"queue": "attachments"},
                "start": [[1, {}]]
            },
            "recipe-pointer": 1,
            "payload": {"dcid": 5}
        });
        RecipeWrapper::from_envelope(&message, transport).unwrap()
    }

    fn runner() -> WrapperRunner {
        let mut registry = WrapperRegistry::new();
        registry.register(Arc::new(Fixed(true)));
        registry.register(Arc::new(Fixed(false)));
        WrapperRunner::new(registry, Arc::new(FakeClock::new()))
    }

    #[tokio::test]
    async fn test_success_publishes_payload_and_statuses() {
        let transport = Arc::new(InMemoryTransport::new());
        let ok = runner().run("pass", wrapper(transport.clone())).await.unwrap();
        assert!(ok);

        let done = transport.published_to("done");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0]["payload"], json!({"dcid": 5}));
        assert!(transport.published_to("broken").is_empty());

        let statuses: Vec<Value> = transport
            .published_to(queues::STATUS_TOPIC)
            .into_iter()
            .map(|m| m["status"].clone())
            .collect();
        assert_eq!(statuses, vec![json!("starting"), json!("finished")]);

        let attachments = transport.published_to("attachments");
        assert_eq!(attachments[0]["payload"]["file_name"], "fast_dp.log");
        assert_eq!(attachments[0]["payload"]["file_path"], "/dls/x");
        assert_eq!(attachments[0]["payload"]["importance_rank"], 1);
    }

    #[tokio::test]
    async fn test_failure_goes_to_failure_output() {
        let transport = Arc::new(InMemoryTransport::new());
        let ok = runner().run("fail", wrapper(transport.clone())).await.unwrap();
        assert!(!ok);
        assert_eq!(transport.published_to("broken").len(), 1);
        assert!(transport.published_to("done").is_empty());
        let last = transport.published_to(queues::STATUS_TOPIC).pop().unwrap();
        assert_eq!(last["status"], "failed");
    }

    #[tokio::test]
    async fn test_unknown_wrapper_lists_available() {
        let transport = Arc::new(InMemoryTransport::new());
        let err = runner()
            .run("xia2", wrapper(transport.clone()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("fail, pass"));
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_wrapper_mapping_takes_precedence() {
        let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new());
        let message = json!({
            "recipe": {
                "1": {"queue": "job", "parameters": {"timeout": 1, "dcid": 5},
                      "wrapper": {"timeout": 10}},
                "start": [[1, {}]]
            },
            "recipe-pointer": 1
        });
        let rw = RecipeWrapper::from_envelope(&message, transport).unwrap();
        let context = WrapperContext::new(rw, Arc::new(FakeClock::new()));
        assert_eq!(context.parameters().get_i64("timeout"), Some(10));
        assert_eq!(context.parameters().get_i64("dcid"), Some(5));
    }
}
