//! # Metadata Store
//!
//! The narrow slice of the ISPyB database the services read and write:
//! data collections, processing jobs, processing programs with their
//! attachments and messages, and the short-lived reference buffer used to
//! pass identifiers between recipe steps running on different workers.
//!
//! [`MetadataStore`] is implemented by [`PgMetadataStore`] for PostgreSQL and
//! by [`InMemoryMetadataStore`] for tests and single-process deployments.

pub mod in_memory;
pub mod migrations;
pub mod postgres;
pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

pub use in_memory::InMemoryMetadataStore;
pub use migrations::DatabaseMigrations;
pub use postgres::PgMetadataStore;
pub use retry::RetryPolicy;

use crate::config::DatabaseConfig;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error during {operation}: {source}")]
    Database {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: i64 },

    #[error("Invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    /// A failure known to clear up on its own (used by the in-memory store)
    #[error("Transient store failure during {operation}: {message}")]
    Transient { operation: String, message: String },

    #[error("Migration {version} failed: {message}")]
    Migration { version: String, message: String },
}

impl StoreError {
    pub fn database<S: Into<String>>(operation: S, source: sqlx::Error) -> Self {
        Self::Database {
            operation: operation.into(),
            source,
        }
    }

    pub fn not_found<S: Into<String>>(entity: S, id: i64) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id,
        }
    }

    pub fn invalid_input<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn transient<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same call may succeed
    ///
    /// Pool timeouts, I/O failures, serialization failures (`40001`) and
    /// deadlocks (`40P01`) are transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::Database { source, .. } => match source {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
                sqlx::Error::Database(db) => {
                    matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
                }
                _ => false,
            },
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Status of an auto-processing program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
    NotStarted,
    Running,
    Success,
    Failure,
}

impl ProgramStatus {
    /// Database encoding: NULL while running, 1 for success, 0 for failure
    pub fn as_db(self) -> Option<i16> {
        match self {
            Self::NotStarted | Self::Running => None,
            Self::Success => Some(1),
            Self::Failure => Some(0),
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Parse the status names used in ISPyB commands
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" | "1" => Some(Self::Success),
            "failure" | "failed" | "0" => Some(Self::Failure),
            "running" | "started" => Some(Self::Running),
            "not_started" | "pending" => Some(Self::NotStarted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataCollection {
    pub dcid: i64,
    pub dcg_id: Option<i64>,
    pub proposal_code: Option<String>,
    pub proposal_number: Option<i64>,
    pub visit_number: Option<i64>,
    pub image_directory: Option<String>,
    pub file_template: Option<String>,
    pub start_image_number: i64,
    pub number_of_images: i64,
    pub wavelength: Option<f64>,
    pub anomalous_scatterer: Option<String>,
}

impl DataCollection {
    pub fn new(dcid: i64) -> Self {
        Self {
            dcid,
            dcg_id: None,
            proposal_code: None,
            proposal_number: None,
            visit_number: None,
            image_directory: None,
            file_template: None,
            start_image_number: 1,
            number_of_images: 0,
            wavelength: None,
            anomalous_scatterer: None,
        }
    }

    pub fn end_image_number(&self) -> i64 {
        self.start_image_number + self.number_of_images.max(1) - 1
    }

    /// Visit name such as `mx12345-6`
    pub fn visit(&self) -> Option<String> {
        Some(format!(
            "{}{}-{}",
            self.proposal_code.as_deref()?,
            self.proposal_number?,
            self.visit_number?
        ))
    }
}

/// A processing job with the status of its most recent program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingJobSummary {
    pub job_id: i64,
    pub dcid: i64,
    pub recipe: Option<String>,
    pub automatic: bool,
    pub program_status: ProgramStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSweep {
    pub dcid: i64,
    pub start_image: i64,
    pub end_image: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProcessingJob {
    pub dcid: i64,
    pub display_name: String,
    pub comments: Option<String>,
    pub recipe: String,
    pub automatic: bool,
    pub parameters: Vec<(String, String)>,
    pub sweeps: Vec<ImageSweep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramRegistration {
    pub job_id: Option<i64>,
    pub program: String,
    pub command_line: Option<String>,
    pub environment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramStatusUpdate {
    pub program_id: i64,
    pub status: ProgramStatus,
    pub message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramAttachment {
    pub program_id: i64,
    pub file_path: String,
    pub file_name: String,
    pub file_type: String,
    pub importance_rank: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramMessage {
    pub program_id: i64,
    pub severity: String,
    pub message: String,
    pub description: Option<String>,
}

#[async_trait]
pub trait MetadataStore: Send + Sync + std::fmt::Debug {
    async fn data_collection(&self, dcid: i64) -> StoreResult<Option<DataCollection>>;

    async fn processing_jobs_for_dcid(&self, dcid: i64) -> StoreResult<Vec<ProcessingJobSummary>>;

    /// Insert a job with its parameters and image sweeps; returns the job id
    async fn create_processing_job(&self, job: &NewProcessingJob) -> StoreResult<i64>;

    /// Create a job at most once per `request_key`
    ///
    /// A repeated key returns the job created by the first call, so a
    /// redelivered request does not create a duplicate.
    async fn create_processing_job_once(
        &self,
        request_key: &str,
        job: &NewProcessingJob,
    ) -> StoreResult<i64>;

    /// Register a processing program; returns the program id
    async fn register_processing(&self, registration: &ProgramRegistration) -> StoreResult<i64>;

    async fn update_processing_status(&self, update: &ProgramStatusUpdate) -> StoreResult<i64>;

    async fn add_program_attachment(&self, attachment: &ProgramAttachment) -> StoreResult<i64>;

    async fn add_program_message(&self, message: &ProgramMessage) -> StoreResult<i64>;

    /// Insert or replace a buffer entry
    async fn buffer_store(
        &self,
        program_id: i64,
        uuid: &str,
        value: &Value,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Buffer entry if present and not expired at `now`
    async fn buffer_load(
        &self,
        program_id: i64,
        uuid: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Value>>;

    /// Delete entries expired at `now`; returns the number removed
    async fn buffer_evict_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

/// Build the store selected by the configuration
pub async fn connect_store(config: &DatabaseConfig) -> StoreResult<Arc<dyn MetadataStore>> {
    if config.is_in_memory() {
        return Ok(Arc::new(InMemoryMetadataStore::new()));
    }
    let store = PgMetadataStore::connect(config).await?;
    if config.run_migrations {
        DatabaseMigrations::run_all(store.pool()).await?;
    }
    Ok(Arc::new(store))
}
