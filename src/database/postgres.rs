//! PostgreSQL metadata store.
//!
//! Runtime-checked `sqlx` queries against the schema in `migrations/`.
//! Multi-row writes (a job with its parameters and sweeps) run in one
//! database transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, info};

use super::{
    DataCollection, MetadataStore, NewProcessingJob, ProcessingJobSummary, ProgramAttachment,
    ProgramMessage, ProgramRegistration, ProgramStatus, ProgramStatusUpdate, StoreError,
    StoreResult,
};
use crate::config::DatabaseConfig;

#[derive(Debug, Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        info!(max_connections = config.max_connections, "Connecting metadata store");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.url)
            .await
            .map_err(|e| StoreError::database("connect", e))?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn data_collection_from_row(row: &PgRow) -> Result<DataCollection, sqlx::Error> {
        Ok(DataCollection {
            dcid: row.try_get("dcid")?,
            dcg_id: row.try_get("dcg_id")?,
            proposal_code: row.try_get("proposal_code")?,
            proposal_number: row.try_get("proposal_number")?,
            visit_number: row.try_get("visit_number")?,
            image_directory: row.try_get("image_directory")?,
            file_template: row.try_get("file_template")?,
            start_image_number: row.try_get("start_image_number")?,
            number_of_images: row.try_get("number_of_images")?,
            wavelength: row.try_get("wavelength")?,
            anomalous_scatterer: row.try_get("anomalous_scatterer")?,
        })
    }

    fn program_status(has_program: bool, status: Option<i16>) -> ProgramStatus {
        match (has_program, status) {
            (false, _) => ProgramStatus::NotStarted,
            (true, None) => ProgramStatus::Running,
            (true, Some(0)) => ProgramStatus::Failure,
            (true, Some(_)) => ProgramStatus::Success,
        }
    }

    /// Insert a job with its parameters and sweeps in one transaction
    ///
    /// With a request key, a job already created under the same key is
    /// returned instead.
    async fn insert_processing_job(
        &self,
        request_key: Option<&str>,
        job: &NewProcessingJob,
    ) -> StoreResult<i64> {
        let op = "create_processing_job";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::database(op, e))?;

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO processing_job (dcid, display_name, comments, recipe, automatic, request_key)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (request_key) DO NOTHING
            RETURNING processing_job_id
            "#,
        )
        .bind(job.dcid)
        .bind(&job.display_name)
        .bind(&job.comments)
        .bind(&job.recipe)
        .bind(job.automatic)
        .bind(request_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::database(op, e))?;

        let job_id = match inserted {
            Some(job_id) => job_id,
            None => {
                let existing: i64 = sqlx::query_scalar(
                    "SELECT processing_job_id FROM processing_job WHERE request_key = $1",
                )
                .bind(request_key)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| StoreError::database(op, e))?;
                tx.commit().await.map_err(|e| StoreError::database(op, e))?;
                debug!(job_id = existing, request_key = ?request_key, "Processing job already created");
                return Ok(existing);
            }
        };

        for (key, value) in &job.parameters {
            sqlx::query(
                "INSERT INTO processing_job_parameter (processing_job_id, parameter_key, parameter_value) VALUES ($1, $2, $3)",
            )
            .bind(job_id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::database(op, e))?;
        }

        for sweep in &job.sweeps {
            sqlx::query(
                "INSERT INTO processing_job_image_sweep (processing_job_id, dcid, start_image, end_image) VALUES ($1, $2, $3, $4)",
            )
            .bind(job_id)
            .bind(sweep.dcid)
            .bind(sweep.start_image)
            .bind(sweep.end_image)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::database(op, e))?;
        }

        tx.commit().await.map_err(|e| StoreError::database(op, e))?;
        debug!(job_id, dcid = job.dcid, recipe = %job.recipe, "Processing job created");
        Ok(job_id)
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn data_collection(&self, dcid: i64) -> StoreResult<Option<DataCollection>> {
        let row = sqlx::query(
            r#"
            SELECT dc.dcid, dc.dcg_id, p.proposal_code, p.proposal_number, s.visit_number,
                   dc.image_directory, dc.file_template, dc.start_image_number,
                   dc.number_of_images, dc.wavelength, dc.anomalous_scatterer
            FROM data_collection dc
            LEFT JOIN data_collection_group dcg ON dcg.dcg_id = dc.dcg_id
            LEFT JOIN bl_session s ON s.session_id = dcg.session_id
            LEFT JOIN proposal p ON p.proposal_id = s.proposal_id
            WHERE dc.dcid = $1
            "#,
        )
        .bind(dcid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::database("data_collection", e))?;

        row.as_ref()
            .map(Self::data_collection_from_row)
            .transpose()
            .map_err(|e| StoreError::database("data_collection", e))
    }

    async fn processing_jobs_for_dcid(&self, dcid: i64) -> StoreResult<Vec<ProcessingJobSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT pj.processing_job_id, pj.dcid, pj.recipe, pj.automatic,
                   app.auto_proc_program_id IS NOT NULL AS has_program,
                   app.processing_status
            FROM processing_job pj
            LEFT JOIN LATERAL (
                SELECT auto_proc_program_id, processing_status
                FROM auto_proc_program
                WHERE processing_job_id = pj.processing_job_id
                ORDER BY auto_proc_program_id DESC
                LIMIT 1
            ) app ON TRUE
            WHERE pj.dcid = $1
            ORDER BY pj.processing_job_id
            "#,
        )
        .bind(dcid)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database("processing_jobs_for_dcid", e))?;

        rows.iter()
            .map(|row| -> Result<ProcessingJobSummary, sqlx::Error> {
                Ok(ProcessingJobSummary {
                    job_id: row.try_get("processing_job_id")?,
                    dcid: row.try_get("dcid")?,
                    recipe: row.try_get("recipe")?,
                    automatic: row.try_get("automatic")?,
                    program_status: Self::program_status(
                        row.try_get("has_program")?,
                        row.try_get("processing_status")?,
                    ),
                })
            })
            .collect::<Result<_, _>>()
            .map_err(|e| StoreError::database("processing_jobs_for_dcid", e))
    }

    async fn create_processing_job(&self, job: &NewProcessingJob) -> StoreResult<i64> {
        self.insert_processing_job(None, job).await
    }

    async fn create_processing_job_once(
        &self,
        request_key: &str,
        job: &NewProcessingJob,
    ) -> StoreResult<i64> {
        self.insert_processing_job(Some(request_key), job).await
    }

    async fn register_processing(&self, registration: &ProgramRegistration) -> StoreResult<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO auto_proc_program
                (processing_job_id, processing_programs, processing_command_line, processing_environment)
            VALUES ($1, $2, $3, $4)
            RETURNING auto_proc_program_id
            "#,
        )
        .bind(registration.job_id)
        .bind(&registration.program)
        .bind(&registration.command_line)
        .bind(&registration.environment)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::database("register_processing", e))
    }

    async fn update_processing_status(&self, update: &ProgramStatusUpdate) -> StoreResult<i64> {
        let result = sqlx::query(
            r#"
            UPDATE auto_proc_program
            SET processing_status = $2,
                processing_message = COALESCE($3, processing_message),
                processing_start_time = COALESCE($4, processing_start_time),
                processing_end_time = COALESCE($5, processing_end_time)
            WHERE auto_proc_program_id = $1
            "#,
        )
        .bind(update.program_id)
        .bind(update.status.as_db())
        .bind(&update.message)
        .bind(update.start_time)
        .bind(update.end_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("update_processing_status", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("AutoProcProgram", update.program_id));
        }
        Ok(update.program_id)
    }

    async fn add_program_attachment(&self, attachment: &ProgramAttachment) -> StoreResult<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO auto_proc_program_attachment
                (auto_proc_program_id, file_path, file_name, file_type, importance_rank)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING auto_proc_program_attachment_id
            "#,
        )
        .bind(attachment.program_id)
        .bind(&attachment.file_path)
        .bind(&attachment.file_name)
        .bind(&attachment.file_type)
        .bind(attachment.importance_rank)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::database("add_program_attachment", e))
    }

    async fn add_program_message(&self, message: &ProgramMessage) -> StoreResult<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO auto_proc_program_message
                (auto_proc_program_id, severity, message, description)
            VALUES ($1, $2, $3, $4)
            RETURNING auto_proc_program_message_id
            "#,
        )
        .bind(message.program_id)
        .bind(&message.severity)
        .bind(&message.message)
        .bind(&message.description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::database("add_program_message", e))
    }

    async fn buffer_store(
        &self,
        program_id: i64,
        uuid: &str,
        value: &Value,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO zocalo_buffer (auto_proc_program_id, uuid, reference, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (auto_proc_program_id, uuid)
            DO UPDATE SET reference = EXCLUDED.reference, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(program_id)
        .bind(uuid)
        .bind(Json(value))
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("buffer_store", e))?;
        Ok(())
    }

    async fn buffer_load(
        &self,
        program_id: i64,
        uuid: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Value>> {
        let reference: Option<Json<Value>> = sqlx::query_scalar(
            r#"
            SELECT reference FROM zocalo_buffer
            WHERE auto_proc_program_id = $1 AND uuid = $2 AND expires_at > $3
            "#,
        )
        .bind(program_id)
        .bind(uuid)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::database("buffer_load", e))?;
        Ok(reference.map(|Json(value)| value))
    }

    async fn buffer_evict_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM zocalo_buffer WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::database("buffer_evict_expired", e))?;
        Ok(result.rows_affected())
    }
}
