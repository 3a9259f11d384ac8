//! In-process metadata store.
//!
//! Holds everything in concurrent maps. Besides the [`MetadataStore`]
//! operations it exposes seeding and inspection helpers for tests, and can
//! be told to fail a number of upcoming calls with a transient error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use super::{
    DataCollection, MetadataStore, NewProcessingJob, ProcessingJobSummary, ProgramAttachment,
    ProgramMessage, ProgramRegistration, ProgramStatus, ProgramStatusUpdate, StoreError,
    StoreResult,
};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredProgram {
    pub program_id: i64,
    pub registration: ProgramRegistration,
    pub status: ProgramStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
struct BufferEntry {
    value: Value,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct InMemoryMetadataStore {
    data_collections: DashMap<i64, DataCollection>,
    jobs: DashMap<i64, NewProcessingJob>,
    job_requests: DashMap<String, i64>,
    job_status: DashMap<i64, ProgramStatus>,
    programs: DashMap<i64, StoredProgram>,
    attachments: Mutex<Vec<ProgramAttachment>>,
    messages: Mutex<Vec<ProgramMessage>>,
    buffer: DashMap<(i64, String), BufferEntry>,
    next_id: AtomicI64,
    pending_failures: AtomicU32,
    calls: Mutex<Vec<String>>,
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            data_collections: DashMap::new(),
            jobs: DashMap::new(),
            job_requests: DashMap::new(),
            job_status: DashMap::new(),
            programs: DashMap::new(),
            attachments: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            buffer: DashMap::new(),
            next_id: AtomicI64::new(1000),
            pending_failures: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn insert_data_collection(&self, dc: DataCollection) {
        self.data_collections.insert(dc.dcid, dc);
    }

    /// Set the program status reported for a processing job
    pub fn set_job_status(&self, job_id: i64, status: ProgramStatus) {
        self.job_status.insert(job_id, status);
    }

    /// Fail the next `count` calls with a transient error
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub fn job(&self, job_id: i64) -> Option<NewProcessingJob> {
        self.jobs.get(&job_id).map(|job| job.clone())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn program(&self, program_id: i64) -> Option<StoredProgram> {
        self.programs.get(&program_id).map(|p| p.clone())
    }

    pub fn programs(&self) -> Vec<StoredProgram> {
        let mut programs: Vec<_> = self.programs.iter().map(|p| p.clone()).collect();
        programs.sort_by_key(|p| p.program_id);
        programs
    }

    pub fn attachments(&self) -> Vec<ProgramAttachment> {
        self.attachments.lock().clone()
    }

    pub fn program_messages(&self) -> Vec<ProgramMessage> {
        self.messages.lock().clone()
    }

    /// Names of the successful write calls, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    fn check_failure(&self, operation: &str) -> StoreResult<()> {
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(StoreError::transient(operation, "injected failure"))
        } else {
            Ok(())
        }
    }

    fn record(&self, operation: &str) {
        self.calls.lock().push(operation.to_string());
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn data_collection(&self, dcid: i64) -> StoreResult<Option<DataCollection>> {
        self.check_failure("data_collection")?;
        Ok(self.data_collections.get(&dcid).map(|dc| dc.clone()))
    }

    async fn processing_jobs_for_dcid(&self, dcid: i64) -> StoreResult<Vec<ProcessingJobSummary>> {
        self.check_failure("processing_jobs_for_dcid")?;
        let mut jobs: Vec<_> = self
            .jobs
            .iter()
            .filter(|job| job.dcid == dcid)
            .map(|job| ProcessingJobSummary {
                job_id: *job.key(),
                dcid,
                recipe: Some(job.recipe.clone()),
                automatic: job.automatic,
                program_status: self
                    .job_status
                    .get(job.key())
                    .map_or(ProgramStatus::NotStarted, |s| *s),
            })
            .collect();
        jobs.sort_by_key(|job| job.job_id);
        Ok(jobs)
    }

    async fn create_processing_job(&self, job: &NewProcessingJob) -> StoreResult<i64> {
        self.check_failure("create_processing_job")?;
        let job_id = self.allocate_id();
        self.jobs.insert(job_id, job.clone());
        self.record("create_processing_job");
        Ok(job_id)
    }

    async fn create_processing_job_once(
        &self,
        request_key: &str,
        job: &NewProcessingJob,
    ) -> StoreResult<i64> {
        self.check_failure("create_processing_job")?;
        match self.job_requests.entry(request_key.to_string()) {
            Entry::Occupied(existing) => Ok(*existing.get()),
            Entry::Vacant(vacant) => {
                let job_id = self.allocate_id();
                self.jobs.insert(job_id, job.clone());
                vacant.insert(job_id);
                self.record("create_processing_job");
                Ok(job_id)
            }
        }
    }

    async fn register_processing(&self, registration: &ProgramRegistration) -> StoreResult<i64> {
        self.check_failure("register_processing")?;
        let program_id = self.allocate_id();
        self.programs.insert(
            program_id,
            StoredProgram {
                program_id,
                registration: registration.clone(),
                status: ProgramStatus::Running,
                message: None,
            },
        );
        if let Some(job_id) = registration.job_id {
            self.job_status.insert(job_id, ProgramStatus::Running);
        }
        self.record("register_processing");
        Ok(program_id)
    }

    async fn update_processing_status(&self, update: &ProgramStatusUpdate) -> StoreResult<i64> {
        self.check_failure("update_processing_status")?;
        let mut program = self
            .programs
            .get_mut(&update.program_id)
            .ok_or_else(|| StoreError::not_found("AutoProcProgram", update.program_id))?;
        program.status = update.status;
        program.message = update.message.clone();
        if let Some(job_id) = program.registration.job_id {
            self.job_status.insert(job_id, update.status);
        }
        drop(program);
        self.record("update_processing_status");
        Ok(update.program_id)
    }

    async fn add_program_attachment(&self, attachment: &ProgramAttachment) -> StoreResult<i64> {
        self.check_failure("add_program_attachment")?;
        if !self.programs.contains_key(&attachment.program_id) {
            return Err(StoreError::not_found(
                "AutoProcProgram",
                attachment.program_id,
            ));
        }
        self.attachments.lock().push(attachment.clone());
        self.record("add_program_attachment");
        Ok(self.allocate_id())
    }

    async fn add_program_message(&self, message: &ProgramMessage) -> StoreResult<i64> {
        self.check_failure("add_program_message")?;
        self.messages.lock().push(message.clone());
        self.record("add_program_message");
        Ok(self.allocate_id())
    }

    async fn buffer_store(
        &self,
        program_id: i64,
        uuid: &str,
        value: &Value,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_failure("buffer_store")?;
        self.buffer.insert(
            (program_id, uuid.to_string()),
            BufferEntry {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn buffer_load(
        &self,
        program_id: i64,
        uuid: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Value>> {
        self.check_failure("buffer_load")?;
        Ok(self
            .buffer
            .get(&(program_id, uuid.to_string()))
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn buffer_evict_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let before = self.buffer.len();
        self.buffer.retain(|_, entry| entry.expires_at > now);
        Ok((before - self.buffer.len()) as u64)
    }
}
