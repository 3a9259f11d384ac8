//! Shipped trigger targets.
//!
//! Phasing targets skip data collections without an anomalous scatterer.
//! `multiplex` waits for the integration jobs of every related data
//! collection before combining them.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Trigger, TriggerCall, TriggerError, TriggerResult};
use crate::database::{DataCollection, ImageSweep, NewProcessingJob, ProgramStatus};

/// Data collection named by `dcid`, or `None` after logging
async fn data_collection(
    call: &TriggerCall<'_>,
    dcid: i64,
) -> Result<Option<DataCollection>, TriggerError> {
    let dc = call.store().data_collection(dcid).await?;
    if dc.is_none() {
        warn!(trigger = %call.target, dcid, "Data collection not found");
    }
    Ok(dc)
}

fn has_anomalous_scatterer(dc: &DataCollection) -> bool {
    dc.anomalous_scatterer
        .as_deref()
        .is_some_and(|s| !s.trim().is_empty())
}

fn job(
    call: &TriggerCall<'_>,
    dcid: i64,
    display_name: &str,
    recipe: &str,
    parameters: Vec<(String, String)>,
) -> NewProcessingJob {
    NewProcessingJob {
        dcid,
        display_name: display_name.to_string(),
        comments: call.comment(),
        recipe: recipe.to_string(),
        automatic: call.automatic(),
        parameters,
        sweeps: Vec::new(),
    }
}

fn sweep_of(dc: &DataCollection) -> ImageSweep {
    ImageSweep {
        dcid: dc.dcid,
        start_image: dc.start_image_number,
        end_image: dc.end_image_number(),
    }
}

/// Molecular replacement with DIMPLE against the supplied models
#[derive(Debug, Clone, Copy, Default)]
pub struct Dimple;

#[async_trait]
impl Trigger for Dimple {
    async fn run(&self, call: &mut TriggerCall<'_>) -> Result<TriggerResult, TriggerError> {
        let dcid = call.required_i64("dcid")?;
        let pdb = call.string_list("pdb");
        if pdb.is_empty() {
            info!(dcid, "No PDB files or codes given, skipping dimple");
            return Ok(TriggerResult::skipped());
        }
        let mut parameters = vec![
            ("data".to_string(), call.required_str("mtz")?),
            ("scaling_id".to_string(), call.required_i64("scaling_id")?.to_string()),
        ];
        parameters.extend(pdb.into_iter().map(|p| ("pdb".to_string(), p)));

        let job = job(call, dcid, "DIMPLE", "postprocessing-dimple", parameters);
        call.hand_off(job).await
    }
}

/// Phasing success prediction
#[derive(Debug, Clone, Copy, Default)]
pub struct EpPredict;

#[async_trait]
impl Trigger for EpPredict {
    async fn run(&self, call: &mut TriggerCall<'_>) -> Result<TriggerResult, TriggerError> {
        let dcid = call.required_i64("dcid")?;
        let Some(dc) = data_collection(call, dcid).await? else {
            return Ok(TriggerResult::failure());
        };
        if !has_anomalous_scatterer(&dc) {
            info!(dcid, "No anomalous scatterer, skipping ep_predict");
            return Ok(TriggerResult::skipped());
        }
        let parameters = vec![
            ("data".to_string(), call.required_str("data")?),
            ("program_id".to_string(), call.required_i64("program_id")?.to_string()),
        ];
        let job = job(call, dcid, "ep_predict", "postprocessing-ep-predict", parameters);
        call.hand_off(job).await
    }
}

/// Fast experimental phasing
#[derive(Debug, Clone, Copy, Default)]
pub struct FastEp;

#[async_trait]
impl Trigger for FastEp {
    async fn run(&self, call: &mut TriggerCall<'_>) -> Result<TriggerResult, TriggerError> {
        let dcid = call.required_i64("dcid")?;
        let Some(dc) = data_collection(call, dcid).await? else {
            return Ok(TriggerResult::failure());
        };
        if !has_anomalous_scatterer(&dc) {
            info!(dcid, "No anomalous scatterer, skipping fast_ep");
            return Ok(TriggerResult::skipped());
        }
        let parameters = vec![
            ("data".to_string(), call.required_str("mtz")?),
            ("scaling_id".to_string(), call.required_i64("scaling_id")?.to_string()),
            ("check_go_fast_ep".to_string(), "true".to_string()),
        ];
        let job = job(call, dcid, "fast_ep", "postprocessing-fast-ep", parameters);
        call.hand_off(job).await
    }
}

/// Molecular replacement with MrBUMP from a sequence
#[derive(Debug, Clone, Copy, Default)]
pub struct Mrbump;

#[async_trait]
impl Trigger for Mrbump {
    async fn run(&self, call: &mut TriggerCall<'_>) -> Result<TriggerResult, TriggerError> {
        let dcid = call.required_i64("dcid")?;
        let Some(sequence) = call.parameters.get_str("sequence").filter(|s| !s.trim().is_empty())
        else {
            info!(dcid, "No sequence available, skipping mrbump");
            return Ok(TriggerResult::skipped());
        };
        let mut parameters = vec![
            ("hklin".to_string(), call.required_str("hklin")?),
            ("scaling_id".to_string(), call.required_i64("scaling_id")?.to_string()),
            ("sequence".to_string(), sequence),
        ];
        parameters.extend(
            call.string_list("pdb")
                .into_iter()
                .map(|p| ("localfile".to_string(), p)),
        );
        let job = job(call, dcid, "MrBUMP", "postprocessing-mrbump", parameters);
        call.hand_off(job).await
    }
}

/// Full experimental phasing, not run for excluded proposal types
#[derive(Debug, Clone)]
pub struct BigEp {
    pub excluded_proposal_codes: Vec<String>,
}

impl Default for BigEp {
    fn default() -> Self {
        Self {
            excluded_proposal_codes: vec!["in".to_string(), "sw".to_string()],
        }
    }
}

#[async_trait]
impl Trigger for BigEp {
    async fn run(&self, call: &mut TriggerCall<'_>) -> Result<TriggerResult, TriggerError> {
        let dcid = call.required_i64("dcid")?;
        let Some(dc) = data_collection(call, dcid).await? else {
            return Ok(TriggerResult::failure());
        };
        if let Some(code) = dc.proposal_code.as_deref() {
            if self
                .excluded_proposal_codes
                .iter()
                .any(|excluded| excluded.eq_ignore_ascii_case(code))
            {
                info!(dcid, proposal_code = %code, "Proposal type excluded, skipping big_ep");
                return Ok(TriggerResult::skipped());
            }
        }
        if !has_anomalous_scatterer(&dc) {
            info!(dcid, "No anomalous scatterer, skipping big_ep");
            return Ok(TriggerResult::skipped());
        }
        let mut parameters = vec![
            ("data".to_string(), call.required_str("mtz")?),
            ("scaling_id".to_string(), call.required_i64("scaling_id")?.to_string()),
        ];
        if let Some(program_id) = call.optional_i64("program_id")? {
            parameters.push(("program_id".to_string(), program_id.to_string()));
        }
        let job = job(call, dcid, "big_ep", "postprocessing-big-ep", parameters);
        call.hand_off(job).await
    }
}

/// Multi-sweep scaling of related data collections
///
/// Predecessors are the automatic jobs of `predecessor_recipe` on every
/// related data collection. While any of them is unfinished the message is
/// checkpointed with exponential backoff; once the budget is spent the job
/// goes ahead with the collections whose predecessors succeeded.
#[derive(Debug, Clone)]
pub struct Multiplex {
    pub predecessor_recipe: String,
}

impl Default for Multiplex {
    fn default() -> Self {
        Self {
            predecessor_recipe: "autoprocessing-xia2-dials".to_string(),
        }
    }
}

#[async_trait]
impl Trigger for Multiplex {
    async fn run(&self, call: &mut TriggerCall<'_>) -> Result<TriggerResult, TriggerError> {
        let dcid = call.required_i64("dcid")?;
        let predecessor_recipe = call
            .parameters
            .get_str("predecessor_recipe")
            .unwrap_or_else(|| self.predecessor_recipe.clone());

        let mut related = vec![dcid];
        for entry in call.string_list("related_dcids") {
            let related_dcid = entry
                .parse::<i64>()
                .map_err(|_| TriggerError::invalid_parameter("related_dcids", "integers required"))?;
            if !related.contains(&related_dcid) {
                related.push(related_dcid);
            }
        }

        let mut pending = Vec::new();
        let mut succeeded = Vec::new();
        for related_dcid in &related {
            let jobs = call.store().processing_jobs_for_dcid(*related_dcid).await?;
            let predecessors: Vec<_> = jobs
                .iter()
                .filter(|job| job.automatic && job.recipe.as_deref() == Some(predecessor_recipe.as_str()))
                .collect();
            if predecessors.iter().any(|job| !job.program_status.is_finished()) {
                pending.push(*related_dcid);
            }
            if predecessors
                .iter()
                .any(|job| job.program_status == ProgramStatus::Success)
            {
                succeeded.push(*related_dcid);
            }
        }

        let ntry = call.ntry();
        if !pending.is_empty() {
            if !call.backoff().exhausted(ntry) {
                info!(dcid, ?pending, ntry, "Predecessor jobs still running");
                return call.retry_later().await;
            }
            warn!(
                dcid,
                ?pending,
                ntry,
                "Gave up waiting on predecessor jobs, continuing with finished ones"
            );
        }

        if succeeded.len() < 2 {
            info!(
                dcid,
                successful = succeeded.len(),
                "Fewer than two successful sweeps, skipping multiplex"
            );
            return Ok(TriggerResult::skipped());
        }

        let mut sweeps = Vec::new();
        for related_dcid in &succeeded {
            let Some(dc) = data_collection(call, *related_dcid).await? else {
                return Ok(TriggerResult::failure());
            };
            sweeps.push(sweep_of(&dc));
        }
        let parameters = succeeded
            .iter()
            .map(|d| ("related_dcid".to_string(), d.to_string()))
            .collect();
        let mut job = job(call, dcid, "xia2.multiplex", "postprocessing-xia2-multiplex", parameters);
        job.sweeps = sweeps;
        call.hand_off(job).await
    }
}
