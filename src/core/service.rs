//! Job submission, deletion and the update sweep
//!
//! Everything here runs before or beside the pipeline: requests are fully
//! validated before a record is created, so invalid input never reaches a
//! worker.

use log::{info, warn};

use crate::core::config::Config;
use crate::core::engine::EngineRegistry;
use crate::core::error::{suggest_correction, Error, Result};
use crate::core::geometry::{equal_area, parse_box, validate};
use crate::core::job::{validate_name, Job, JobStatus, NewJob};
use crate::core::package::{remove_dir_if_exists, Compression};
use crate::core::store::Session;

/// A job as requested, before validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub name: String,
    pub description: String,
    pub provider: String,
    /// `minx,miny,maxx,maxy`
    pub bbox: String,
    pub engine: String,
    pub compression: String,
    pub update: bool,
    pub user_id: i64,
}

/// Validate a request into the inputs of a new job
pub fn validate_request(config: &Config, engines: &EngineRegistry, request: &JobRequest) -> Result<NewJob> {
    validate_name(&request.name)?;

    let bbox = parse_box(&request.bbox)?;
    validate(&bbox)?;

    if !config.enabled_providers.contains(&request.provider) {
        return Err(Error::UnknownProvider {
            name: request.provider.clone(),
            suggestion: suggest_correction(&request.provider, &config.enabled_providers),
        });
    }

    let available: Vec<String> = config
        .enabled_engines
        .iter()
        .filter(|e| engines.contains(e))
        .cloned()
        .collect();
    if !available.contains(&request.engine) {
        return Err(Error::UnknownEngine {
            name: request.engine.clone(),
            suggestion: suggest_correction(&request.engine, &available),
        });
    }

    let compression: Compression = request.compression.parse()?;

    Ok(NewJob {
        name: request.name.trim().to_string(),
        description: request.description.clone(),
        provider: request.provider.clone(),
        bbox,
        engine: request.engine.clone(),
        compression,
        user_id: request.user_id,
        update: request.update,
    })
}

/// Validate, record and enqueue a job
pub fn submit_job(
    config: &Config,
    engines: &EngineRegistry,
    session: &mut Session,
    request: &JobRequest,
) -> Result<Job> {
    let new_job = validate_request(config, engines, request)?;
    if !session.user_exists(new_job.user_id)? {
        return Err(Error::UserNotFound(new_job.user_id));
    }

    let job = session.insert_job(&new_job)?;
    session.enqueue(job.id)?;
    info!("job {}: queued {} for {}", job.id, job.package_stem(), job.bbox);

    session.get_job(job.id)
}

/// Remove a job, its pending queue entry and its files
///
/// A worker running the job notices the missing record and cleans up
/// whatever it produces afterwards.
pub fn delete_job(config: &Config, session: &mut Session, job_id: i64) -> Result<Job> {
    let cancelled = session.cancel(job_id)?;
    let job = session.delete_job(job_id)?;

    let paths = job.paths(&config.data_dir);
    for dir in [&paths.package_dir, &paths.work_dir] {
        if let Err(e) = remove_dir_if_exists(dir) {
            warn!("job {job_id}: failed to remove {}: {e}", dir.display());
        }
    }

    info!(
        "job {job_id}: deleted ({})",
        if cancelled > 0 { "was queued" } else { "not queued" }
    );
    Ok(job)
}

/// Requeue every completed job flagged for updates, largest area first
pub fn queue_updates(session: &mut Session) -> Result<Vec<i64>> {
    let mut jobs = session.jobs_for_update()?;
    jobs.sort_by(|a, b| equal_area(&b.bbox).total_cmp(&equal_area(&a.bbox)));

    let mut queued = Vec::with_capacity(jobs.len());
    for job in jobs {
        session.set_status(job.id, JobStatus::Queued)?;
        session.enqueue(job.id)?;
        info!("job {}: queued for update", job.id);
        queued.push(job.id);
    }

    Ok(queued)
}
