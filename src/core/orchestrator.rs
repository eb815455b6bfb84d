//! Job state machine
//!
//! `Queued → Extracting → Tiling → Completed`, with `Failed` reachable from
//! every running state. Each stage reports either a value or a classified
//! failure through [`StageOutcome`]; anything else that goes wrong is
//! interpreted afterwards by checking whether the job record still exists.
//! A missing record means the job was deleted while it ran.

use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{error, info, warn};

use crate::core::engine::{BuildContext, GraphBuilder};
use crate::core::error::{Error, FailureKind, Result};
use crate::core::extract::{check_extract, ensure_success, ExtractCheck};
use crate::core::job::{Job, JobPaths, JobStatus};
use crate::core::notify::{deliver, Notification, Outcome};
use crate::core::package::{pack_files, remove_dir_if_exists, write_sidecar, DirLock, PackageSidecar};
use crate::core::source::select_best_source;
use crate::core::store::Session;
use crate::core::worker::WorkerContext;

/// Last characters of build output kept in a failure message
const OUTPUT_TAIL: usize = 2000;

/// Result of one pipeline stage
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Success(T),
    Failure(FailureKind, String),
}

/// How a job run ended, other than with a recorded failure
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Package written to this archive
    Completed(PathBuf),
    /// The record disappeared while the job ran
    Deleted,
    /// The job was already terminal or gone when picked up
    Skipped,
}

/// Unwrap a stage's value or return its failure from the enclosing stage chain
macro_rules! stage {
    ($outcome:expr) => {
        match $outcome {
            StageOutcome::Success(value) => value,
            StageOutcome::Failure(kind, detail) => return Ok(StageOutcome::Failure(kind, detail)),
        }
    };
}

/// Drive job `job_id` from its current state to a terminal one
///
/// A recorded failure is returned as [`Error::Pipeline`] after the record,
/// the notification and the cleanup are done.
pub async fn run_job(ctx: &WorkerContext, job_id: i64) -> Result<JobOutcome> {
    let mut session = ctx.store.session()?;

    let Some(job) = session.find_job(job_id)? else {
        warn!("job {job_id}: deleted before it started");
        return Ok(JobOutcome::Skipped);
    };
    if job.status.is_terminal() {
        info!("job {job_id}: already {}, skipping", job.status);
        return Ok(JobOutcome::Skipped);
    }

    // The record may be gone by the time the outcome is reported
    let recipient = session
        .user_email(job.user_id)
        .unwrap_or_else(|_| format!("user {}", job.user_id));
    let paths = job.paths(&ctx.config.data_dir);

    let mut backend: Option<Box<dyn GraphBuilder>> = None;
    let result = drive(ctx, &mut session, &job, &paths, &mut backend).await;

    let finish = Finish {
        ctx,
        job: &job,
        paths: &paths,
        recipient: &recipient,
    };
    match result {
        Ok(StageOutcome::Success(archive)) => finish.completed(&mut session, backend, archive).await,
        Ok(StageOutcome::Failure(kind, detail)) => {
            if !session.job_exists(job.id)? {
                return finish.deleted(backend).await;
            }
            finish.failed(&mut session, kind, detail)
        }
        Err(e) => match session.job_exists(job.id) {
            Ok(false) => finish.deleted(backend).await,
            Ok(true) => {
                error!("job {}: infrastructure error: {e}", job.id);
                let _ = finish.failed(&mut session, FailureKind::Internal, e.to_string());
                Err(e)
            }
            Err(check) => {
                error!("job {}: {e}; existence check failed: {check}", job.id);
                Err(e)
            }
        },
    }
}

async fn drive(
    ctx: &WorkerContext,
    session: &mut Session,
    job: &Job,
    paths: &JobPaths,
    backend: &mut Option<Box<dyn GraphBuilder>>,
) -> Result<StageOutcome<PathBuf>> {
    session.set_status(job.id, JobStatus::Extracting)?;
    session.stamp_started(job.id, Utc::now())?;
    session.set_last_error(job.id, None)?;
    info!("job {}: extracting", job.id);

    stage!(extract_stage(ctx, job, paths).await?);

    session.set_status(job.id, JobStatus::Tiling)?;
    info!("job {}: tiling with {}", job.id, job.engine);

    let builder = backend.insert(stage!(resolve_backend(ctx, job, paths)));
    let output_dir = stage!(build_stage(session, job.id, &mut **builder, &paths.extract).await?);

    let archive = stage!(package_stage(ctx, job, paths, &**builder, &output_dir).await?);

    session.set_status(job.id, JobStatus::Completed)?;
    session.set_result_path(job.id, Some(&archive))?;
    Ok(StageOutcome::Success(archive))
}

/// Cut the job's box out of the best source extract, unless a valid cut exists
async fn extract_stage(ctx: &WorkerContext, job: &Job, paths: &JobPaths) -> Result<StageOutcome<()>> {
    if paths.extract.is_file() {
        if let Ok(ExtractCheck::Valid(_)) = check_extract(&paths.extract, ctx.headers.as_ref()) {
            info!("job {}: reusing {}", job.id, paths.extract.display());
            return Ok(StageOutcome::Success(()));
        }
    }

    if !paths.source_dir.is_dir() {
        return Ok(StageOutcome::Failure(
            FailureKind::NoSourceData,
            format!("no source directory {}", paths.source_dir.display()),
        ));
    }

    let source = match select_best_source(&paths.source_dir, &job.bbox, ctx.headers.as_ref()) {
        Ok(source) => source,
        Err(e @ Error::NoMatch { .. }) => {
            return Ok(StageOutcome::Failure(FailureKind::NoSourceData, e.to_string()))
        }
        Err(e) => return Err(e),
    };
    info!("job {}: cutting from {}", job.id, source.display());

    let child = match ctx.osmium.extract(&source, &job.bbox, &paths.extract) {
        Ok(child) => child,
        Err(Error::IoError(e)) => {
            return Ok(StageOutcome::Failure(FailureKind::ExtractFailed, e.to_string()))
        }
        Err(e) => return Err(e),
    };
    let output = child.wait_with_output().await?;
    if let Err(detail) = ensure_success(&output) {
        return Ok(StageOutcome::Failure(FailureKind::ExtractFailed, detail));
    }

    Ok(match check_extract(&paths.extract, ctx.headers.as_ref()) {
        Ok(ExtractCheck::Valid(_)) => StageOutcome::Success(()),
        Ok(ExtractCheck::Empty) => StageOutcome::Failure(
            FailureKind::EmptyExtract,
            format!("target box {} does not overlap source data", job.bbox),
        ),
        Err(e) => StageOutcome::Failure(FailureKind::ExtractFailed, format!("unreadable extract: {e}")),
    })
}

fn resolve_backend(ctx: &WorkerContext, job: &Job, paths: &JobPaths) -> StageOutcome<Box<dyn GraphBuilder>> {
    if !ctx.config.enabled_engines.contains(&job.engine) {
        return StageOutcome::Failure(
            FailureKind::UnknownEngine,
            format!("engine '{}' is not enabled", job.engine),
        );
    }
    let Some(image) = ctx.config.image(&job.engine) else {
        return StageOutcome::Failure(
            FailureKind::EngineUnavailable,
            format!("no image configured for engine '{}'", job.engine),
        );
    };

    let build = BuildContext {
        image: image.to_string(),
        graph_dir: paths.graph_dir.clone(),
        runtime: ctx.runtime.clone(),
    };
    match ctx.engines.resolve(&job.engine, build) {
        Ok(backend) => StageOutcome::Success(backend),
        Err(e) => StageOutcome::Failure(FailureKind::UnknownEngine, e.to_string()),
    }
}

/// Run the build; the execution handle is recorded whatever the result
async fn build_stage(
    session: &mut Session,
    job_id: i64,
    backend: &mut dyn GraphBuilder,
    extract: &Path,
) -> Result<StageOutcome<PathBuf>> {
    let built = backend.build_graph(extract).await;
    session.set_execution_handle(job_id, backend.execution_handle())?;

    let result = match built {
        Ok(result) => result,
        Err(e @ Error::EngineUnavailable { .. }) => {
            return Ok(StageOutcome::Failure(FailureKind::EngineUnavailable, e.to_string()))
        }
        Err(e) => return Err(e),
    };

    if !result.success() {
        return Ok(StageOutcome::Failure(
            FailureKind::BuildFailed,
            format!(
                "{} exited with {}: {}",
                backend.name(),
                result.exit_code,
                tail(&result.output, OUTPUT_TAIL)
            ),
        ));
    }

    Ok(StageOutcome::Success(result.output_dir))
}

/// Archive the job's files and write the sidecar, under the directory lock
async fn package_stage(
    ctx: &WorkerContext,
    job: &Job,
    paths: &JobPaths,
    backend: &dyn GraphBuilder,
    output_dir: &Path,
) -> Result<StageOutcome<PathBuf>> {
    let _lock = DirLock::acquire(&paths.package_dir, ctx.config.lock_timeout()).await?;

    let files = backend.package_files(&job.bbox)?;
    if files.is_empty() {
        return Ok(StageOutcome::Failure(
            FailureKind::NothingToPackage,
            format!("no graph files intersect {}", job.bbox),
        ));
    }

    let sidecar = PackageSidecar {
        job_id: job.id,
        filepath: paths
            .archive
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        name: job.name.clone(),
        description: job.description.clone(),
        extent: job.bbox.to_string(),
        last_modified: Utc::now(),
    };

    // Archiving is blocking I/O; keep it off the runtime threads
    let count = files.len();
    let (base, archive, sidecar_path, kind) = (
        output_dir.to_path_buf(),
        paths.archive.clone(),
        paths.sidecar.clone(),
        job.compression,
    );
    tokio::task::spawn_blocking(move || {
        pack_files(&files, &base, &archive, kind)?;
        write_sidecar(&sidecar_path, &sidecar)
    })
    .await
    .map_err(|e| Error::Task(format!("packaging task failed: {e}")))??;

    info!("job {}: packaged {count} files into {}", job.id, paths.archive.display());
    Ok(StageOutcome::Success(paths.archive.clone()))
}

fn tail(text: &str, max: usize) -> &str {
    let text = text.trim_end();
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Terminal bookkeeping for one run
struct Finish<'a> {
    ctx: &'a WorkerContext,
    job: &'a Job,
    paths: &'a JobPaths,
    recipient: &'a str,
}

impl Finish<'_> {
    fn notify(&self, outcome: Outcome, job: &Job, detail: Option<&str>) {
        let from = &self.ctx.config.notifications.from;
        let notification = Notification::new(outcome, job, from, self.recipient, detail);
        deliver(self.ctx.notifier.as_ref(), &notification);
    }

    fn remove_partial_output(&self) {
        for dir in [&self.paths.package_dir, &self.paths.work_dir] {
            if let Err(e) = remove_dir_if_exists(dir) {
                warn!("job {}: failed to remove {}: {e}", self.job.id, dir.display());
            }
        }
    }

    async fn completed(
        &self,
        session: &mut Session,
        backend: Option<Box<dyn GraphBuilder>>,
        archive: PathBuf,
    ) -> Result<JobOutcome> {
        let id = self.job.id;
        if let Err(e) = session.stamp_finished(id, Utc::now()) {
            warn!("job {id}: failed to record finish time: {e}");
        }

        if let Some(mut backend) = backend {
            if let Err(e) = backend.cleanup().await {
                warn!("job {id}: backend cleanup failed: {e}");
            }
        }
        if let Err(e) = remove_dir_if_exists(&self.paths.work_dir) {
            warn!("job {id}: failed to remove {}: {e}", self.paths.work_dir.display());
        }

        info!("job {id}: completed, {}", archive.display());
        let job = session.find_job(id)?.unwrap_or_else(|| self.job.clone());
        self.notify(Outcome::Succeeded, &job, None);
        Ok(JobOutcome::Completed(archive))
    }

    /// Record the failure; the container is kept for inspection
    ///
    /// Output is only discarded once the job is recorded as failed. A job
    /// that cannot move to `Failed`, for instance because another delivery
    /// completed it, keeps its files and gets no notification.
    fn failed(&self, session: &mut Session, kind: FailureKind, detail: String) -> Result<JobOutcome> {
        let id = self.job.id;
        error!("job {id}: {kind}: {detail}");

        if let Err(e) = session.set_status(id, JobStatus::Failed) {
            warn!("job {id}: could not record failure, leaving its output alone: {e}");
            return Err(Error::Pipeline { kind, detail });
        }

        let message = format!("{kind}: {detail}");
        let recorded = session
            .set_last_error(id, Some(&message))
            .and_then(|_| session.stamp_finished(id, Utc::now()));
        if let Err(e) = recorded {
            warn!("job {id}: failed to record failure details: {e}");
        }

        self.remove_partial_output();
        self.notify(Outcome::Failed, self.job, Some(&message));
        Err(Error::Pipeline { kind, detail })
    }

    /// The record vanished mid-run: clean up, tell the owner, touch nothing else
    async fn deleted(&self, backend: Option<Box<dyn GraphBuilder>>) -> Result<JobOutcome> {
        let id = self.job.id;
        warn!("job {id}: deleted while running, discarding partial output");

        if let Some(mut backend) = backend {
            if let Err(e) = backend.cleanup().await {
                warn!("job {id}: backend cleanup failed: {e}");
            }
        }
        self.remove_partial_output();
        self.notify(Outcome::Deleted, self.job, None);
        Ok(JobOutcome::Deleted)
    }
}
