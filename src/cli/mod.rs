//! Command handlers for the routing-packager binary
//!
//! Kept apart from the library so the core never prints to stdout.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::info;
use tokio::sync::watch;

use routing_packager::core::service;
use routing_packager::{run_workers, Config, EngineRegistry, Job, JobRequest, Store, WorkerContext};

fn open_store(config: &Config) -> Result<Store> {
    let path = config.database_path();
    Store::open(&path).with_context(|| format!("cannot open job store {}", path.display()))
}

/// Run the worker pool until Ctrl-C
pub async fn run_worker(config: Config) -> Result<()> {
    let ctx = Arc::new(WorkerContext::from_config(config)?);
    info!(
        "routing-packager v{} with {} workers, data in {}",
        env!("PACKAGER_VERSION"),
        ctx.config.workers,
        ctx.config.data_dir.display()
    );

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down after the current jobs");
            let _ = stop.send(true);
        }
    });

    run_workers(ctx, shutdown).await?;
    Ok(())
}

pub fn submit(config: &Config, request: JobRequest) -> Result<()> {
    let mut session = open_store(config)?.session()?;
    let job = service::submit_job(config, &EngineRegistry::standard(), &mut session, &request)
        .map_err(|e| {
            if e.is_validation() {
                anyhow!("request rejected: {e}")
            } else {
                e.into()
            }
        })?;
    println!("{}", job.id);
    Ok(())
}

pub fn delete(config: &Config, id: i64) -> Result<()> {
    let mut session = open_store(config)?.session()?;
    let job = service::delete_job(config, &mut session, id)?;
    println!("Deleted job {} ({})", job.id, job.package_stem());
    Ok(())
}

pub fn status(config: &Config, id: Option<i64>, json: bool) -> Result<()> {
    let session = open_store(config)?.session()?;
    let jobs = match id {
        Some(id) => vec![session.get_job(id)?],
        None => session.list_jobs()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
    } else {
        for job in &jobs {
            println!("{}", describe(job));
        }
    }
    Ok(())
}

pub fn update(config: &Config) -> Result<()> {
    let mut session = open_store(config)?.session()?;
    let queued = service::queue_updates(&mut session)?;
    println!("Queued {} jobs for update", queued.len());
    Ok(())
}

pub fn add_user(config: &Config, email: &str) -> Result<()> {
    let session = open_store(config)?.session()?;
    let id = session.create_user(email)?;
    println!("{id}");
    Ok(())
}

/// One status line per job
fn describe(job: &Job) -> String {
    let mut line = format!(
        "{:>5}  {:<10}  {}  [{}]",
        job.id,
        job.status,
        job.package_stem(),
        job.bbox
    );
    if let Some(path) = &job.result_path {
        line.push_str(&format!("  {}", path.display()));
    }
    if let Some(err) = &job.last_error {
        line.push_str(&format!("  error: {err}"));
    }
    line
}
