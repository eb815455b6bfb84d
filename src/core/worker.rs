//! Worker pool pulling jobs from the queue
//!
//! All process-wide collaborators live in an explicit [`WorkerContext`]
//! built once at startup and shared by the worker tasks.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::core::config::Config;
use crate::core::engine::{ContainerRuntime, DockerCli, EngineRegistry};
use crate::core::error::{Error, Result};
use crate::core::extract::Osmium;
use crate::core::notify::{LogNotifier, Notifier, SpoolNotifier};
use crate::core::orchestrator::{run_job, JobOutcome};
use crate::core::source::{HeaderReader, PbfHeaderReader};
use crate::core::store::{Session, Store};

/// Collaborators shared by every worker
pub struct WorkerContext {
    pub config: Config,
    pub store: Store,
    pub engines: EngineRegistry,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub headers: Arc<dyn HeaderReader>,
    pub osmium: Osmium,
    pub notifier: Arc<dyn Notifier>,
}

impl WorkerContext {
    /// Production wiring: Docker, osmium and PBF headers from `config`
    pub fn from_config(config: Config) -> Result<WorkerContext> {
        let store = Store::open(config.database_path())?;
        let notifier: Arc<dyn Notifier> = match &config.notifications.spool_dir {
            Some(dir) => Arc::new(SpoolNotifier::new(dir)),
            None => Arc::new(LogNotifier),
        };

        Ok(WorkerContext {
            store,
            engines: EngineRegistry::standard(),
            runtime: Arc::new(DockerCli::new(&config.docker)),
            headers: Arc::new(PbfHeaderReader),
            osmium: Osmium::new(&config.osmium),
            notifier,
            config,
        })
    }
}

/// What happened to one dequeued item
#[derive(Debug)]
pub struct Delivery {
    pub job_id: i64,
    pub redelivered: bool,
    pub outcome: Result<JobOutcome>,
}

/// Shortest interval between lease renewals
const MIN_RENEWAL: Duration = Duration::from_millis(100);

/// Take one item off the queue and run it
///
/// The item's lease is renewed while the job runs, so a long build is not
/// handed to a second worker. The item is acknowledged when the job reached
/// a recorded end, including a recorded failure. Any other error leaves it
/// claimed, so it is handed out again once the lease expires. Returns `None`
/// when the queue is empty.
pub async fn run_once(ctx: &WorkerContext, queue: &mut Session, worker: &str) -> Result<Option<Delivery>> {
    let lease = ctx.config.lease_ttl();
    let Some(item) = queue.dequeue(worker, lease)? else {
        return Ok(None);
    };

    if item.redelivered {
        warn!("job {}: redelivered to {worker}", item.job_id);
    }
    info!("job {}: picked up by {worker}", item.job_id);

    let job = run_job(ctx, item.job_id);
    tokio::pin!(job);

    let mut renewal = tokio::time::interval((lease / 3).max(MIN_RENEWAL));
    renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
    renewal.tick().await;

    let outcome = loop {
        tokio::select! {
            outcome = &mut job => break outcome,
            _ = renewal.tick() => match queue.renew(&item.correlation_id, worker) {
                Ok(true) => {}
                Ok(false) => warn!("job {}: lease of {} lost", item.job_id, item.correlation_id),
                Err(e) => warn!("job {}: lease renewal failed: {e}", item.job_id),
            },
        }
    };

    match &outcome {
        Ok(_) | Err(Error::Pipeline { .. }) => queue.ack(&item.correlation_id)?,
        Err(e) => error!("job {}: left on the queue after error: {e}", item.job_id),
    }

    Ok(Some(Delivery {
        job_id: item.job_id,
        redelivered: item.redelivered,
        outcome,
    }))
}

/// Poll the queue until `halt` turns true; queue errors end the worker
async fn worker_loop(ctx: Arc<WorkerContext>, name: String, mut halt: watch::Receiver<bool>) -> Result<()> {
    let mut queue = ctx.store.session()?;
    info!("{name} started");

    while !*halt.borrow() {
        let idle = match run_once(&ctx, &mut queue, &name).await {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                error!("{name}: queue error: {e}");
                return Err(e);
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(ctx.config.poll_interval()) => {}
                _ = halt.changed() => {}
            }
        }
    }

    info!("{name} stopped");
    Ok(())
}

/// Run `config.workers` workers until `shutdown` turns true
///
/// Workers finish the job at hand before exiting. The first worker failure
/// stops the others and is returned once they are done. Dropping the
/// shutdown sender counts as a shutdown request.
pub async fn run_workers(ctx: Arc<WorkerContext>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let (halt, halted) = watch::channel(*shutdown.borrow());

    let mut workers = JoinSet::new();
    for n in 0..ctx.config.workers {
        workers.spawn(worker_loop(
            Arc::clone(&ctx),
            format!("worker-{n}"),
            halted.clone(),
        ));
    }

    let mut first_failure = None;
    loop {
        tokio::select! {
            joined = workers.join_next() => {
                let Some(joined) = joined else { break };
                let failure = match joined {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e,
                    Err(e) => Error::Task(format!("worker task panicked: {e}")),
                };
                error!("Worker failed, stopping the pool: {failure}");
                let _ = halt.send(true);
                first_failure.get_or_insert(failure);
            }
            changed = shutdown.changed(), if !*halt.borrow() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = halt.send(true);
                }
            }
        }
    }

    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
