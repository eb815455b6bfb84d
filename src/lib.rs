//! # routing-packager
//!
//! Turns a bounding box, a data provider and a routing engine into a
//! downloadable routing graph package.
//!
//! A submitted job is cut from the smallest provider extract containing its
//! box, built into a graph by the engine's container, and archived together
//! with a JSON sidecar. Jobs move through `Queued → Extracting → Tiling →
//! Completed`, or end in `Failed`.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use routing_packager::{run_workers, Config, WorkerContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = Arc::new(WorkerContext::from_config(Config::load(None)?)?);
//!     let (_stop, shutdown) = tokio::sync::watch::channel(false);
//!     run_workers(ctx, shutdown).await?;
//!     Ok(())
//! }
//! ```

pub mod core;

pub use crate::core::config::Config;
pub use crate::core::engine::{
    BuildContext, BuildResult, ContainerRuntime, DockerCli, EngineRegistry, GraphBuilder, Mount,
};
pub use crate::core::error::{Error, FailureKind, Result};
pub use crate::core::geometry::BoundingBox;
pub use crate::core::job::{Job, JobStatus, NewJob};
pub use crate::core::orchestrator::{run_job, JobOutcome, StageOutcome};
pub use crate::core::package::Compression;
pub use crate::core::service::{delete_job, queue_updates, submit_job, JobRequest};
pub use crate::core::store::{Session, Store};
pub use crate::core::worker::{run_once, run_workers, Delivery, WorkerContext};
