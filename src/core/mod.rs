//! Core library modules for routing-packager
//!
//! Leaves first: geometry and source selection, then the extraction, engine
//! and packaging stages, and finally the orchestrator and its workers.

pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod geometry;
pub mod job;
pub mod notify;
pub mod orchestrator;
pub mod package;
pub mod service;
pub mod source;
pub mod store;
pub mod tiles;
pub mod worker;

pub use config::Config;
pub use engine::{EngineRegistry, GraphBuilder};
pub use job::{Job, JobStatus};
pub use orchestrator::{run_job, JobOutcome, StageOutcome};
pub use store::{Session, Store};
pub use worker::WorkerContext;
