//! # routing-packager CLI
//!
//! Runs the worker pool and administers jobs and users.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::error;

use routing_packager::Config;

mod cli;

/// Command-line interface for routing-packager
#[derive(Parser)]
#[command(name = "routing-packager")]
#[command(about = "Builds routing graph packages from OpenStreetMap extracts")]
#[command(version = env!("PACKAGER_VERSION"))]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process queued jobs until interrupted
    Worker {
        /// Number of concurrent workers, 0 for one per CPU; overrides the configuration
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Validate and queue a new job
    Submit {
        /// Unique job name
        #[arg(long)]
        name: String,
        /// Bounding box as minx,miny,maxx,maxy
        #[arg(long, allow_hyphen_values = true)]
        bbox: String,
        #[arg(long, default_value = "osm")]
        provider: String,
        #[arg(long, default_value = "valhalla")]
        engine: String,
        /// zip or tar.gz
        #[arg(long, default_value = "zip")]
        compression: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Include the job in the update sweep
        #[arg(long)]
        update: bool,
        /// Id of the requesting user
        #[arg(long)]
        user: i64,
    },
    /// Delete a job and its package
    Delete {
        id: i64,
    },
    /// Show one job, or all jobs
    Status {
        id: Option<i64>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Requeue completed jobs flagged for updates
    Update,
    /// Register a user to receive notifications
    AddUser {
        email: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging to stderr
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Stderr)
        .init();

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Worker { workers } => {
            match workers {
                Some(0) => config.workers = num_cpus::get(),
                Some(n) => config.workers = n,
                None => {}
            }
            cli::run_worker(config).await
        }
        Commands::Submit {
            name,
            bbox,
            provider,
            engine,
            compression,
            description,
            update,
            user,
        } => cli::submit(
            &config,
            routing_packager::JobRequest {
                name,
                description,
                provider,
                bbox,
                engine,
                compression,
                update,
                user_id: user,
            },
        ),
        Commands::Delete { id } => cli::delete(&config, id),
        Commands::Status { id, json } => cli::status(&config, id, json),
        Commands::Update => cli::update(&config),
        Commands::AddUser { email } => cli::add_user(&config, &email),
    }
}
