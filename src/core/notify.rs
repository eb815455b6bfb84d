//! Job outcome notifications

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::core::job::Job;

/// Terminal outcome a notification reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Failed,
    Deleted,
}

/// One message to the job's owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub job_id: i64,
    pub outcome: Outcome,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn new(outcome: Outcome, job: &Job, from: &str, to: &str, detail: Option<&str>) -> Self {
        let subject = match outcome {
            Outcome::Succeeded => format!("INFO: {to}'s job {} succeeded", job.id),
            Outcome::Failed => format!("ERROR: {to}'s job {} failed", job.id),
            Outcome::Deleted => format!("WARNING: {to}'s job {} was stopped and deleted", job.id),
        };

        let mut body = format!(
            "Job: {}\nName: {}\nEngine: {}\nProvider: {}\nBounding box: {}\n",
            job.id, job.name, job.engine, job.provider, job.bbox
        );
        if let Some(path) = &job.result_path {
            body.push_str(&format!("Package: {}\n", path.display()));
        }
        if let Some(detail) = detail {
            body.push_str(&format!("\n{detail}\n"));
        }

        Self {
            job_id: job.id,
            outcome,
            from: from.to_string(),
            to: to.to_string(),
            subject,
            body,
        }
    }
}

/// Delivers notifications; delivery failures never fail a job
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) -> Result<()> {
        info!("Notify {}: {}", notification.to, notification.subject);
        Ok(())
    }
}

/// Drops one JSON file per notification into a spool directory, where a
/// mail relay picks them up
#[derive(Debug, Clone)]
pub struct SpoolNotifier {
    dir: PathBuf,
}

impl SpoolNotifier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Notifier for SpoolNotifier {
    fn notify(&self, notification: &Notification) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.9f");
        let name = format!(
            "{stamp}-job{}-{:?}.json",
            notification.job_id, notification.outcome
        )
        .to_lowercase();

        // Relays skip dotfiles, so they never read a half-written message
        let temp = self.dir.join(format!(".{name}"));
        fs::write(&temp, serde_json::to_vec_pretty(notification)?)?;
        fs::rename(&temp, self.dir.join(name))?;
        Ok(())
    }
}

/// Send and log, swallowing delivery errors
pub fn deliver(notifier: &dyn Notifier, notification: &Notification) {
    if let Err(e) = notifier.notify(notification) {
        warn!(
            "job {}: failed to deliver notification '{}': {e}",
            notification.job_id, notification.subject
        );
    }
}
