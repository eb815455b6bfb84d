//! Job records, their state machine and on-disk layout

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};
use crate::core::geometry::BoundingBox;
use crate::core::package::Compression;

/// Characters a job name may not contain
const FORBIDDEN_NAME_CHARS: [char; 4] = ['*', '&', '%', '/'];

/// Pipeline state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Extracting,
    Tiling,
    Completed,
    Failed,
    /// Never stored: deleting a job removes its record and queue entry.
    /// The variant only names the end state in transition checks.
    Deleted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Extracting => "Extracting",
            JobStatus::Tiling => "Tiling",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Deleted => "Deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Deleted
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    ///
    /// Besides the forward path, a redelivered job may restart extraction
    /// and the update sweep may requeue a completed job.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        match (self, next) {
            (Queued, Extracting) | (Extracting, Tiling) | (Tiling, Completed) => true,
            (Extracting | Tiling, Extracting) => true,
            (Completed, Queued) => true,
            (Deleted, _) => false,
            (Queued | Extracting | Tiling, Failed | Deleted) => true,
            (Completed | Failed, Deleted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Queued" => JobStatus::Queued,
            "Extracting" => JobStatus::Extracting,
            "Tiling" => JobStatus::Tiling,
            "Completed" => JobStatus::Completed,
            "Failed" => JobStatus::Failed,
            "Deleted" => JobStatus::Deleted,
            other => return Err(Error::InvalidInput(format!("unknown job status '{other}'"))),
        })
    }
}

/// Immutable inputs of a job, validated before the record is created
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub description: String,
    pub provider: String,
    pub bbox: BoundingBox,
    pub engine: String,
    pub compression: Compression,
    pub user_id: i64,
    pub update: bool,
}

/// A job record as stored
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub provider: String,
    pub bbox: BoundingBox,
    pub engine: String,
    pub compression: Compression,
    pub user_id: i64,
    pub update: bool,
    pub status: JobStatus,
    pub execution_handle: Option<String>,
    pub correlation_id: Option<String>,
    pub result_path: Option<PathBuf>,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    /// `<engine>_<provider>_<name>`, unique per job
    pub fn package_stem(&self) -> String {
        format!("{}_{}_{}", self.engine, self.provider, self.name)
    }

    pub fn paths(&self, data_dir: &Path) -> JobPaths {
        JobPaths::new(data_dir, self)
    }
}

/// Reject empty names and names that would break the package layout
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidInput("job name must not be empty".to_string()));
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_NAME_CHARS.contains(c)) {
        return Err(Error::InvalidInput(format!(
            "job name '{name}' contains forbidden character '{c}'"
        )));
    }
    Ok(())
}

/// Filesystem locations belonging to one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    /// `<data_dir>/<provider>`
    pub source_dir: PathBuf,
    /// `<data_dir>/temp/<engine>/<id>`
    pub work_dir: PathBuf,
    pub extract: PathBuf,
    pub graph_dir: PathBuf,
    /// `<data_dir>/<engine>/<stem>`
    pub package_dir: PathBuf,
    pub archive: PathBuf,
    pub sidecar: PathBuf,
}

impl JobPaths {
    pub fn new(data_dir: &Path, job: &Job) -> Self {
        let stem = job.package_stem();
        let work_dir = data_dir
            .join("temp")
            .join(&job.engine)
            .join(job.id.to_string());
        let package_dir = data_dir.join(&job.engine).join(&stem);

        Self {
            source_dir: data_dir.join(&job.provider),
            extract: work_dir.join("extract.osm.pbf"),
            graph_dir: work_dir.join("graph"),
            work_dir,
            archive: package_dir.join(format!("{stem}.{}", job.compression.extension())),
            sidecar: package_dir.join(format!("{stem}.json")),
            package_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    const ALL: [JobStatus; 6] = [Queued, Extracting, Tiling, Completed, Failed, Deleted];

    fn sample_job() -> Job {
        Job {
            id: 42,
            name: "andorra".to_string(),
            description: String::new(),
            provider: "osm".to_string(),
            bbox: BoundingBox::new(1.53, 42.56, 1.63, 42.58),
            engine: "valhalla".to_string(),
            compression: Compression::TarGz,
            user_id: 1,
            update: false,
            status: Queued,
            execution_handle: None,
            correlation_id: None,
            result_path: None,
            last_started: None,
            last_finished: None,
            last_error: None,
        }
    }

    #[test]
    fn test_forward_path() {
        assert!(Queued.can_transition_to(Extracting));
        assert!(Extracting.can_transition_to(Tiling));
        assert!(Tiling.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Tiling));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Extracting.can_transition_to(Completed));
    }

    #[test]
    fn test_terminal_states() {
        for from in [Queued, Extracting, Tiling] {
            assert!(from.can_transition_to(Failed), "{from} -> Failed");
            assert!(from.can_transition_to(Deleted), "{from} -> Deleted");
        }
        for to in ALL {
            assert!(!Deleted.can_transition_to(to), "Deleted -> {to}");
            assert!(!Failed.can_transition_to(to) || to == Deleted, "Failed -> {to}");
        }
        // Only the update sweep leaves Completed
        assert!(Completed.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Extracting));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn test_redelivery_restarts_extraction() {
        assert!(Extracting.can_transition_to(Extracting));
        assert!(Tiling.can_transition_to(Extracting));
        assert!(!Queued.can_transition_to(Queued));
    }

    #[test]
    fn test_status_strings() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("Running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("andorra-2024_v1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("  ").is_err());
        for bad in ["a*b", "a&b", "50%", "a/b"] {
            assert!(validate_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_paths() {
        let job = sample_job();
        let paths = job.paths(Path::new("/data"));
        assert_eq!(paths.source_dir, Path::new("/data/osm"));
        assert_eq!(paths.work_dir, Path::new("/data/temp/valhalla/42"));
        assert_eq!(paths.extract, Path::new("/data/temp/valhalla/42/extract.osm.pbf"));
        assert_eq!(paths.graph_dir, Path::new("/data/temp/valhalla/42/graph"));
        assert_eq!(
            paths.archive,
            Path::new("/data/valhalla/valhalla_osm_andorra/valhalla_osm_andorra.tar.gz")
        );
        assert_eq!(
            paths.sidecar,
            Path::new("/data/valhalla/valhalla_osm_andorra/valhalla_osm_andorra.json")
        );
    }
}
