//! Error types for routing-packager
//!
//! Provides the error taxonomy shared by validation, the packaging pipeline
//! and the job store, plus fuzzy suggestions for misspelled engine and
//! provider names.

use std::fmt;

use strsim::{jaro_winkler, normalized_levenshtein};

/// Minimum combined similarity for a suggestion to be offered
const MIN_SUGGESTION_SCORE: f64 = 0.7;

/// Suggest the closest known name for a potentially misspelled one
///
/// Scores candidates with 70% Jaro-Winkler and 30% normalized Levenshtein.
pub fn suggest_correction(input: &str, candidates: &[String]) -> Option<String> {
    let input_lower = input.to_lowercase();

    if candidates
        .iter()
        .any(|c| c.eq_ignore_ascii_case(&input_lower))
    {
        return None;
    }

    let mut best_match = None;
    let mut best_score = 0.0f64;

    for candidate in candidates {
        let candidate_lower = candidate.to_lowercase();
        let score = jaro_winkler(&input_lower, &candidate_lower) * 0.7
            + normalized_levenshtein(&input_lower, &candidate_lower) * 0.3;

        if score >= MIN_SUGGESTION_SCORE && score > best_score {
            best_score = score;
            best_match = Some(candidate.clone());
        }
    }

    best_match
}

/// Classification of a fatal, non-retryable pipeline failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No source extract contains the job's bounding box
    NoSourceData,
    /// The cropping tool exited with a nonzero status
    ExtractFailed,
    /// The cropped extract declares an empty bounding box
    EmptyExtract,
    /// The job names an engine without a registered backend
    UnknownEngine,
    /// The engine's image or binary is not installed
    EngineUnavailable,
    /// The engine's build command exited with a nonzero status
    BuildFailed,
    /// The build produced nothing to package for the job's bounding box
    NothingToPackage,
    /// Anything unexpected while the job record still existed
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureKind::NoSourceData => "no source data",
            FailureKind::ExtractFailed => "extraction failed",
            FailureKind::EmptyExtract => "empty extract",
            FailureKind::UnknownEngine => "unknown engine",
            FailureKind::EngineUnavailable => "engine unavailable",
            FailureKind::BuildFailed => "graph build failed",
            FailureKind::NothingToPackage => "nothing to package",
            FailureKind::Internal => "internal error",
        };
        f.write_str(text)
    }
}

/// Main error type for routing-packager operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Text that does not parse as `minx,miny,maxx,maxy`
    #[error("Invalid bbox format: {0}")]
    InvalidFormat(String),

    /// A bounding box that parses but is not a valid geographic rectangle
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Invalid configuration or request parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Engine name without a registered or enabled backend
    #[error("Engine '{name}' is not supported{}", suggestion_suffix(.suggestion))]
    UnknownEngine {
        name: String,
        suggestion: Option<String>,
    },

    /// Provider name that is not enabled
    #[error("Provider '{name}' is not enabled{}", suggestion_suffix(.suggestion))]
    UnknownProvider {
        name: String,
        suggestion: Option<String>,
    },

    /// A job with the same engine, provider and name already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No source extract fully contains the requested bounding box
    #[error("No source extract in {dir} contains bbox {bbox}")]
    NoMatch { dir: String, bbox: String },

    /// The engine's container image is not available locally
    #[error("Image '{image}' for engine '{engine}' is not available")]
    EngineUnavailable { engine: String, image: String },

    /// A recorded, fatal pipeline failure
    #[error("{kind}: {detail}")]
    Pipeline { kind: FailureKind, detail: String },

    /// Job record is absent from the store
    #[error("Job {0} not found")]
    JobNotFound(i64),

    /// User record is absent from the store
    #[error("User {0} not found")]
    UserNotFound(i64),

    /// Status change not permitted by the job state machine
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Container runtime command failure
    #[error("Container runtime error: {0}")]
    Runtime(String),

    /// PBF decoding failure
    #[error("PBF error: {0}")]
    Pbf(String),

    /// Configuration file failure
    #[error("Configuration error: {0}")]
    Config(String),

    /// A background task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(String),

    /// Advisory lock could not be acquired in time
    #[error("Timed out waiting for lock {0}")]
    LockTimeout(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Job store error
    #[error("Store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Sidecar or notification serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Zip archive error
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(". Did you mean '{s}'?"),
        None => String::new(),
    }
}

impl From<osmpbf::Error> for Error {
    fn from(err: osmpbf::Error) -> Self {
        Error::Pbf(err.to_string())
    }
}

impl Error {
    /// Whether the error rejects a request before it is queued
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidFormat(_)
                | Error::InvalidGeometry(_)
                | Error::InvalidInput(_)
                | Error::UnknownEngine { .. }
                | Error::UnknownProvider { .. }
                | Error::Conflict(_)
        )
    }
}

/// Convenience result type for routing-packager operations
pub type Result<T> = std::result::Result<T, Error>;
