//! Cropping source extracts with osmium
//!
//! The cut keeps complete ways crossing the bbox boundary and writes the
//! requested bbox into the output header, which is how an empty result is
//! told apart from a successful one afterwards.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use log::debug;
use tokio::process::{Child, Command};

use crate::core::error::{Error, Result};
use crate::core::geometry::BoundingBox;
use crate::core::source::HeaderReader;

/// Result of checking a finished extraction
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractCheck {
    /// The output declares these non-empty bounds
    Valid(BoundingBox),
    /// The output declares no or all-zero bounds: the bbox missed the source
    Empty,
}

/// Wrapper around the `osmium` command line tool
#[derive(Debug, Clone)]
pub struct Osmium {
    binary: PathBuf,
}

impl Default for Osmium {
    fn default() -> Self {
        Self::new("osmium")
    }
}

impl Osmium {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Arguments of the extract invocation, without the binary
    pub fn extract_args(source: &Path, target: &BoundingBox, dest: &Path) -> Vec<String> {
        vec![
            "extract".to_string(),
            "--set-bounds".to_string(),
            "--strategy=complete_ways".to_string(),
            format!("--bbox={target}"),
            "-o".to_string(),
            dest.display().to_string(),
            "-O".to_string(),
            source.display().to_string(),
        ]
    }

    /// Spawn the cut of `source` to `target`, writing `dest`
    ///
    /// The caller owns the returned process and must wait for it.
    pub fn extract(&self, source: &Path, target: &BoundingBox, dest: &Path) -> Result<Child> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let args = Self::extract_args(source, target, dest);
        debug!("Running {} {}", self.binary.display(), args.join(" "));

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::IoError(std::io::Error::new(
                    e.kind(),
                    format!("failed to start {}: {e}", self.binary.display()),
                ))
            })?;

        Ok(child)
    }
}

/// Turn a finished extraction process into an error carrying stderr
pub fn ensure_success(output: &Output) -> std::result::Result<(), String> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let status = output
        .status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    Err(format!("'osmium' exited with {status}: {stderr}"))
}

/// Re-open a finished extract and classify its declared bounds
pub fn check_extract(path: &Path, headers: &dyn HeaderReader) -> Result<ExtractCheck> {
    Ok(match headers.read_bounds(path)? {
        Some(bounds) if !bounds.is_null() => ExtractCheck::Valid(bounds),
        _ => ExtractCheck::Empty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedHeaders(HashMap<PathBuf, Option<BoundingBox>>);

    impl HeaderReader for FixedHeaders {
        fn read_bounds(&self, path: &Path) -> Result<Option<BoundingBox>> {
            Ok(self.0.get(path).copied().flatten())
        }
    }

    #[test]
    fn test_extract_args() {
        let args = Osmium::extract_args(
            Path::new("/data/osm/andorra.pbf"),
            &BoundingBox::new(1.53, 42.56, 1.63, 42.58),
            Path::new("/tmp/cut.pbf"),
        );
        assert_eq!(
            args,
            vec![
                "extract",
                "--set-bounds",
                "--strategy=complete_ways",
                "--bbox=1.53,42.56,1.63,42.58",
                "-o",
                "/tmp/cut.pbf",
                "-O",
                "/data/osm/andorra.pbf",
            ]
        );
    }

    #[test]
    fn test_check_extract() {
        let headers = FixedHeaders(HashMap::from([
            (
                PathBuf::from("good.pbf"),
                Some(BoundingBox::new(1.0, 2.0, 3.0, 4.0)),
            ),
            (
                PathBuf::from("zero.pbf"),
                Some(BoundingBox::new(0.0, 0.0, 0.0, 0.0)),
            ),
            (PathBuf::from("none.pbf"), None),
        ]));

        assert_eq!(
            check_extract(Path::new("good.pbf"), &headers).unwrap(),
            ExtractCheck::Valid(BoundingBox::new(1.0, 2.0, 3.0, 4.0))
        );
        assert_eq!(
            check_extract(Path::new("zero.pbf"), &headers).unwrap(),
            ExtractCheck::Empty
        );
        assert_eq!(
            check_extract(Path::new("none.pbf"), &headers).unwrap(),
            ExtractCheck::Empty
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_failure_carries_stderr() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("osmium");
        std::fs::write(&script, "#!/bin/sh\necho 'Open failed' >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let osmium = Osmium::new(&script);
        let dest = dir.path().join("out").join("cut.pbf");
        let child = osmium
            .extract(
                Path::new("missing.pbf"),
                &BoundingBox::new(0.0, 0.0, 1.0, 1.0),
                &dest,
            )
            .unwrap();
        let output = child.wait_with_output().await.unwrap();

        let err = ensure_success(&output).unwrap_err();
        assert!(err.contains("exited with 1"), "{err}");
        assert!(err.contains("Open failed"), "{err}");
        assert!(dest.parent().unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_extract_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let osmium = Osmium::new(dir.path().join("no-such-osmium"));
        let result = osmium.extract(
            Path::new("in.pbf"),
            &BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            &dir.path().join("out.pbf"),
        );
        assert!(matches!(result, Err(Error::IoError(_))));
    }
}
