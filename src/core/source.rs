//! Source extract selection
//!
//! `osmium extract` is expensive on large inputs, so a job is cut from the
//! smallest provider extract that still covers its whole bounding box.

use std::path::{Path, PathBuf};

use log::{debug, warn};
use osmpbf::{BlobDecode, BlobReader};

use crate::core::error::{Error, Result};
use crate::core::geometry::{equal_area, BoundingBox};

/// File extension of provider extracts
const PBF_EXTENSION: &str = "pbf";

/// Reads the bounding box a PBF file declares in its header
pub trait HeaderReader: Send + Sync {
    /// `Ok(None)` when the header carries no bounding box
    fn read_bounds(&self, path: &Path) -> Result<Option<BoundingBox>>;
}

/// Header reader decoding the `OSMHeader` blob with `osmpbf`
#[derive(Debug, Default, Clone, Copy)]
pub struct PbfHeaderReader;

impl HeaderReader for PbfHeaderReader {
    fn read_bounds(&self, path: &Path) -> Result<Option<BoundingBox>> {
        let reader = BlobReader::from_path(path)?;

        for blob in reader {
            if let BlobDecode::OsmHeader(header) = blob?.decode()? {
                return Ok(header
                    .bbox()
                    .map(|b| BoundingBox::new(b.left, b.bottom, b.right, b.top)));
            }
        }

        Ok(None)
    }
}

/// A candidate extract and its equal-area size
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub path: PathBuf,
    pub bounds: BoundingBox,
    pub area: f64,
}

/// Candidates containing `target`, smallest first
pub fn rank_candidates<I>(candidates: I, target: &BoundingBox) -> Vec<Candidate>
where
    I: IntoIterator<Item = (PathBuf, BoundingBox)>,
{
    let mut ranked: Vec<Candidate> = candidates
        .into_iter()
        .filter(|(_, bounds)| bounds.contains(target))
        .map(|(path, bounds)| Candidate {
            area: equal_area(&bounds),
            path,
            bounds,
        })
        .collect();

    ranked.sort_by(|a, b| a.area.total_cmp(&b.area).then_with(|| a.path.cmp(&b.path)));
    ranked
}

/// List the extracts of a provider directory together with their header boxes
///
/// Files whose header has no usable bounding box are skipped.
pub fn scan_extracts(dir: &Path, headers: &dyn HeaderReader) -> Result<Vec<(PathBuf, BoundingBox)>> {
    let mut extracts = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(PBF_EXTENSION) {
            continue;
        }

        match headers.read_bounds(&path) {
            Ok(Some(bounds)) if !bounds.is_null() => extracts.push((path, bounds)),
            Ok(_) => warn!("Skipping {}: header has no bounding box", path.display()),
            Err(e) => warn!("Skipping {}: {e}", path.display()),
        }
    }

    Ok(extracts)
}

/// Find the smallest extract in `dir` that fully contains `target`
pub fn select_best_source(
    dir: &Path,
    target: &BoundingBox,
    headers: &dyn HeaderReader,
) -> Result<PathBuf> {
    let extracts = scan_extracts(dir, headers)?;
    debug!("{} candidate extracts in {}", extracts.len(), dir.display());

    rank_candidates(extracts, target)
        .into_iter()
        .next()
        .map(|c| {
            debug!("Selected {} ({:.0} m²)", c.path.display(), c.area);
            c.path
        })
        .ok_or_else(|| Error::NoMatch {
            dir: dir.display().to_string(),
            bbox: target.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    struct MapHeaders(HashMap<PathBuf, Option<BoundingBox>>);

    impl HeaderReader for MapHeaders {
        fn read_bounds(&self, path: &Path) -> Result<Option<BoundingBox>> {
            self.0
                .get(path)
                .copied()
                .ok_or_else(|| Error::Pbf(format!("not a pbf: {}", path.display())))
        }
    }

    fn nested() -> Vec<(PathBuf, BoundingBox)> {
        vec![
            (
                PathBuf::from("europe.pbf"),
                BoundingBox::new(-25.0, 34.0, 45.0, 72.0),
            ),
            (
                PathBuf::from("andorra.pbf"),
                BoundingBox::new(1.4, 42.4, 1.8, 42.7),
            ),
            (
                PathBuf::from("spain.pbf"),
                BoundingBox::new(-10.0, 35.0, 5.0, 44.0),
            ),
        ]
    }

    #[test]
    fn test_rank_candidates_smallest_first() {
        let target = BoundingBox::new(1.53, 42.56, 1.63, 42.58);
        let ranked = rank_candidates(nested(), &target);

        let names: Vec<_> = ranked.iter().map(|c| c.path.to_str().unwrap()).collect();
        assert_eq!(names, vec!["andorra.pbf", "spain.pbf", "europe.pbf"]);
        assert!(ranked.windows(2).all(|w| w[0].area <= w[1].area));
    }

    #[test]
    fn test_rank_candidates_drops_partial_overlap() {
        // Crosses the Andorra extract's eastern edge
        let target = BoundingBox::new(1.7, 42.5, 1.9, 42.6);
        let ranked = rank_candidates(nested(), &target);

        let names: Vec<_> = ranked.iter().map(|c| c.path.to_str().unwrap()).collect();
        assert_eq!(names, vec!["spain.pbf", "europe.pbf"]);
    }

    #[test]
    fn test_select_best_source_from_directory() {
        let dir = tempdir().unwrap();
        let mut headers = HashMap::new();
        for (name, bounds) in nested() {
            let path = dir.path().join(name);
            std::fs::write(&path, b"pbf").unwrap();
            headers.insert(path, Some(bounds));
        }
        // Not a .pbf, never consulted
        std::fs::write(dir.path().join("README.txt"), b"notes").unwrap();
        // Header without a bbox is skipped
        let empty = dir.path().join("empty.pbf");
        std::fs::write(&empty, b"pbf").unwrap();
        headers.insert(empty, None);

        let reader = MapHeaders(headers);
        let target = BoundingBox::new(1.53, 42.56, 1.63, 42.58);
        let best = select_best_source(dir.path(), &target, &reader).unwrap();
        assert_eq!(best, dir.path().join("andorra.pbf"));

        let target = BoundingBox::new(-5.0, 40.0, 0.0, 43.0);
        let best = select_best_source(dir.path(), &target, &reader).unwrap();
        assert_eq!(best, dir.path().join("spain.pbf"));
    }

    #[test]
    fn test_select_best_source_no_match() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("andorra.pbf");
        std::fs::write(&path, b"pbf").unwrap();
        let reader = MapHeaders(HashMap::from([(
            path,
            Some(BoundingBox::new(1.4, 42.4, 1.8, 42.7)),
        )]));

        let target = BoundingBox::new(100.0, 10.0, 101.0, 11.0);
        match select_best_source(dir.path(), &target, &reader) {
            Err(Error::NoMatch { bbox, .. }) => assert_eq!(bbox, "100,10,101,11"),
            other => panic!("expected NoMatch, got {other:?}"),
        }
    }

    #[test]
    fn test_pbf_header_reader_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.pbf");
        std::fs::write(&path, b"definitely not protobuf").unwrap();
        assert!(PbfHeaderReader.read_bounds(&path).is_err());
    }
}
