//! Valhalla tile hierarchy footprints
//!
//! Valhalla stores graph tiles as `<level>/<ddd>/<ddd>/<ddd>.gph` under its
//! tile directory. Each level is a global grid of square tiles; the tile id
//! counts row-major from the south-west corner (-180, -90).

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use log::warn;

use crate::core::error::{Error, Result};
use crate::core::geometry::BoundingBox;

/// Graph tile file extension
pub const TILE_EXTENSION: &str = "gph";

/// Tile edge size in degrees for a hierarchy level
pub fn tile_size(level: u8) -> Option<f64> {
    match level {
        0 => Some(4.0),
        1 => Some(1.0),
        2 => Some(0.25),
        _ => None,
    }
}

/// A tile's position in the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId {
    pub level: u8,
    pub index: u64,
}

impl TileId {
    /// Parse a path relative to the tile root, e.g. `2/000/818/660.gph`
    pub fn from_relative_path(path: &Path) -> Option<TileId> {
        if path.extension().and_then(|e| e.to_str()) != Some(TILE_EXTENSION) {
            return None;
        }

        let parts: Vec<String> = path
            .with_extension("")
            .components()
            .map(|c| match c {
                Component::Normal(s) => s.to_str().map(str::to_string),
                _ => None,
            })
            .collect::<Option<_>>()?;

        let (level, rest) = parts.split_first()?;
        if rest.is_empty() || !rest.iter().all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit())) {
            return None;
        }

        Some(TileId {
            level: level.parse().ok()?,
            index: rest.concat().parse().ok()?,
        })
    }

    pub fn footprint(&self) -> Result<BoundingBox> {
        tile_footprint(self.level, self.index)
    }
}

/// Bounding box of tile `index` on `level`
pub fn tile_footprint(level: u8, index: u64) -> Result<BoundingBox> {
    let size = tile_size(level)
        .ok_or_else(|| Error::InvalidInput(format!("unknown tile level {level}")))?;

    let columns = (360.0 / size) as u64;
    let row = index / columns;
    let col = index % columns;

    let min_y = row as f64 * size - 90.0;
    let min_x = col as f64 * size - 180.0;

    Ok(BoundingBox::new(min_x, min_y, min_x + size, min_y + size))
}

/// False only when the boxes are strictly separated on one axis
pub fn intersects(tile: &BoundingBox, query: &BoundingBox) -> bool {
    !(tile.max_x < query.min_x
        || tile.min_x > query.max_x
        || tile.max_y < query.min_y
        || tile.min_y > query.max_y)
}

/// Tiles under `root` whose footprint intersects `query`
///
/// Paths that are not under `root` or are not tile paths are skipped.
pub fn select_tiles<'a, I>(all_tiles: I, root: &Path, query: &BoundingBox) -> BTreeSet<PathBuf>
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    let mut selected = BTreeSet::new();

    for path in all_tiles {
        let tile = path
            .strip_prefix(root)
            .ok()
            .and_then(TileId::from_relative_path);
        let Some(tile) = tile else {
            warn!("Ignoring non-tile file {}", path.display());
            continue;
        };

        match tile.footprint() {
            Ok(footprint) if intersects(&footprint, query) => {
                selected.insert(path.clone());
            }
            Ok(_) => {}
            Err(e) => warn!("Ignoring {}: {e}", path.display()),
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_id_from_path() {
        assert_eq!(
            TileId::from_relative_path(Path::new("2/000/818/660.gph")),
            Some(TileId {
                level: 2,
                index: 818_660
            })
        );
        assert_eq!(
            TileId::from_relative_path(Path::new("0/003/015.gph")),
            Some(TileId {
                level: 0,
                index: 3015
            })
        );
        assert_eq!(TileId::from_relative_path(Path::new("2/000/818/660.txt")), None);
        assert_eq!(TileId::from_relative_path(Path::new("2.gph")), None);
        assert_eq!(TileId::from_relative_path(Path::new("x/000/818.gph")), None);
        assert_eq!(TileId::from_relative_path(Path::new("2/0a0/818.gph")), None);
    }

    #[test]
    fn test_tile_footprint() {
        assert_eq!(
            tile_footprint(0, 0).unwrap(),
            BoundingBox::new(-180.0, -90.0, -176.0, -86.0)
        );
        // 90 columns on level 0: index 90 starts the second row
        assert_eq!(
            tile_footprint(0, 90).unwrap(),
            BoundingBox::new(-180.0, -86.0, -176.0, -82.0)
        );
        // Andorra on level 2: row 530 of 1440 columns, column 726
        assert_eq!(
            tile_footprint(2, 530 * 1440 + 726).unwrap(),
            BoundingBox::new(1.5, 42.5, 1.75, 42.75)
        );
        assert!(tile_footprint(3, 0).is_err());
    }

    #[test]
    fn test_intersects_touching_counts() {
        let query = BoundingBox::new(1.0, 1.0, 2.0, 2.0);
        assert!(intersects(&BoundingBox::new(0.0, 0.0, 1.0, 1.0), &query));
        assert!(intersects(&BoundingBox::new(2.0, 1.5, 3.0, 2.5), &query));
        assert!(intersects(&BoundingBox::new(0.0, 0.0, 4.0, 4.0), &query));
        assert!(intersects(&BoundingBox::new(1.2, 1.2, 1.4, 1.4), &query));

        assert!(!intersects(&BoundingBox::new(0.0, 0.0, 0.99, 3.0), &query));
        assert!(!intersects(&BoundingBox::new(2.01, 0.0, 3.0, 3.0), &query));
        assert!(!intersects(&BoundingBox::new(0.0, 2.5, 3.0, 3.0), &query));
        assert!(!intersects(&BoundingBox::new(0.0, 0.0, 3.0, 0.5), &query));
    }

    #[test]
    fn test_select_tiles() {
        let root = PathBuf::from("/tiles");
        let andorra = 530 * 1440 + 726;
        let east = andorra + 1;
        let far = 100;
        let paths: Vec<PathBuf> = [
            format!("2/{:03}/{:03}/{:03}.gph", andorra / 1_000_000, andorra / 1000 % 1000, andorra % 1000),
            format!("2/{:03}/{:03}/{:03}.gph", east / 1_000_000, east / 1000 % 1000, east % 1000),
            format!("2/000/000/{far:03}.gph"),
            "1/064/762.gph".to_string(),
            "tiles.tar".to_string(),
        ]
        .iter()
        .map(|p| root.join(p))
        .collect();

        // Right edge of the query sits exactly on the andorra/east tile border
        let query = BoundingBox::new(1.53, 42.56, 1.75, 42.58);
        let selected = select_tiles(&paths, &root, &query);

        assert!(selected.contains(&paths[0]));
        assert!(selected.contains(&paths[1]), "touching tile must be included");
        assert!(!selected.contains(&paths[2]));
        assert!(!selected.contains(&paths[4]));
    }

    #[test]
    fn test_select_tiles_is_exact() {
        // Every level-0 tile, checked against the brute-force predicate
        let root = PathBuf::from("t");
        let paths: Vec<PathBuf> = (0..90 * 45u64)
            .map(|i| root.join(format!("0/{:03}/{:03}.gph", i / 1000, i % 1000)))
            .collect();
        let query = BoundingBox::new(-8.0, 36.0, 4.0, 44.0);

        let selected = select_tiles(&paths, &root, &query);
        for (i, path) in paths.iter().enumerate() {
            let fp = tile_footprint(0, i as u64).unwrap();
            let separated = fp.max_x < query.min_x
                || fp.min_x > query.max_x
                || fp.max_y < query.min_y
                || fp.min_y > query.max_y;
            assert_eq!(selected.contains(path), !separated, "tile {i}");
        }
        // 4 columns -8..4 plus the touching ones at -12..-8 and 4..8, rows 36..44 plus 32..36 and 44..48
        assert_eq!(selected.len(), 5 * 4);
    }
}
