//! Bounding box parsing, validation and conversions
//!
//! Boxes are axis-aligned rectangles in WGS84 degrees. Areas are compared in
//! the Mollweide equal-area projection (ESRI:54009) so that "smallest" means
//! physically smallest rather than smallest in square degrees.

use std::f64::consts::{FRAC_PI_2, PI, SQRT_2};
use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use geo::{Area, LineString, Polygon};
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

/// Sphere radius used by ESRI:54009
const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Segments per meridian edge when projecting a box
const MERIDIAN_SEGMENTS: usize = 32;

/// Newton iterations cap for the Mollweide auxiliary angle
const MAX_THETA_ITERATIONS: usize = 100;

/// OGC WKB geometry type code for a polygon
const WKB_POLYGON: u32 = 3;

/// An axis-aligned rectangle in geographic degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub const fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// True for the all-zero box PBF writers emit when there is no data
    pub fn is_null(&self) -> bool {
        self.min_x == 0.0 && self.min_y == 0.0 && self.max_x == 0.0 && self.max_y == 0.0
    }

    /// Inclusive containment: touching edges still count as contained
    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && self.max_x >= other.max_x
            && self.max_y >= other.max_y
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Canonical `minx,miny,maxx,maxy` text
///
/// Coordinates use the shortest form that parses back to the same value,
/// so submitted text like `1.50,42.0,…` comes out as `1.5,42,…`.
impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_x, self.min_y, self.max_x, self.max_y
        )
    }
}

/// Parse a `minx,miny,maxx,maxy` string
pub fn parse_box(text: &str) -> Result<BoundingBox> {
    let parts: Vec<&str> = text.split(',').collect();
    if parts.len() != 4 {
        return Err(Error::InvalidFormat(format!(
            "'{text}' must be a comma-delimited string in the format minx,miny,maxx,maxy"
        )));
    }

    let mut coords = [0.0f64; 4];
    for (slot, part) in coords.iter_mut().zip(&parts) {
        *slot = part.trim().parse::<f64>().map_err(|_| {
            Error::InvalidFormat(format!("'{}' in bbox is not a number", part.trim()))
        })?;
    }

    Ok(BoundingBox::new(coords[0], coords[1], coords[2], coords[3]))
}

/// Reject degenerate, inverted or out-of-range boxes
pub fn validate(bbox: &BoundingBox) -> Result<()> {
    let coords = [bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y];
    if coords.iter().any(|c| !c.is_finite()) {
        return Err(Error::InvalidGeometry(format!(
            "bbox {bbox} has non-finite coordinates"
        )));
    }
    if bbox.min_x >= bbox.max_x || bbox.min_y >= bbox.max_y {
        return Err(Error::InvalidGeometry(format!(
            "bbox {bbox} needs minx < maxx and miny < maxy"
        )));
    }
    if bbox.min_x < -180.0 || bbox.max_x > 180.0 {
        return Err(Error::InvalidGeometry(format!(
            "bbox {bbox} has longitudes outside [-180, 180]"
        )));
    }
    if bbox.min_y < -90.0 || bbox.max_y > 90.0 {
        return Err(Error::InvalidGeometry(format!(
            "bbox {bbox} has latitudes outside [-90, 90]"
        )));
    }
    Ok(())
}

/// Ring of the box, counter-clockwise from the lower right corner
fn ring(bbox: &BoundingBox) -> [(f64, f64); 5] {
    [
        (bbox.max_x, bbox.min_y),
        (bbox.max_x, bbox.max_y),
        (bbox.min_x, bbox.max_y),
        (bbox.min_x, bbox.min_y),
        (bbox.max_x, bbox.min_y),
    ]
}

/// Well-known text of the box as a closed polygon
pub fn to_wkt(bbox: &BoundingBox) -> String {
    let points: Vec<String> = ring(bbox)
        .iter()
        .map(|(x, y)| format!("{x} {y}"))
        .collect();
    format!("POLYGON (({}))", points.join(", "))
}

/// Inverse of [`to_wkt`] for axis-aligned rectangles
pub fn from_wkt(text: &str) -> Result<BoundingBox> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("POLYGON")
        .map(str::trim)
        .and_then(|s| s.strip_prefix("(("))
        .and_then(|s| s.strip_suffix("))"))
        .ok_or_else(|| Error::InvalidFormat(format!("'{trimmed}' is not a WKT polygon")))?;

    let mut points = Vec::new();
    for pair in body.split(',') {
        let mut it = pair.split_whitespace().map(str::parse::<f64>);
        match (it.next(), it.next(), it.next()) {
            (Some(Ok(x)), Some(Ok(y)), None) => points.push((x, y)),
            _ => {
                return Err(Error::InvalidFormat(format!(
                    "'{}' is not a WKT coordinate pair",
                    pair.trim()
                )))
            }
        }
    }

    envelope_of_rectangle(&points)
}

/// Little-endian OGC WKB of the box as a single-ring polygon
pub fn to_wkb(bbox: &BoundingBox) -> Vec<u8> {
    let points = ring(bbox);
    let mut buf = Vec::with_capacity(1 + 4 + 4 + 4 + points.len() * 16);
    buf.push(1u8);
    // Writing into a Vec cannot fail
    let _ = buf.write_u32::<LittleEndian>(WKB_POLYGON);
    let _ = buf.write_u32::<LittleEndian>(1);
    let _ = buf.write_u32::<LittleEndian>(points.len() as u32);
    for (x, y) in points {
        let _ = buf.write_f64::<LittleEndian>(x);
        let _ = buf.write_f64::<LittleEndian>(y);
    }
    buf
}

/// Parse a WKB polygon of either byte order back into a box
pub fn from_wkb(bytes: &[u8]) -> Result<BoundingBox> {
    let mut cursor = Cursor::new(bytes);
    let little = match cursor.read_u8()? {
        0 => false,
        1 => true,
        other => {
            return Err(Error::InvalidFormat(format!(
                "unknown WKB byte order flag {other}"
            )))
        }
    };

    let geometry_type = read_u32(&mut cursor, little)?;
    if geometry_type != WKB_POLYGON {
        return Err(Error::InvalidFormat(format!(
            "WKB geometry type {geometry_type} is not a polygon"
        )));
    }
    let rings = read_u32(&mut cursor, little)?;
    if rings != 1 {
        return Err(Error::InvalidFormat(format!(
            "WKB polygon has {rings} rings, expected 1"
        )));
    }

    let count = read_u32(&mut cursor, little)? as usize;
    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        let x = read_f64(&mut cursor, little)?;
        let y = read_f64(&mut cursor, little)?;
        points.push((x, y));
    }

    let mut rest = Vec::new();
    cursor.read_to_end(&mut rest)?;
    if !rest.is_empty() {
        return Err(Error::InvalidFormat(format!(
            "{} trailing bytes after WKB polygon",
            rest.len()
        )));
    }

    envelope_of_rectangle(&points)
}

fn read_u32(cursor: &mut Cursor<&[u8]>, little: bool) -> Result<u32> {
    let value = if little {
        cursor.read_u32::<LittleEndian>()?
    } else {
        cursor.read_u32::<BigEndian>()?
    };
    Ok(value)
}

fn read_f64(cursor: &mut Cursor<&[u8]>, little: bool) -> Result<f64> {
    let value = if little {
        cursor.read_f64::<LittleEndian>()?
    } else {
        cursor.read_f64::<BigEndian>()?
    };
    Ok(value)
}

/// Envelope of a ring whose vertices all sit on the envelope's corners
fn envelope_of_rectangle(points: &[(f64, f64)]) -> Result<BoundingBox> {
    if points.len() < 4 {
        return Err(Error::InvalidFormat(format!(
            "polygon has {} points, a rectangle needs at least 4",
            points.len()
        )));
    }

    let mut bbox = BoundingBox::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN);
    for &(x, y) in points {
        bbox.min_x = bbox.min_x.min(x);
        bbox.min_y = bbox.min_y.min(y);
        bbox.max_x = bbox.max_x.max(x);
        bbox.max_y = bbox.max_y.max(y);
    }

    let on_corner = |&(x, y): &(f64, f64)| {
        (x == bbox.min_x || x == bbox.max_x) && (y == bbox.min_y || y == bbox.max_y)
    };
    if !points.iter().all(on_corner) {
        return Err(Error::InvalidFormat(
            "polygon is not an axis-aligned rectangle".to_string(),
        ));
    }

    Ok(bbox)
}

/// Auxiliary angle θ solving 2θ + sin 2θ = π sin φ
fn mollweide_theta(phi: f64) -> f64 {
    if (phi.abs() - FRAC_PI_2).abs() < 1e-12 {
        return FRAC_PI_2.copysign(phi);
    }

    let target = PI * phi.sin();
    let mut two_theta = 2.0 * phi;
    for _ in 0..MAX_THETA_ITERATIONS {
        let delta = (two_theta + two_theta.sin() - target) / (1.0 + two_theta.cos());
        two_theta -= delta;
        if delta.abs() < 1e-12 {
            break;
        }
    }
    two_theta / 2.0
}

/// Project a lon/lat pair in degrees to Mollweide metres
pub fn mollweide(lon: f64, lat: f64) -> (f64, f64) {
    let theta = mollweide_theta(lat.to_radians());
    let x = 2.0 * SQRT_2 / PI * EARTH_RADIUS_M * lon.to_radians() * theta.cos();
    let y = SQRT_2 * EARTH_RADIUS_M * theta.sin();
    (x, y)
}

/// The box projected to Mollweide with its meridian edges densified
///
/// Parallels project to straight lines, meridians to elliptical arcs, so only
/// the east and west edges need intermediate vertices.
pub fn to_equal_area_polygon(bbox: &BoundingBox) -> Polygon<f64> {
    let mut coords = Vec::with_capacity(2 * MERIDIAN_SEGMENTS + 3);
    let step = bbox.height() / MERIDIAN_SEGMENTS as f64;

    for i in 0..=MERIDIAN_SEGMENTS {
        coords.push(mollweide(bbox.max_x, bbox.min_y + step * i as f64));
    }
    for i in (0..=MERIDIAN_SEGMENTS).rev() {
        coords.push(mollweide(bbox.min_x, bbox.min_y + step * i as f64));
    }
    coords.push(mollweide(bbox.max_x, bbox.min_y));

    Polygon::new(LineString::from(coords), vec![])
}

/// Area of the box in square metres
pub fn equal_area(bbox: &BoundingBox) -> f64 {
    to_equal_area_polygon(bbox).unsigned_area()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphere_area(bbox: &BoundingBox) -> f64 {
        EARTH_RADIUS_M.powi(2)
            * bbox.width().to_radians()
            * (bbox.max_y.to_radians().sin() - bbox.min_y.to_radians().sin())
    }

    #[test]
    fn test_parse_box() {
        let bbox = parse_box("1.53,42.56,1.63,42.58").unwrap();
        assert_eq!(bbox, BoundingBox::new(1.53, 42.56, 1.63, 42.58));
        assert_eq!(bbox.to_string(), "1.53,42.56,1.63,42.58");

        let bbox = parse_box(" -10 , -5.5,10,5.5 ").unwrap();
        assert_eq!(bbox, BoundingBox::new(-10.0, -5.5, 10.0, 5.5));
    }

    #[test]
    fn test_display_is_canonical() {
        let bbox = parse_box("1.50, 42.0,-10.0,43.250").unwrap();
        assert_eq!(bbox.to_string(), "1.5,42,-10,43.25");
        assert_eq!(parse_box(&bbox.to_string()).unwrap(), bbox);
    }

    #[test]
    fn test_parse_box_rejects_bad_format() {
        for text in ["", "1,2,3", "1,2,3,4,5", "a,2,3,4", "1,,3,4"] {
            match parse_box(text) {
                Err(Error::InvalidFormat(_)) => {}
                other => panic!("expected InvalidFormat for {text:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_validate() {
        assert!(validate(&BoundingBox::new(1.53, 42.56, 1.63, 42.58)).is_ok());
        assert!(validate(&BoundingBox::new(-180.0, -90.0, 180.0, 90.0)).is_ok());

        let invalid = [
            BoundingBox::new(2.0, 0.0, 1.0, 1.0),
            BoundingBox::new(1.0, 0.0, 1.0, 1.0),
            BoundingBox::new(0.0, 1.0, 1.0, 1.0),
            BoundingBox::new(0.0, 2.0, 1.0, 1.0),
            BoundingBox::new(-181.0, 0.0, 1.0, 1.0),
            BoundingBox::new(0.0, 0.0, 180.5, 1.0),
            BoundingBox::new(0.0, -91.0, 1.0, 1.0),
            BoundingBox::new(0.0, 0.0, 1.0, 90.1),
            BoundingBox::new(f64::NAN, 0.0, 1.0, 1.0),
        ];
        for bbox in invalid {
            match validate(&bbox) {
                Err(Error::InvalidGeometry(_)) => {}
                other => panic!("expected InvalidGeometry for {bbox:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_wkt_round_trip() {
        for text in [
            "1.53,42.56,1.63,42.58",
            "-180,-90,180,90",
            "-73.9876,40.7061,-73.9101,40.7831",
        ] {
            let bbox = parse_box(text).unwrap();
            let wkt = to_wkt(&bbox);
            assert!(wkt.starts_with("POLYGON (("));
            let back = from_wkt(&wkt).unwrap();
            assert!((back.min_x - bbox.min_x).abs() < 1e-9);
            assert!((back.min_y - bbox.min_y).abs() < 1e-9);
            assert!((back.max_x - bbox.max_x).abs() < 1e-9);
            assert!((back.max_y - bbox.max_y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_wkt_format() {
        let bbox = BoundingBox::new(0.0, 1.0, 2.0, 3.0);
        assert_eq!(to_wkt(&bbox), "POLYGON ((2 1, 2 3, 0 3, 0 1, 2 1))");
        assert!(from_wkt("POINT (1 2)").is_err());
        assert!(from_wkt("POLYGON ((0 0, 2 1, 0 3, 0 0))").is_err());
    }

    #[test]
    fn test_wkb_round_trip() {
        let bbox = BoundingBox::new(-10.25, 20.5, 30.75, 40.125);
        let wkb = to_wkb(&bbox);
        assert_eq!(wkb.len(), 1 + 4 + 4 + 4 + 5 * 16);
        assert_eq!(wkb[0], 1);
        assert_eq!(from_wkb(&wkb).unwrap(), bbox);
    }

    #[test]
    fn test_wkb_big_endian() {
        let mut wkb = vec![0u8];
        wkb.write_u32::<BigEndian>(WKB_POLYGON).unwrap();
        wkb.write_u32::<BigEndian>(1).unwrap();
        wkb.write_u32::<BigEndian>(5).unwrap();
        for (x, y) in [(1.0, 2.0), (1.0, 4.0), (3.0, 4.0), (3.0, 2.0), (1.0, 2.0)] {
            wkb.write_f64::<BigEndian>(x).unwrap();
            wkb.write_f64::<BigEndian>(y).unwrap();
        }
        assert_eq!(from_wkb(&wkb).unwrap(), BoundingBox::new(1.0, 2.0, 3.0, 4.0));
        assert!(from_wkb(&wkb[..10]).is_err());
    }

    #[test]
    fn test_mollweide_reference_points() {
        let (x, y) = mollweide(0.0, 0.0);
        assert!(x.abs() < 1e-6 && y.abs() < 1e-6);

        let (x, y) = mollweide(0.0, 90.0);
        assert!(x.abs() < 1e-6);
        assert!((y - SQRT_2 * EARTH_RADIUS_M).abs() < 1e-3);

        let (x, _) = mollweide(180.0, 0.0);
        assert!((x - 2.0 * SQRT_2 * EARTH_RADIUS_M).abs() < 1e-3);
    }

    #[test]
    fn test_equal_area_matches_sphere() {
        for bbox in [
            BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            BoundingBox::new(1.53, 42.56, 1.63, 42.58),
            BoundingBox::new(5.0, 60.0, 25.0, 70.0),
        ] {
            let expected = sphere_area(&bbox);
            let actual = equal_area(&bbox);
            assert!(
                ((actual - expected) / expected).abs() < 1e-3,
                "{bbox}: {actual} vs {expected}"
            );
        }

        let world = BoundingBox::new(-180.0, -90.0, 180.0, 90.0);
        let expected = 4.0 * PI * EARTH_RADIUS_M.powi(2);
        assert!(((equal_area(&world) - expected) / expected).abs() < 1e-2);
    }

    #[test]
    fn test_equal_area_orders_physically() {
        // Same extent in degrees, but closer to the pole means smaller
        let equator = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let north = BoundingBox::new(0.0, 60.0, 10.0, 70.0);
        assert!(equal_area(&north) < equal_area(&equator));
    }

    #[test]
    fn test_contains_is_inclusive() {
        let outer = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!(outer.contains(&outer));
        assert!(outer.contains(&BoundingBox::new(0.0, 2.0, 5.0, 10.0)));
        assert!(!outer.contains(&BoundingBox::new(-0.1, 2.0, 5.0, 10.0)));
        assert!(BoundingBox::new(0.0, 0.0, 0.0, 0.0).is_null());
    }
}
