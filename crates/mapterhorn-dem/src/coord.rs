//! Quad-tree tile coordinates on the Web Mercator (EPSG:3857) plane.
//!
//! Uses the OpenStreetMap Slippy Map tile naming convention:
//! - `z` is the zoom level (0 to [`MAX_ZOOM`])
//! - `x` is the column (0 to 2^z - 1, from west to east)
//! - `y` is the row (0 to 2^z - 1, from north to south)
//!
//! The tile at `(z, x, y)` covers exactly the union of its four children at
//! `(z + 1, 2x..=2x + 1, 2y..=2y + 1)`.

use crate::{DemError, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

/// Maximum supported zoom level.
pub const MAX_ZOOM: u8 = 24;

/// Half the circumference of the Web Mercator world square in metres.
pub const MERCATOR_HALF_EXTENT: f64 = 20_037_508.342_789_244;

/// Latitude limit of the Web Mercator projection (arctan(sinh(π))).
const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// Axis-aligned rectangle in EPSG:3857 metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MercatorBounds {
    /// West edge.
    pub min_x: f64,
    /// South edge.
    pub min_y: f64,
    /// East edge.
    pub max_x: f64,
    /// North edge.
    pub max_y: f64,
}

impl MercatorBounds {
    /// Create a rectangle from its edges.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// The whole Web Mercator world square.
    pub fn world() -> Self {
        Self::new(
            -MERCATOR_HALF_EXTENT,
            -MERCATOR_HALF_EXTENT,
            MERCATOR_HALF_EXTENT,
            MERCATOR_HALF_EXTENT,
        )
    }

    /// Width in metres.
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Height in metres.
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Area in square metres (zero for degenerate rectangles).
    pub fn area(&self) -> f64 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// True when all edges are finite and the rectangle has positive area.
    pub fn is_valid(&self) -> bool {
        [self.min_x, self.min_y, self.max_x, self.max_y]
            .iter()
            .all(|v| v.is_finite())
            && self.max_x > self.min_x
            && self.max_y > self.min_y
    }

    /// Overlapping region of two rectangles, if it has positive area.
    pub fn intersection(&self, other: &MercatorBounds) -> Option<MercatorBounds> {
        let min_x = self.min_x.max(other.min_x);
        let min_y = self.min_y.max(other.min_y);
        let max_x = self.max_x.min(other.max_x);
        let max_y = self.max_y.min(other.max_y);
        if max_x > min_x && max_y > min_y {
            Some(MercatorBounds::new(min_x, min_y, max_x, max_y))
        } else {
            None
        }
    }

    /// Smallest rectangle containing both.
    pub fn union(&self, other: &MercatorBounds) -> MercatorBounds {
        MercatorBounds::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    /// Grow the rectangle by `margin` metres on every side.
    pub fn expand(&self, margin: f64) -> MercatorBounds {
        MercatorBounds::new(
            self.min_x - margin,
            self.min_y - margin,
            self.max_x + margin,
            self.max_y + margin,
        )
    }

    /// Convert to geographic bounds.
    pub fn to_lon_lat(&self) -> TileBounds {
        let (min_lon, min_lat) = mercator_to_lon_lat(self.min_x, self.min_y);
        let (max_lon, max_lat) = mercator_to_lon_lat(self.max_x, self.max_y);
        TileBounds {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }
}

/// Geographic bounds in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TileBounds {
    /// Minimum latitude (south edge).
    pub min_lat: f64,
    /// Maximum latitude (north edge).
    pub max_lat: f64,
    /// Minimum longitude (west edge).
    pub min_lon: f64,
    /// Maximum longitude (east edge).
    pub max_lon: f64,
}

impl TileBounds {
    /// Check if a coordinate is within the bounds.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    /// Smallest bounds containing both.
    pub fn union(&self, other: &TileBounds) -> TileBounds {
        TileBounds {
            min_lat: self.min_lat.min(other.min_lat),
            max_lat: self.max_lat.max(other.max_lat),
            min_lon: self.min_lon.min(other.min_lon),
            max_lon: self.max_lon.max(other.max_lon),
        }
    }
}

/// Convert Web Mercator metres to (longitude, latitude) degrees.
pub fn mercator_to_lon_lat(x: f64, y: f64) -> (f64, f64) {
    let lon = x / MERCATOR_HALF_EXTENT * 180.0;
    let lat = (2.0 * (y / MERCATOR_HALF_EXTENT * PI).exp().atan() - PI / 2.0).to_degrees();
    (lon, lat)
}

/// Convert (longitude, latitude) degrees to Web Mercator metres.
pub fn lon_lat_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    let x = lon / 180.0 * MERCATOR_HALF_EXTENT;
    let y = (PI / 4.0 + lat.to_radians() / 2.0).tan().ln() / PI * MERCATOR_HALF_EXTENT;
    (x, y)
}

/// Ground sample distance (metres per pixel) of a zoom level.
pub fn pixel_size(z: u8, tile_size: u32) -> f64 {
    2.0 * MERCATOR_HALF_EXTENT / ((1u64 << z) as f64 * tile_size as f64)
}

/// OSM-style tile coordinates (z, x, y).
///
/// Ordering is `(z, x, y)` lexicographic, which is what plans are sorted by.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TileCoord {
    /// Zoom level.
    pub z: u8,
    /// X coordinate (column, 0 at 180°W, increases eastward).
    pub x: u32,
    /// Y coordinate (row, 0 at ~85.05°N, increases southward).
    pub y: u32,
}

impl TileCoord {
    /// Create a new tile coordinate.
    ///
    /// # Panics
    /// Panics if coordinates are out of range for the zoom level.
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        assert!(z <= MAX_ZOOM, "zoom {} out of range", z);
        let max_coord = 1u32 << z;
        assert!(x < max_coord, "x={} out of range for zoom {}", x, z);
        assert!(y < max_coord, "y={} out of range for zoom {}", y, z);
        Self { z, x, y }
    }

    /// Create a tile coordinate, validating the range.
    pub fn try_new(z: u8, x: u32, y: u32) -> Result<Self> {
        if z > MAX_ZOOM {
            return Err(DemError::InvalidZoomLevel(z));
        }
        let max_coord = 1u32 << z;
        if x >= max_coord || y >= max_coord {
            return Err(DemError::InvalidTileCoord { z, x, y });
        }
        Ok(Self { z, x, y })
    }

    /// The single tile at zoom 0.
    pub fn root() -> Self {
        Self { z: 0, x: 0, y: 0 }
    }

    /// Convert latitude/longitude to tile coordinates.
    ///
    /// Uses the OpenStreetMap Slippy Map tiling formula:
    /// - x = floor((lon + 180) / 360 * 2^z)
    /// - y = floor((1 - ln(tan(lat) + sec(lat)) / π) / 2 * 2^z)
    pub fn from_lat_lon(lat: f64, lon: f64, z: u8) -> Result<Self> {
        if z > MAX_ZOOM {
            return Err(DemError::InvalidZoomLevel(z));
        }

        let lat_clamped = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
        let n = (1u64 << z) as f64;

        let x = ((lon + 180.0) / 360.0 * n).floor().max(0.0) as u32;
        let lat_rad = lat_clamped.to_radians();
        let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n)
            .floor()
            .max(0.0) as u32;

        // Clamp to valid range (handles edge cases at exactly ±180°)
        let max_coord = ((1u64 << z) - 1) as u32;
        Ok(Self {
            z,
            x: x.min(max_coord),
            y: y.min(max_coord),
        })
    }

    /// The tile one zoom level up, or `None` at zoom 0.
    pub fn parent(&self) -> Option<TileCoord> {
        if self.z == 0 {
            return None;
        }
        Some(TileCoord {
            z: self.z - 1,
            x: self.x >> 1,
            y: self.y >> 1,
        })
    }

    /// The ancestor at zoom `z`, or `None` if `z` is finer than this tile.
    pub fn ancestor(&self, z: u8) -> Option<TileCoord> {
        if z > self.z {
            return None;
        }
        let shift = self.z - z;
        Some(TileCoord {
            z,
            x: self.x >> shift,
            y: self.y >> shift,
        })
    }

    /// The four children, in (top-left, top-right, bottom-left, bottom-right) order.
    pub fn children(&self) -> [TileCoord; 4] {
        let z = self.z + 1;
        let (x, y) = (self.x * 2, self.y * 2);
        [
            TileCoord { z, x, y },
            TileCoord { z, x: x + 1, y },
            TileCoord { z, x, y: y + 1 },
            TileCoord {
                z,
                x: x + 1,
                y: y + 1,
            },
        ]
    }

    /// True if `other` is this tile or one of its descendants.
    pub fn contains(&self, other: &TileCoord) -> bool {
        other.ancestor(self.z).is_some_and(|a| a == *self)
    }

    /// Get the bounding box for this tile in Web Mercator metres.
    pub fn mercator_bounds(&self) -> MercatorBounds {
        let size = 2.0 * MERCATOR_HALF_EXTENT / (1u64 << self.z) as f64;
        let min_x = -MERCATOR_HALF_EXTENT + self.x as f64 * size;
        let max_y = MERCATOR_HALF_EXTENT - self.y as f64 * size;
        MercatorBounds::new(min_x, max_y - size, min_x + size, max_y)
    }

    /// Get the geographic bounding box for this tile.
    pub fn bounds(&self) -> TileBounds {
        let n = (1u64 << self.z) as f64;

        let min_lon = self.x as f64 / n * 360.0 - 180.0;
        let max_lon = (self.x + 1) as f64 / n * 360.0 - 180.0;

        // Inverse of the Slippy Map formula
        let max_lat = (PI * (1.0 - 2.0 * self.y as f64 / n)).sinh().atan().to_degrees();
        let min_lat = (PI * (1.0 - 2.0 * (self.y + 1) as f64 / n)).sinh().atan().to_degrees();

        TileBounds {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    /// Stable string id, `"z/x/y"`. Used as the unit-of-work id.
    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

impl FromStr for TileCoord {
    type Err = DemError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let parsed = (|| {
            let z = parts.next()?.parse::<u8>().ok()?;
            let x = parts.next()?.parse::<u32>().ok()?;
            let y = parts.next()?.parse::<u32>().ok()?;
            if parts.next().is_some() {
                return None;
            }
            Some((z, x, y))
        })();
        let (z, x, y) = parsed.ok_or_else(|| DemError::InvalidTileId(s.to_string()))?;
        TileCoord::try_new(z, x, y)
    }
}

/// Inclusive column/row range of tiles at zoom `z` touching `bounds`.
///
/// Returns `None` when the rectangle lies outside the world square.
pub fn tile_range(z: u8, bounds: &MercatorBounds) -> Option<(u32, u32, u32, u32)> {
    let world = MercatorBounds::world();
    let clipped = bounds.intersection(&world)?;
    let n = (1u64 << z) as f64;
    let size = 2.0 * MERCATOR_HALF_EXTENT / n;
    let max_coord = ((1u64 << z) - 1) as u32;

    let to_col = |x: f64| (((x + MERCATOR_HALF_EXTENT) / size).floor().max(0.0) as u32).min(max_coord);
    let to_row = |y: f64| (((MERCATOR_HALF_EXTENT - y) / size).floor().max(0.0) as u32).min(max_coord);

    let min_col = to_col(clipped.min_x);
    let max_col = to_col(clipped.max_x);
    let min_row = to_row(clipped.max_y);
    let max_row = to_row(clipped.min_y);
    Some((min_col, max_col, min_row, max_row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_tile_coord_equator() {
        let coord = TileCoord::from_lat_lon(0.0, 0.0, 12).unwrap();
        assert_eq!(coord.z, 12);
        // At zoom 12, x=2048 is the tile just east of the prime meridian
        assert_eq!(coord.x, 2048);
        assert_eq!(coord.y, 2048);
    }

    #[test]
    fn test_tile_coord_roundtrip() {
        let test_points = [
            (47.6062, -122.3321), // Seattle
            (46.5586, 7.8354),    // Eiger
            (-33.8688, 151.2093), // Sydney
            (0.0, 0.0),           // Null Island
        ];

        for (lat, lon) in test_points {
            let coord = TileCoord::from_lat_lon(lat, lon, 12).unwrap();
            let bounds = coord.bounds();
            assert!(
                bounds.contains(lat, lon),
                "({}, {}) not in {:?} for tile {:?}",
                lat,
                lon,
                bounds,
                coord
            );
        }
    }

    #[test]
    fn test_children_cover_parent() {
        let parent = TileCoord::new(5, 17, 11);
        let pb = parent.mercator_bounds();
        let union = parent
            .children()
            .iter()
            .map(|c| c.mercator_bounds())
            .reduce(|a, b| a.union(&b))
            .unwrap();
        assert_relative_eq!(union.min_x, pb.min_x, epsilon = 1e-6);
        assert_relative_eq!(union.max_x, pb.max_x, epsilon = 1e-6);
        assert_relative_eq!(union.min_y, pb.min_y, epsilon = 1e-6);
        assert_relative_eq!(union.max_y, pb.max_y, epsilon = 1e-6);
        let child_area: f64 = parent.children().iter().map(|c| c.mercator_bounds().area()).sum();
        assert_relative_eq!(child_area, pb.area(), max_relative = 1e-12);
        for child in parent.children() {
            assert_eq!(child.parent(), Some(parent));
            assert!(parent.contains(&child));
        }
    }

    #[test]
    fn test_root_covers_world() {
        let b = TileCoord::root().mercator_bounds();
        assert_eq!(b, MercatorBounds::world());
        assert!(TileCoord::root().parent().is_none());
    }

    #[test]
    fn test_tile_id_parse() {
        let coord: TileCoord = "14/8529/5765".parse().unwrap();
        assert_eq!(coord, TileCoord::new(14, 8529, 5765));
        assert_eq!(coord.id(), "14/8529/5765");
        assert!("14/8529".parse::<TileCoord>().is_err());
        assert!("1/2/0".parse::<TileCoord>().is_err());
        assert!("a/b/c".parse::<TileCoord>().is_err());
    }

    #[test]
    fn test_tile_range_single_tile() {
        let tile = TileCoord::new(10, 532, 357);
        let inner = tile.mercator_bounds().expand(-1.0);
        assert_eq!(tile_range(10, &inner), Some((532, 532, 357, 357)));
    }

    #[test]
    fn test_mercator_roundtrip() {
        let (x, y) = lon_lat_to_mercator(7.8354, 46.5586);
        let (lon, lat) = mercator_to_lon_lat(x, y);
        assert_relative_eq!(lon, 7.8354, epsilon = 1e-9);
        assert_relative_eq!(lat, 46.5586, epsilon = 1e-9);
    }

    #[test]
    fn test_pixel_size() {
        // ~19.1 m/px at zoom 12 with 512 px tiles
        assert_relative_eq!(pixel_size(12, 512), 19.109_257_071_294_063, epsilon = 1e-9);
    }

    #[test]
    fn test_invalid_zoom() {
        assert!(TileCoord::from_lat_lon(0.0, 0.0, 25).is_err());
        assert!(TileCoord::try_new(3, 8, 0).is_err());
    }
}
