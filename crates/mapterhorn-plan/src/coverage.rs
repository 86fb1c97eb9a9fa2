//! Coverage polygons and their rasterisation onto the tile grid.

use crate::registry::Source;
use crate::{PlanError, Result};
use geo::{Area, BooleanOps, Coord, Intersects, Line, LineString, MultiPolygon, Polygon, Rect};
use mapterhorn_dem::{MercatorBounds, TileCoord};

/// Area tolerance, relative to one tile at the target zoom, for treating a
/// tile as fully covered or untouched.
const AREA_EPSILON: f64 = 1e-9;

/// Snap an overlap fraction to `[0, 1]`, treating float noise as zero.
pub(crate) fn clean_fraction(fraction: f64) -> f64 {
    if fraction <= AREA_EPSILON {
        0.0
    } else {
        fraction.min(1.0)
    }
}

/// A validated coverage footprint in EPSG:3857.
#[derive(Debug, Clone)]
pub struct Coverage {
    polygon: MultiPolygon<f64>,
}

impl Coverage {
    /// Build the coverage of a source.
    ///
    /// Explicit polygons are checked for non-finite coordinates, too few
    /// vertices and self-intersections. Without one, the coverage is the
    /// union of the file footprints. Either way an empty or zero-area result
    /// is rejected.
    pub fn from_source(source: &Source) -> Result<Self> {
        let invalid = |reason: String| PlanError::InvalidCoverage {
            source_id: source.id.clone(),
            reason,
        };

        let polygon = match &source.coverage {
            Some(rings) => {
                if rings.is_empty() {
                    return Err(invalid("coverage has no polygons".to_string()));
                }
                let mut union = MultiPolygon::new(Vec::new());
                for (idx, ring) in rings.iter().enumerate() {
                    let polygon = ring_to_polygon(ring)
                        .map_err(|reason| invalid(format!("polygon {}: {}", idx, reason)))?;
                    union = union.union(&MultiPolygon::new(vec![polygon]));
                }
                union
            }
            None => {
                if source.files.is_empty() {
                    return Err(invalid("source has no files".to_string()));
                }
                let mut union = MultiPolygon::new(Vec::new());
                for file in &source.files {
                    let b = file.bounds;
                    if ![b.min_x, b.min_y, b.max_x, b.max_y]
                        .iter()
                        .all(|v| v.is_finite())
                    {
                        return Err(invalid(format!(
                            "file {} has non-finite bounds",
                            file.path.display()
                        )));
                    }
                    if !b.is_valid() {
                        continue;
                    }
                    union = union.union(&MultiPolygon::new(vec![bounds_polygon(&b)]));
                }
                union
            }
        };

        if polygon.0.is_empty() {
            return Err(invalid("coverage is empty".to_string()));
        }
        if polygon.unsigned_area() <= 0.0 {
            return Err(invalid("coverage has zero area".to_string()));
        }
        Ok(Self { polygon })
    }

    /// Coverage from an already valid polygon.
    pub fn from_polygon(polygon: MultiPolygon<f64>) -> Self {
        Self { polygon }
    }

    /// Area in square metres.
    pub fn area(&self) -> f64 {
        self.polygon.unsigned_area()
    }

    /// Fraction of `tile` covered by this footprint, in `[0, 1]`.
    pub fn overlap_fraction(&self, tile: TileCoord) -> f64 {
        let bounds = tile.mercator_bounds();
        let clipped = self
            .polygon
            .intersection(&MultiPolygon::new(vec![bounds_polygon(&bounds)]));
        clean_fraction(clipped.unsigned_area() / bounds.area())
    }

    /// Every tile at `zoom` whose intersection with the footprint has
    /// positive area, sorted, together with its overlap fraction.
    ///
    /// Descends the quad-tree from the root, clipping the footprint at each
    /// level. A tile that is fully covered emits all of its descendants
    /// without further polygon tests. Both the "untouched" and the "fully
    /// covered" tests use a tolerance scaled to one tile at `zoom`, so a
    /// footprint far smaller than a coarse tile is never lost on the way
    /// down.
    pub fn tiles_at(&self, zoom: u8) -> Vec<(TileCoord, f64)> {
        let tolerance = TileCoord::new(zoom, 0, 0).mercator_bounds().area() * AREA_EPSILON;
        let mut out = Vec::new();
        descend(&self.polygon, TileCoord::root(), zoom, tolerance, &mut out);
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

fn descend(
    polygon: &MultiPolygon<f64>,
    tile: TileCoord,
    zoom: u8,
    tolerance: f64,
    out: &mut Vec<(TileCoord, f64)>,
) {
    let bounds = tile.mercator_bounds();
    let tile_area = bounds.area();
    let clipped = polygon.intersection(&MultiPolygon::new(vec![bounds_polygon(&bounds)]));
    let covered = clipped.unsigned_area();
    if covered <= tolerance {
        return;
    }

    if tile_area - covered <= tolerance {
        emit_descendants(tile, zoom, out);
        return;
    }
    if tile.z == zoom {
        out.push((tile, (covered / tile_area).clamp(0.0, 1.0)));
        return;
    }
    for child in tile.children() {
        descend(&clipped, child, zoom, tolerance, out);
    }
}

/// Push every descendant of `tile` at `zoom` with full overlap.
fn emit_descendants(tile: TileCoord, zoom: u8, out: &mut Vec<(TileCoord, f64)>) {
    let shift = zoom - tile.z;
    let side = 1u32 << shift;
    let (x0, y0) = (tile.x << shift, tile.y << shift);
    for x in x0..x0 + side {
        for y in y0..y0 + side {
            out.push((TileCoord { z: zoom, x, y }, 1.0));
        }
    }
}

pub(crate) fn bounds_polygon(bounds: &MercatorBounds) -> Polygon<f64> {
    Rect::new(
        Coord {
            x: bounds.min_x,
            y: bounds.min_y,
        },
        Coord {
            x: bounds.max_x,
            y: bounds.max_y,
        },
    )
    .to_polygon()
}

/// Validate a single exterior ring and turn it into a polygon.
fn ring_to_polygon(ring: &[[f64; 2]]) -> std::result::Result<Polygon<f64>, String> {
    if ring.iter().flatten().any(|v| !v.is_finite()) {
        return Err("non-finite coordinate".to_string());
    }
    let mut coords: Vec<Coord<f64>> = ring.iter().map(|[x, y]| Coord { x: *x, y: *y }).collect();
    if coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    coords.dedup();
    if coords.len() < 3 {
        return Err("fewer than three distinct vertices".to_string());
    }
    if ring_self_intersects(&coords) {
        return Err("ring is self-intersecting".to_string());
    }
    let polygon = Polygon::new(LineString::from(coords), Vec::new());
    if polygon.unsigned_area() <= 0.0 {
        return Err("ring has zero area".to_string());
    }
    Ok(polygon)
}

/// True if any two non-adjacent edges of the closed ring touch.
fn ring_self_intersects(coords: &[Coord<f64>]) -> bool {
    let n = coords.len();
    let edges: Vec<Line<f64>> = (0..n)
        .map(|i| Line::new(coords[i], coords[(i + 1) % n]))
        .collect();
    for i in 0..n {
        for j in (i + 1)..n {
            let adjacent = j == i + 1 || (i == 0 && j == n - 1);
            if adjacent {
                // Adjacent edges share a vertex; they only conflict if they fold back
                if collinear_overlap(&edges[i], &edges[j]) {
                    return true;
                }
                continue;
            }
            if edges[i].intersects(&edges[j]) {
                return true;
            }
        }
    }
    false
}

/// Adjacent edges that run back over each other.
fn collinear_overlap(a: &Line<f64>, b: &Line<f64>) -> bool {
    let da = a.delta();
    let db = b.delta();
    let cross = da.x * db.y - da.y * db.x;
    let dot = da.x * db.x + da.y * db.y;
    cross == 0.0 && dot < 0.0
}
