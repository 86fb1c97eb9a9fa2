//! Coverage planner: registry → work plan.

use crate::blend::BlendConfig;
use crate::coverage::{clean_fraction, Coverage};
use crate::plan::{Contributor, FileContribution, RejectedSource, WorkItem, WorkPlan};
use crate::registry::{Registry, Source};
use crate::{PlanError, Result};
use mapterhorn_dem::{pixel_size, tile_range, TileCoord, MAX_ZOOM};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Parameters of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanOptions {
    /// Coarsest overview zoom.
    pub min_zoom: u8,
    /// Zoom at which sources are composited.
    pub max_zoom: u8,
    /// Output tile edge in pixels.
    pub tile_size: u32,
    /// Pixels around each tile whose source files are also attached, so
    /// blending near tile edges sees the neighbouring data.
    pub buffer_px: u32,
    /// Seam blending; `falloff_px` may not exceed `buffer_px`.
    pub blend: BlendConfig,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            min_zoom: 0,
            max_zoom: 12,
            tile_size: 512,
            buffer_px: 16,
            blend: BlendConfig::default(),
        }
    }
}

impl PlanOptions {
    /// Check the zoom range, tile size and blend settings.
    ///
    /// Tiles must halve evenly down the pyramid, so the size is a power of
    /// two.
    pub fn validate(&self) -> Result<()> {
        if self.min_zoom > self.max_zoom || self.max_zoom > MAX_ZOOM {
            return Err(PlanError::InvalidZoomRange {
                min: self.min_zoom,
                max: self.max_zoom,
            });
        }
        if self.tile_size < 2 || !self.tile_size.is_power_of_two() {
            return Err(PlanError::InvalidTileSize(self.tile_size));
        }
        self.blend.validate(self.buffer_px)
    }
}

/// Build a work plan covering every source in the registry.
///
/// Sources with invalid coverage are logged, recorded in
/// [`WorkPlan::rejected`] and left out; the rest are planned normally.
pub fn build_plan(registry: &Registry, options: &PlanOptions) -> Result<WorkPlan> {
    options.validate()?;
    let zoom = options.max_zoom;
    let buffer_m = options.buffer_px as f64 * pixel_size(zoom, options.tile_size);

    let mut per_tile: BTreeMap<TileCoord, Vec<Contributor>> = BTreeMap::new();
    let mut rejected = Vec::new();

    for source in registry.sources() {
        let coverage = match Coverage::from_source(source) {
            Ok(coverage) => coverage,
            Err(PlanError::InvalidCoverage { source_id, reason }) => {
                warn!(source = %source_id, %reason, "rejecting source with invalid coverage");
                rejected.push(RejectedSource { source_id, reason });
                continue;
            }
            Err(e) => return Err(e),
        };

        let tiles = coverage.tiles_at(zoom);
        debug!(source = %source.id, tiles = tiles.len(), "rasterised coverage");
        if tiles.is_empty() {
            let reason = format!(
                "coverage of {:.3} m² touches no tile at zoom {}",
                coverage.area(),
                zoom
            );
            warn!(source = %source.id, %reason, "rejecting source");
            rejected.push(RejectedSource {
                source_id: source.id.clone(),
                reason,
            });
            continue;
        }
        let mut files_by_tile = attach_files(source, &tiles, zoom, buffer_m);

        for (tile, overlap) in tiles {
            let files = files_by_tile.remove(&tile).unwrap_or_default();
            per_tile.entry(tile).or_default().push(Contributor {
                source_id: source.id.clone(),
                resolution: source.resolution,
                overlap,
                files,
            });
        }
    }

    let items: Vec<WorkItem> = per_tile
        .into_iter()
        .map(|(tile, mut contributors)| {
            contributors.sort_by(|a, b| {
                a.resolution
                    .total_cmp(&b.resolution)
                    .then_with(|| a.source_id.cmp(&b.source_id))
            });
            WorkItem { tile, contributors }
        })
        .collect();

    info!(
        tiles = items.len(),
        sources = registry.len() - rejected.len(),
        rejected = rejected.len(),
        zoom,
        "built work plan"
    );

    Ok(WorkPlan {
        min_zoom: options.min_zoom,
        max_zoom: options.max_zoom,
        tile_size: options.tile_size,
        buffer_px: options.buffer_px,
        blend: options.blend,
        registry_digest: registry.digest()?,
        items,
        rejected,
    })
}

/// Map each planned tile to the source files reaching into it or its buffer.
fn attach_files(
    source: &Source,
    tiles: &[(TileCoord, f64)],
    zoom: u8,
    buffer_m: f64,
) -> BTreeMap<TileCoord, Vec<FileContribution>> {
    let planned: BTreeMap<TileCoord, ()> = tiles.iter().map(|(t, _)| (*t, ())).collect();
    let mut out: BTreeMap<TileCoord, Vec<FileContribution>> = BTreeMap::new();

    // source.files is sorted by path, so each list stays sorted
    for file in &source.files {
        if !file.bounds.is_valid() {
            continue;
        }
        let reach = file.bounds.expand(buffer_m);
        let Some((min_col, max_col, min_row, max_row)) = tile_range(zoom, &reach) else {
            continue;
        };
        for x in min_col..=max_col {
            for y in min_row..=max_row {
                let tile = TileCoord { z: zoom, x, y };
                if !planned.contains_key(&tile) {
                    continue;
                }
                let tile_bounds = tile.mercator_bounds();
                if tile_bounds.expand(buffer_m).intersection(&file.bounds).is_none() {
                    continue;
                }
                let overlap = tile_bounds
                    .intersection(&file.bounds)
                    .map(|i| clean_fraction(i.area() / tile_bounds.area()))
                    .unwrap_or(0.0);
                out.entry(tile).or_default().push(FileContribution {
                    path: file.path.clone(),
                    overlap,
                });
            }
        }
    }
    out
}
