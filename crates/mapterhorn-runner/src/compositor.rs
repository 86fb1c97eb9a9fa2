//! Compositing the sources of one finest-zoom tile.
//!
//! Every contributing source is resampled into the tile's pixel grid
//! extended by the plan's buffer on each side. Layers are then stacked from
//! the lowest priority up: a layer replaces what lies beneath it in its
//! interior and fades out over `falloff_px` pixels towards its own edges.
//! The buffer lets the fade see data beyond the tile edge, so adjacent tiles
//! blend identically along their shared border.

use crate::blend::layer_weights;
use crate::report::{ContributorFailure, SourceContribution, TileProvenance};
use mapterhorn_dem::{pixel_size, RasterCache, TileRaster};
use mapterhorn_plan::{BlendConfig, Contributor, WorkItem};
use tracing::{debug, warn};

/// A composited tile and its provenance.
#[derive(Debug, Clone)]
pub struct CompositeOutput {
    pub raster: TileRaster,
    pub provenance: TileProvenance,
}

/// Composites work items against shared source rasters.
pub struct Compositor<'a> {
    cache: &'a RasterCache,
    blend: BlendConfig,
    tile_size: u32,
    buffer_px: u32,
    plan_version: u64,
}

/// One source resampled into the extended grid. `NaN` marks no-data.
struct Layer {
    source_id: String,
    values: Vec<f32>,
}

impl<'a> Compositor<'a> {
    pub fn new(
        cache: &'a RasterCache,
        blend: BlendConfig,
        tile_size: u32,
        buffer_px: u32,
        plan_version: u64,
    ) -> Self {
        Self {
            cache,
            blend,
            tile_size,
            buffer_px,
            plan_version,
        }
    }

    fn extent(&self) -> usize {
        (self.tile_size + 2 * self.buffer_px) as usize
    }

    /// Composite one work item.
    ///
    /// Source files that cannot be read are dropped and listed in the
    /// provenance; the tile is still produced from the remaining layers.
    /// Pixels no layer covers are no-data.
    pub fn composite(&self, item: &WorkItem) -> CompositeOutput {
        let tile_id = item.tile.id();
        let mut failures = Vec::new();
        let layers: Vec<Layer> = item
            .contributors
            .iter()
            .filter_map(|c| self.resample(item, c, &mut failures))
            .collect();

        let extent = self.extent();
        let mut result = vec![f32::NAN; extent * extent];
        let mut sources = Vec::with_capacity(layers.len());

        // Lowest priority first; contributors are listed finest first
        for layer in layers.iter().rev() {
            let valid: Vec<bool> = layer.values.iter().map(|v| !v.is_nan()).collect();
            let weights = layer_weights(&self.blend, &valid, extent);

            let mut pixels = 0usize;
            let mut weight_sum = 0.0f64;
            for (i, &v) in layer.values.iter().enumerate() {
                if v.is_nan() {
                    continue;
                }
                let rest = result[i];
                let w = if rest.is_nan() { 1.0 } else { weights[i] };
                result[i] = if rest.is_nan() { v } else { w * v + (1.0 - w) * rest };

                if self.in_tile(i) {
                    pixels += 1;
                    weight_sum += w as f64;
                }
            }
            if pixels > 0 {
                sources.push(SourceContribution {
                    source_id: layer.source_id.clone(),
                    pixels,
                    mean_weight: weight_sum / pixels as f64,
                });
            }
        }
        sources.reverse();

        let raster = self.crop(&result);
        debug!(
            tile = %tile_id,
            layers = layers.len(),
            valid = raster.valid_count(),
            "tile composited"
        );
        CompositeOutput {
            raster,
            provenance: TileProvenance {
                tile: tile_id,
                plan_version: self.plan_version,
                sources,
                children: Vec::new(),
                failures,
            },
        }
    }

    /// Resample every file of one contributor, first valid value wins.
    fn resample(
        &self,
        item: &WorkItem,
        contributor: &Contributor,
        failures: &mut Vec<ContributorFailure>,
    ) -> Option<Layer> {
        let extent = self.extent();
        let bounds = item.tile.mercator_bounds();
        let px = pixel_size(item.tile.z, self.tile_size);
        let buffer = self.buffer_px as f64;

        let mut values = vec![f32::NAN; extent * extent];
        let mut any = false;
        for file in &contributor.files {
            let raster = match self.cache.get_or_load(&file.path) {
                Ok(raster) => raster,
                Err(e) => {
                    warn!(
                        tile = %item.tile,
                        source = %contributor.source_id,
                        path = %file.path.display(),
                        error = %e,
                        "dropping unreadable contributor"
                    );
                    failures.push(ContributorFailure {
                        tile: item.tile.id(),
                        source_id: contributor.source_id.clone(),
                        path: file.path.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let fb = raster.bounds();
            // Only visit the pixels whose centres can fall inside the file
            let col_lo = ((fb.min_x - bounds.min_x) / px + buffer - 0.5).floor().max(0.0) as usize;
            let col_hi = (((fb.max_x - bounds.min_x) / px + buffer).ceil().max(0.0) as usize).min(extent);
            let row_lo = ((bounds.max_y - fb.max_y) / px + buffer - 0.5).floor().max(0.0) as usize;
            let row_hi = (((bounds.max_y - fb.min_y) / px + buffer).ceil().max(0.0) as usize).min(extent);

            for row in row_lo..row_hi {
                let y = bounds.max_y - (row as f64 - buffer + 0.5) * px;
                for col in col_lo..col_hi {
                    let i = row * extent + col;
                    if !values[i].is_nan() {
                        continue;
                    }
                    let x = bounds.min_x + (col as f64 - buffer + 0.5) * px;
                    if let Some(v) = raster.sample_bilinear(x, y) {
                        values[i] = v;
                        any = true;
                    }
                }
            }
        }

        any.then(|| Layer {
            source_id: contributor.source_id.clone(),
            values,
        })
    }

    fn in_tile(&self, index: usize) -> bool {
        let extent = self.extent();
        let (row, col) = (index / extent, index % extent);
        let lo = self.buffer_px as usize;
        let hi = lo + self.tile_size as usize;
        (lo..hi).contains(&row) && (lo..hi).contains(&col)
    }

    fn crop(&self, grid: &[f32]) -> TileRaster {
        let extent = self.extent();
        let size = self.tile_size;
        let offset = self.buffer_px as usize;
        let mut raster = TileRaster::new_empty(size);
        for row in 0..size {
            for col in 0..size {
                let v = grid[(row as usize + offset) * extent + col as usize + offset];
                if !v.is_nan() {
                    raster.set(col, row, Some(v));
                }
            }
        }
        raster
    }
}
