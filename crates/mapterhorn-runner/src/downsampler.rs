//! Building overview tiles from their four children.

use crate::report::TileProvenance;
use crate::{Result, RunnerError};
use mapterhorn_dem::{TileCoord, TileRaster, TileStore};
use mapterhorn_state::{Stage, StateStore};
use std::collections::{BTreeSet, HashSet};

/// Whether a parent can be produced yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every child in the level below is done.
    Ready,
    /// These children are part of the level below but not done.
    Waiting(Vec<TileCoord>),
}

/// Distinct parents of `tiles`, sorted.
pub fn parents_of<'a>(tiles: impl IntoIterator<Item = &'a TileCoord>) -> Vec<TileCoord> {
    let set: BTreeSet<TileCoord> = tiles.into_iter().filter_map(|t| t.parent()).collect();
    set.into_iter().collect()
}

/// 2×2 block average of the valid child pixels.
///
/// `children` are in [`TileCoord::children`] order; `None` is an absent
/// child and reads as no-data. An output pixel is no-data only when all
/// four of its source pixels are.
pub fn downsample_children(children: &[Option<TileRaster>; 4], size: u32) -> TileRaster {
    let half = size / 2;
    let mut out = TileRaster::new_empty(size);
    for (quadrant, child) in children.iter().enumerate() {
        let Some(child) = child else {
            continue;
        };
        let col_offset = (quadrant as u32 % 2) * half;
        let row_offset = (quadrant as u32 / 2) * half;
        for row in 0..half {
            for col in 0..half {
                let mut sum = 0.0f64;
                let mut n = 0u32;
                for (dc, dr) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    if let Some(v) = child.get(2 * col + dc, 2 * row + dr) {
                        sum += v as f64;
                        n += 1;
                    }
                }
                if n > 0 {
                    out.set(col_offset + col, row_offset + row, Some((sum / n as f64) as f32));
                }
            }
        }
    }
    out
}

/// Produces the overview tiles of one plan version.
pub struct Downsampler<'a> {
    store: &'a TileStore,
    state: &'a dyn StateStore,
    version: u64,
    max_zoom: u8,
}

impl<'a> Downsampler<'a> {
    pub fn new(store: &'a TileStore, state: &'a dyn StateStore, version: u64, max_zoom: u8) -> Self {
        Self {
            store,
            state,
            version,
            max_zoom,
        }
    }

    /// Stage whose state tracks tiles at zoom `z`.
    fn stage_for(&self, z: u8) -> Stage {
        if z == self.max_zoom {
            Stage::Composite
        } else {
            Stage::Downsample
        }
    }

    /// Check every child of `parent` that belongs to `level_below`.
    ///
    /// Children outside `level_below` are absent and never waited on.
    pub fn readiness(&self, parent: TileCoord, level_below: &HashSet<TileCoord>) -> Result<Readiness> {
        let mut waiting = Vec::new();
        for child in parent.children() {
            if !level_below.contains(&child) {
                continue;
            }
            if !self.state.is_done(self.version, self.stage_for(child.z), &child.id())? {
                waiting.push(child);
            }
        }
        Ok(if waiting.is_empty() {
            Readiness::Ready
        } else {
            Readiness::Waiting(waiting)
        })
    }

    /// Build the raster of `parent` from its children.
    ///
    /// Fails with [`RunnerError::DependencyNotReady`] unless every child in
    /// `level_below` is done.
    pub fn produce(
        &self,
        parent: TileCoord,
        level_below: &HashSet<TileCoord>,
    ) -> Result<(TileRaster, TileProvenance)> {
        if let Readiness::Waiting(children) = self.readiness(parent, level_below)? {
            return Err(RunnerError::DependencyNotReady {
                tile: parent.id(),
                waiting_on: children.iter().map(TileCoord::id).collect(),
            });
        }

        let size = self.store.tile_size();
        let mut present = Vec::new();
        let mut children: [Option<TileRaster>; 4] = [None, None, None, None];
        for (slot, child) in children.iter_mut().zip(parent.children()) {
            if level_below.contains(&child) {
                *slot = Some(self.store.read(child)?);
                present.push(child.id());
            }
        }

        let raster = downsample_children(&children, size);
        let provenance = TileProvenance {
            tile: parent.id(),
            plan_version: self.version,
            children: present,
            ..Default::default()
        };
        Ok((raster, provenance))
    }
}
