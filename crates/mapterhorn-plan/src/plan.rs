//! Work plan types and plan comparison.

use crate::blend::BlendConfig;
use crate::Result;
use mapterhorn_dem::TileCoord;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// A source file contributing to one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileContribution {
    /// Path to the GeoTIFF.
    pub path: PathBuf,
    /// Fraction of the tile covered by the file's footprint. Zero for files
    /// that only reach into the blending buffer around the tile.
    pub overlap: f64,
}

/// One source contributing to a tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contributor {
    /// Source id.
    pub source_id: String,
    /// Source resolution in metres per pixel; smaller wins.
    pub resolution: f64,
    /// Fraction of the tile covered by the source's coverage polygon.
    pub overlap: f64,
    /// Files of this source touching the tile or its buffer, sorted by path.
    pub files: Vec<FileContribution>,
}

/// The unit of work for one tile at the finest zoom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Output tile.
    pub tile: TileCoord,
    /// Contributors, highest priority first.
    pub contributors: Vec<Contributor>,
}

/// A source left out of a plan because its coverage was invalid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedSource {
    /// Source id.
    pub source_id: String,
    /// Why the coverage was rejected.
    pub reason: String,
}

/// An immutable set of work items derived from one registry snapshot.
///
/// The serialized form contains nothing run-specific (no version, no
/// timestamps), so the same registry and options always serialize to the
/// same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkPlan {
    /// Coarsest zoom produced by downsampling.
    pub min_zoom: u8,
    /// Zoom at which work items are composited.
    pub max_zoom: u8,
    /// Output tile edge in pixels.
    pub tile_size: u32,
    /// Buffer around each tile, in pixels, used when selecting files.
    pub buffer_px: u32,
    /// Seam blending used by every composite of this plan.
    pub blend: BlendConfig,
    /// Digest of the registry the plan was derived from.
    pub registry_digest: String,
    /// Work items sorted by tile.
    pub items: Vec<WorkItem>,
    /// Sources skipped because of invalid coverage.
    #[serde(default)]
    pub rejected: Vec<RejectedSource>,
}

impl WorkPlan {
    /// Deterministic JSON encoding.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parse a plan previously written by [`WorkPlan::to_json_bytes`].
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Hex SHA-256 of the JSON encoding.
    pub fn digest(&self) -> Result<String> {
        Ok(digest_bytes(&self.to_json_bytes()?))
    }

    /// Number of work items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the plan has no work items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Look up the work item for a tile.
    pub fn item(&self, tile: TileCoord) -> Option<&WorkItem> {
        self.items
            .binary_search_by(|item| item.tile.cmp(&tile))
            .ok()
            .map(|idx| &self.items[idx])
    }

    /// Tiles at the finest zoom, in plan order.
    pub fn tiles(&self) -> impl Iterator<Item = TileCoord> + '_ {
        self.items.iter().map(|item| item.tile)
    }

    /// Tiles expected at zoom `z`: the work items at `max_zoom`, or their
    /// distinct ancestors for overview levels. Empty outside the zoom range.
    pub fn tiles_at_zoom(&self, z: u8) -> Vec<TileCoord> {
        if z < self.min_zoom || z > self.max_zoom {
            return Vec::new();
        }
        let set: BTreeSet<TileCoord> = self.tiles().filter_map(|t| t.ancestor(z)).collect();
        set.into_iter().collect()
    }

    /// Compare against an older plan.
    pub fn diff(&self, older: &WorkPlan) -> PlanDiff {
        let old: BTreeMap<TileCoord, &WorkItem> =
            older.items.iter().map(|item| (item.tile, item)).collect();
        let new: BTreeMap<TileCoord, &WorkItem> =
            self.items.iter().map(|item| (item.tile, item)).collect();

        let mut diff = PlanDiff::default();
        for (tile, item) in &new {
            match old.get(tile) {
                None => diff.added.push(*tile),
                Some(previous) if previous != item => diff.changed.push(*tile),
                Some(_) => {}
            }
        }
        diff.removed = old.keys().filter(|t| !new.contains_key(t)).copied().collect();
        diff
    }
}

/// Hex SHA-256 of an encoded plan.
pub(crate) fn digest_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Tiles that differ between two plans, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDiff {
    /// Tiles only in the newer plan.
    pub added: Vec<TileCoord>,
    /// Tiles only in the older plan.
    pub removed: Vec<TileCoord>,
    /// Tiles in both whose contributors differ.
    pub changed: Vec<TileCoord>,
}

impl PlanDiff {
    /// True when the plans have identical work items.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Distinct ancestors at zoom `z` of every differing tile: the overview
    /// tiles that must be rebuilt.
    pub fn dirty_at_zoom(&self, z: u8) -> Vec<TileCoord> {
        let set: BTreeSet<TileCoord> = self
            .added
            .iter()
            .chain(&self.removed)
            .chain(&self.changed)
            .filter_map(|t| t.ancestor(z))
            .collect();
        set.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(z: u8, x: u32, y: u32, source: &str) -> WorkItem {
        WorkItem {
            tile: TileCoord::new(z, x, y),
            contributors: vec![Contributor {
                source_id: source.to_string(),
                resolution: 10.0,
                overlap: 1.0,
                files: vec![FileContribution {
                    path: PathBuf::from(format!("{}.tif", source)),
                    overlap: 1.0,
                }],
            }],
        }
    }

    fn plan(items: Vec<WorkItem>) -> WorkPlan {
        WorkPlan {
            min_zoom: 0,
            max_zoom: 3,
            tile_size: 512,
            buffer_px: 16,
            blend: BlendConfig::default(),
            registry_digest: "abc".to_string(),
            items,
            rejected: Vec::new(),
        }
    }

    #[test]
    fn test_digest_stable() {
        let p = plan(vec![item(3, 1, 1, "a")]);
        let bytes = p.to_json_bytes().unwrap();
        let parsed = WorkPlan::from_json_bytes(&bytes).unwrap();
        assert_eq!(parsed, p);
        assert_eq!(parsed.digest().unwrap(), p.digest().unwrap());
    }

    #[test]
    fn test_item_lookup() {
        let p = plan(vec![item(3, 1, 1, "a"), item(3, 2, 5, "a"), item(3, 7, 0, "a")]);
        assert!(p.item(TileCoord::new(3, 2, 5)).is_some());
        assert!(p.item(TileCoord::new(3, 2, 6)).is_none());
    }

    #[test]
    fn test_tiles_at_zoom() {
        let p = plan(vec![item(3, 0, 0, "a"), item(3, 1, 1, "a"), item(3, 7, 7, "a")]);
        assert_eq!(
            p.tiles_at_zoom(2),
            vec![TileCoord::new(2, 0, 0), TileCoord::new(2, 3, 3)]
        );
        assert_eq!(p.tiles_at_zoom(0), vec![TileCoord::root()]);
        assert!(p.tiles_at_zoom(4).is_empty());
    }

    #[test]
    fn test_diff() {
        let old = plan(vec![item(3, 0, 0, "a"), item(3, 1, 0, "a"), item(3, 2, 0, "a")]);
        let new = plan(vec![item(3, 1, 0, "a"), item(3, 2, 0, "b"), item(3, 6, 6, "a")]);
        let diff = new.diff(&old);
        assert_eq!(diff.added, vec![TileCoord::new(3, 6, 6)]);
        assert_eq!(diff.removed, vec![TileCoord::new(3, 0, 0)]);
        assert_eq!(diff.changed, vec![TileCoord::new(3, 2, 0)]);
        assert_eq!(
            diff.dirty_at_zoom(1),
            vec![TileCoord::new(1, 0, 0), TileCoord::new(1, 1, 1)]
        );
        assert!(new.diff(&new).is_empty());
    }
}
