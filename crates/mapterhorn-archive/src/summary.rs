//! Coverage summary written next to every sealed archive.

use chrono::{DateTime, Utc};
use mapterhorn_dem::TileBounds;
use serde::{Deserialize, Serialize};

/// What an archive contains, as written to `<archive>.summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSummary {
    /// Archive file name.
    pub archive: String,
    /// Bundle name (`planet` or `z-x-y`).
    pub name: String,
    /// Plan version the tiles were produced from.
    pub plan_version: Option<u64>,
    /// Root of the packed subtree, if restricted.
    pub subtree: Option<String>,
    /// Coarsest zoom actually packed.
    pub min_zoom: u8,
    /// Finest zoom actually packed.
    pub max_zoom: u8,
    /// Union of the packed tiles at `max_zoom`.
    pub bounds: TileBounds,
    /// Tiles addressable through the directory.
    pub addressed_tiles: u64,
    /// Directory entries pointing at tile data.
    pub tile_entries: u64,
    /// Distinct payloads after deduplication.
    pub unique_tiles: u64,
    /// Number of leaf directories.
    pub leaf_directories: u64,
    /// Archive size in bytes.
    pub bytes: u64,
    /// Hex SHA-256 of the archive file.
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}
