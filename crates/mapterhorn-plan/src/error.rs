//! Error types for registry loading and planning.

use mapterhorn_dem::DemError;
use thiserror::Error;

/// Errors that can occur while loading sources or building plans.
#[derive(Debug, Error)]
pub enum PlanError {
    /// I/O error reading a catalog or plan file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reading source raster metadata or writing plan files.
    #[error("DEM error: {0}")]
    Dem(#[from] DemError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML catalog parse error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A source's coverage polygon is empty, degenerate or self-intersecting.
    #[error("Invalid coverage for source '{source_id}': {reason}")]
    InvalidCoverage {
        /// Source whose coverage was rejected.
        source_id: String,
        /// What was wrong with the polygon.
        reason: String,
    },

    /// Two sources share the same id.
    #[error("Duplicate source id '{0}'")]
    DuplicateSource(String),

    /// A source is not in Web Mercator.
    #[error("Source '{source_id}' uses {crs}, only EPSG:3857 is supported")]
    UnsupportedCrs {
        /// Offending source.
        source_id: String,
        /// Declared CRS.
        crs: String,
    },

    /// A source's resolution is not a positive finite number.
    #[error("Source '{source_id}' has invalid resolution {resolution}")]
    InvalidResolution {
        /// Offending source.
        source_id: String,
        /// Declared resolution in metres per pixel.
        resolution: f64,
    },

    /// Malformed line in a `bounds.csv` file.
    #[error("Invalid bounds file {path} line {line}: {reason}")]
    InvalidBoundsCsv {
        /// Path of the CSV file.
        path: String,
        /// 1-based line number.
        line: usize,
        /// What was wrong with the line.
        reason: String,
    },

    /// Zoom range is empty or beyond the supported maximum.
    #[error("Invalid zoom range {min}..={max}")]
    InvalidZoomRange {
        /// Requested minimum zoom.
        min: u8,
        /// Requested maximum zoom.
        max: u8,
    },

    /// Tile size must be a power of two, at least 2.
    #[error("Invalid tile size {0}: must be a power of two")]
    InvalidTileSize(u32),

    /// Blend falloff is not positive or is wider than the tile buffer.
    #[error("Invalid blend settings: {0}")]
    InvalidBlend(String),

    /// No plan with this version exists in the store.
    #[error("Unknown plan version {0}")]
    UnknownVersion(u64),

    /// Another process held the plan ledger for too long.
    #[error("Plan ledger is locked: {0}")]
    LedgerLocked(String),

    /// A stored plan no longer matches the digest recorded in the ledger.
    #[error("Plan version {version} digest mismatch: ledger has {expected}, file has {actual}")]
    DigestMismatch {
        /// Plan version.
        version: u64,
        /// Digest recorded at save time.
        expected: String,
        /// Digest of the file on disk.
        actual: String,
    },
}
