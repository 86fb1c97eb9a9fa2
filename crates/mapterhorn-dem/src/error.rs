//! Error types for the DEM crate.

use thiserror::Error;

/// Errors that can occur when working with tiles and elevation rasters.
#[derive(Debug, Error)]
pub enum DemError {
    /// I/O error reading or writing a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TIFF decoding or encoding error.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// JSON error reading or writing a tile sidecar.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid GeoTIFF - missing or malformed georeferencing tags.
    #[error("Invalid GeoTIFF {path}: {reason}")]
    InvalidGeoTiff {
        /// Path of the offending file.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Unsupported data type in the TIFF file.
    #[error("Unsupported TIFF data type: {0}")]
    UnsupportedDataType(String),

    /// Tile coordinates are out of range for the zoom level.
    #[error("Tile z={z} x={x} y={y} is out of range")]
    InvalidTileCoord {
        /// Zoom level.
        z: u8,
        /// X tile coordinate.
        x: u32,
        /// Y tile coordinate.
        y: u32,
    },

    /// A tile id string could not be parsed.
    #[error("Invalid tile id: {0}")]
    InvalidTileId(String),

    /// Invalid zoom level.
    #[error("Invalid zoom level {0} (must be 0-{max})", max = crate::MAX_ZOOM)]
    InvalidZoomLevel(u8),

    /// A raster did not have the expected square tile dimensions.
    #[error("Tile raster is {width}x{height}, expected {expected}x{expected}")]
    TileSizeMismatch {
        /// Expected edge length in pixels.
        expected: u32,
        /// Actual width in pixels.
        width: u32,
        /// Actual height in pixels.
        height: u32,
    },
}
