//! Error types for archive packing and reading.

use mapterhorn_dem::DemError;
use thiserror::Error;

/// Errors that can occur while packing or reading an archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reading tiles from the tile store.
    #[error("DEM error: {0}")]
    Dem(#[from] DemError),

    /// Error encoding or decoding an image tile.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON error writing metadata or the summary.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The archive could not be written. The previous archive at `path`, if
    /// any, is untouched.
    #[error("Failed to write archive {path}: {reason}")]
    WriteFailure {
        /// Target archive path.
        path: String,
        /// Underlying cause.
        reason: String,
    },

    /// The header is not a supported archive header.
    #[error("Invalid archive header: {0}")]
    InvalidHeader(String),

    /// A directory could not be decoded.
    #[error("Invalid directory: {0}")]
    InvalidDirectory(String),

    /// Leaf directories nest deeper than the reader allows.
    #[error("Directory nesting exceeds {0} levels")]
    DirectoryTooDeep(usize),

    /// Nothing to pack.
    #[error("No tiles to pack")]
    NoTiles,

    /// A tile is larger than a directory entry can address.
    #[error("Tile {0} is too large")]
    TileTooLarge(String),
}
