//! # mapterhorn-archive
//!
//! Packs a finished tile pyramid into one randomly addressable file and
//! reads tiles back out of it.
//!
//! The layout follows PMTiles v3: a fixed 127-byte header, a root
//! directory, JSON metadata, optional leaf directories, then the tile
//! payloads. Tiles are ordered by a Hilbert-curve [`tile_id`]; identical
//! payloads are stored once and consecutive repeats collapse into a single
//! run-length entry. Tiles are packed as Terrarium WebP by default (see
//! [`TileEncoding`]). The root directory always fits together with the header
//! in the first 16 KiB, so a lookup costs one read for the root plus one per
//! leaf level.
//!
//! ## Example
//!
//! ```no_run
//! use mapterhorn_archive::{pack, ArchiveReader, PackOptions};
//! use mapterhorn_dem::{TileCoord, TileStore};
//! use std::path::Path;
//!
//! let store = TileStore::new("work/tiles/3", 512);
//! let options = PackOptions::new(0, 12).with_plan_version(3);
//! let summary = pack(&store, Path::new("out/planet.pmtiles"), &options)?;
//! println!("{} tiles, {} unique", summary.addressed_tiles, summary.unique_tiles);
//!
//! let mut reader = ArchiveReader::open("out/planet.pmtiles")?;
//! if let Some(bytes) = reader.get_tile(TileCoord::new(12, 2138, 1450))? {
//!     let raster = mapterhorn_archive::decode_terrarium(&bytes)?;
//!     println!("{} valid pixels", raster.valid_count());
//! }
//! # Ok::<(), mapterhorn_archive::ArchiveError>(())
//! ```

pub mod directory;
mod encoding;
mod error;
pub mod header;
mod reader;
mod summary;
mod tile_id;
mod writer;

pub use directory::{DirectoryLayout, Entry};
pub use encoding::{
    decode_terrarium, encode_terrarium, terrarium_elevation, terrarium_pixel, TileEncoding,
};
pub use error::ArchiveError;
pub use header::Header;
pub use reader::{verify_checksum, ArchiveReader, MAX_DIRECTORY_DEPTH};
pub use summary::ArchiveSummary;
pub use tile_id::{tile_coord, tile_id};
pub use writer::{
    checksum_path, pack, summary_path, PackOptions, TileSource, DEFAULT_ATTRIBUTION,
};

/// Result type for archive operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;
