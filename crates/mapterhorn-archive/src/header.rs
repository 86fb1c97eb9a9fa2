//! Fixed 127-byte archive header.

use crate::directory::HEADER_LEN;
use crate::{ArchiveError, Result};
use mapterhorn_dem::TileBounds;

const MAGIC: &[u8; 7] = b"PMTiles";
const VERSION: u8 = 3;

/// Compression code for uncompressed sections.
pub const COMPRESSION_NONE: u8 = 1;

/// Tile type code for payloads that are neither vector nor image tiles.
pub const TILE_TYPE_UNKNOWN: u8 = 0;
pub const TILE_TYPE_PNG: u8 = 2;
pub const TILE_TYPE_WEBP: u8 = 4;

/// Parsed archive header.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub root_offset: u64,
    pub root_length: u64,
    pub metadata_offset: u64,
    pub metadata_length: u64,
    pub leaf_offset: u64,
    pub leaf_length: u64,
    pub data_offset: u64,
    pub data_length: u64,
    /// Number of tile ids with a payload.
    pub addressed_tiles: u64,
    /// Number of directory entries pointing at payloads.
    pub tile_entries: u64,
    /// Number of distinct payloads.
    pub tile_contents: u64,
    /// Tiles are stored in tile id order.
    pub clustered: bool,
    pub internal_compression: u8,
    pub tile_compression: u8,
    pub tile_type: u8,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub bounds: TileBounds,
    pub center_zoom: u8,
    pub center_lon: f64,
    pub center_lat: f64,
}

impl Header {
    /// Encode to exactly 127 bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..7].copy_from_slice(MAGIC);
        buf[7] = VERSION;

        let words = [
            self.root_offset,
            self.root_length,
            self.metadata_offset,
            self.metadata_length,
            self.leaf_offset,
            self.leaf_length,
            self.data_offset,
            self.data_length,
            self.addressed_tiles,
            self.tile_entries,
            self.tile_contents,
        ];
        for (i, word) in words.iter().enumerate() {
            let at = 8 + i * 8;
            buf[at..at + 8].copy_from_slice(&word.to_le_bytes());
        }

        buf[96] = u8::from(self.clustered);
        buf[97] = self.internal_compression;
        buf[98] = self.tile_compression;
        buf[99] = self.tile_type;
        buf[100] = self.min_zoom;
        buf[101] = self.max_zoom;
        put_e7(&mut buf, 102, self.bounds.min_lon);
        put_e7(&mut buf, 106, self.bounds.min_lat);
        put_e7(&mut buf, 110, self.bounds.max_lon);
        put_e7(&mut buf, 114, self.bounds.max_lat);
        buf[118] = self.center_zoom;
        put_e7(&mut buf, 119, self.center_lon);
        put_e7(&mut buf, 123, self.center_lat);
        buf
    }

    /// Decode a header, rejecting foreign files and unsupported versions.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(ArchiveError::InvalidHeader(format!(
                "{} bytes, expected {}",
                buf.len(),
                HEADER_LEN
            )));
        }
        if &buf[..7] != MAGIC {
            return Err(ArchiveError::InvalidHeader("bad magic".to_string()));
        }
        if buf[7] != VERSION {
            return Err(ArchiveError::InvalidHeader(format!(
                "unsupported version {}",
                buf[7]
            )));
        }

        let word = |i: usize| {
            let at = 8 + i * 8;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(bytes)
        };

        Ok(Self {
            root_offset: word(0),
            root_length: word(1),
            metadata_offset: word(2),
            metadata_length: word(3),
            leaf_offset: word(4),
            leaf_length: word(5),
            data_offset: word(6),
            data_length: word(7),
            addressed_tiles: word(8),
            tile_entries: word(9),
            tile_contents: word(10),
            clustered: buf[96] == 1,
            internal_compression: buf[97],
            tile_compression: buf[98],
            tile_type: buf[99],
            min_zoom: buf[100],
            max_zoom: buf[101],
            bounds: TileBounds {
                min_lon: get_e7(buf, 102),
                min_lat: get_e7(buf, 106),
                max_lon: get_e7(buf, 110),
                max_lat: get_e7(buf, 114),
            },
            center_zoom: buf[118],
            center_lon: get_e7(buf, 119),
            center_lat: get_e7(buf, 123),
        })
    }
}

fn put_e7(buf: &mut [u8], at: usize, degrees: f64) {
    let value = (degrees * 1e7).round() as i32;
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_e7(buf: &[u8], at: usize) -> f64 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    i32::from_le_bytes(bytes) as f64 / 1e7
}
