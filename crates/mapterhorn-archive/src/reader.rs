//! Random-access reads from a sealed archive.

use crate::directory::{deserialize_directory, find_entry, Entry, HEADER_LEN};
use crate::header::Header;
use crate::tile_id::{tile_coord, tile_id};
use crate::{ArchiveError, Result};
use mapterhorn_dem::TileCoord;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Maximum directory nesting followed by [`ArchiveReader::get_tile`].
pub const MAX_DIRECTORY_DEPTH: usize = 4;

/// Reader over an archive.
///
/// Every directory fetched from the underlying reader is counted; see
/// [`directory_reads`](Self::directory_reads).
pub struct ArchiveReader<R> {
    inner: R,
    header: Header,
    root: Vec<Entry>,
    directory_reads: u64,
}

impl ArchiveReader<BufReader<File>> {
    /// Open an archive file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> ArchiveReader<R> {
    /// Parse the header and root directory.
    pub fn new(mut inner: R) -> Result<Self> {
        let mut buf = [0u8; HEADER_LEN];
        inner.seek(SeekFrom::Start(0))?;
        inner.read_exact(&mut buf)?;
        let header = Header::from_bytes(&buf)?;

        let root_bytes = read_range(&mut inner, header.root_offset, header.root_length)?;
        let root = deserialize_directory(&root_bytes)?;
        Ok(Self {
            inner,
            header,
            root,
            directory_reads: 1,
        })
    }

    /// The archive header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Directories fetched so far, including the root read on open.
    pub fn directory_reads(&self) -> u64 {
        self.directory_reads
    }

    /// Parsed JSON metadata.
    pub fn metadata(&mut self) -> Result<Value> {
        let bytes = read_range(
            &mut self.inner,
            self.header.metadata_offset,
            self.header.metadata_length,
        )?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Payload of tile `(z, x, y)`, or `None` if the archive has no such tile.
    ///
    /// Starts at the cached root and descends at most
    /// [`MAX_DIRECTORY_DEPTH`] levels, binary searching each directory.
    pub fn get_tile(&mut self, coord: TileCoord) -> Result<Option<Vec<u8>>> {
        let id = tile_id(coord);
        let mut entry = match find_entry(&self.root, id) {
            Some(e) => *e,
            None => return Ok(None),
        };

        let mut depth = 0;
        while entry.is_leaf() {
            depth += 1;
            if depth > MAX_DIRECTORY_DEPTH {
                return Err(ArchiveError::DirectoryTooDeep(MAX_DIRECTORY_DEPTH));
            }
            let leaf = self.read_leaf(&entry)?;
            entry = match find_entry(&leaf, id) {
                Some(e) => *e,
                None => return Ok(None),
            };
        }

        let bytes = read_range(
            &mut self.inner,
            self.header.data_offset + entry.offset,
            entry.length as u64,
        )?;
        Ok(Some(bytes))
    }

    /// Every tile entry in tile id order, with leaf directories expanded.
    pub fn entries(&mut self) -> Result<Vec<Entry>> {
        let root = self.root.clone();
        let mut out = Vec::new();
        self.collect_entries(&root, 0, &mut out)?;
        Ok(out)
    }

    /// Every addressed tile coordinate, runs expanded.
    pub fn tiles(&mut self) -> Result<Vec<TileCoord>> {
        let mut tiles = Vec::new();
        for entry in self.entries()? {
            for id in entry.tile_id..entry.tile_id + entry.run_length as u64 {
                let coord = tile_coord(id).ok_or_else(|| {
                    ArchiveError::InvalidDirectory(format!("tile id {} out of range", id))
                })?;
                tiles.push(coord);
            }
        }
        Ok(tiles)
    }

    fn collect_entries(&mut self, dir: &[Entry], depth: usize, out: &mut Vec<Entry>) -> Result<()> {
        for entry in dir {
            if entry.is_leaf() {
                if depth + 1 > MAX_DIRECTORY_DEPTH {
                    return Err(ArchiveError::DirectoryTooDeep(MAX_DIRECTORY_DEPTH));
                }
                let leaf = self.read_leaf(entry)?;
                self.collect_entries(&leaf, depth + 1, out)?;
            } else {
                out.push(*entry);
            }
        }
        Ok(())
    }

    fn read_leaf(&mut self, entry: &Entry) -> Result<Vec<Entry>> {
        if entry.offset + entry.length as u64 > self.header.leaf_length {
            return Err(ArchiveError::InvalidDirectory(format!(
                "leaf at {} overruns leaf section",
                entry.offset
            )));
        }
        let bytes = read_range(
            &mut self.inner,
            self.header.leaf_offset + entry.offset,
            entry.length as u64,
        )?;
        self.directory_reads += 1;
        deserialize_directory(&bytes)
    }
}

fn read_range<R: Read + Seek>(inner: &mut R, offset: u64, length: u64) -> Result<Vec<u8>> {
    inner.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; length as usize];
    inner.read_exact(&mut buf)?;
    Ok(buf)
}

/// Check an archive against its `.sha256` sidecar.
pub fn verify_checksum<P: AsRef<Path>>(archive: P) -> Result<bool> {
    let archive = archive.as_ref();
    let sidecar = fs::read_to_string(crate::writer::checksum_path(archive))?;
    let expected = sidecar
        .split_whitespace()
        .next()
        .ok_or_else(|| ArchiveError::InvalidHeader("empty checksum sidecar".to_string()))?;

    let mut file = BufReader::new(File::open(archive)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()) == expected)
}
