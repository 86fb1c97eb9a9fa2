//! Directory entries and their varint encoding.
//!
//! A directory is a list of entries sorted by tile id, stored column-wise:
//! entry count, tile id deltas, run lengths, lengths, then offsets. An
//! offset is written as `0` when the entry's data directly follows the
//! previous entry's data, and as `offset + 1` otherwise.
//!
//! An entry with `run_length > 0` addresses `run_length` consecutive tile
//! ids sharing one payload. An entry with `run_length == 0` points at a
//! leaf directory instead.

use crate::{ArchiveError, Result};

/// Header size in bytes.
pub const HEADER_LEN: usize = 127;

/// Root directory plus header must fit in this many bytes.
pub const ROOT_MAX_BYTES: usize = 16_384;

/// One directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// First tile id covered.
    pub tile_id: u64,
    /// Offset of the payload (tile data section) or leaf (leaf section).
    pub offset: u64,
    /// Payload or leaf length in bytes.
    pub length: u32,
    /// Number of consecutive tile ids sharing the payload; `0` for leaves.
    pub run_length: u32,
}

impl Entry {
    /// True if the entry points at a leaf directory.
    pub fn is_leaf(&self) -> bool {
        self.run_length == 0
    }
}

/// Tuning of the root/leaf split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryLayout {
    /// Maximum encoded size of the root directory.
    pub max_root_bytes: usize,
    /// Entries per leaf on the first attempt; doubled until the root fits.
    pub initial_leaf_entries: usize,
}

impl Default for DirectoryLayout {
    fn default() -> Self {
        Self {
            max_root_bytes: ROOT_MAX_BYTES - HEADER_LEN,
            initial_leaf_entries: 4096,
        }
    }
}

/// Encoded root directory and concatenated leaf directories.
#[derive(Debug, Clone, Default)]
pub struct Directories {
    /// Root directory bytes.
    pub root: Vec<u8>,
    /// Leaf directory bytes, addressed by root entries.
    pub leaves: Vec<u8>,
    /// Number of leaf directories.
    pub leaf_count: usize,
}

/// Split `entries` into a root directory and, if needed, leaf directories.
pub fn build_directories(entries: &[Entry], layout: &DirectoryLayout) -> Directories {
    let root = serialize_directory(entries);
    if root.len() <= layout.max_root_bytes {
        return Directories {
            root,
            leaves: Vec::new(),
            leaf_count: 0,
        };
    }

    let mut leaf_entries = layout.initial_leaf_entries.max(1);
    loop {
        let dirs = split_into_leaves(entries, leaf_entries);
        if dirs.root.len() <= layout.max_root_bytes || leaf_entries >= entries.len() {
            return dirs;
        }
        leaf_entries *= 2;
    }
}

fn split_into_leaves(entries: &[Entry], leaf_entries: usize) -> Directories {
    let mut root_entries = Vec::new();
    let mut leaves = Vec::new();
    for chunk in entries.chunks(leaf_entries) {
        let encoded = serialize_directory(chunk);
        root_entries.push(Entry {
            tile_id: chunk[0].tile_id,
            offset: leaves.len() as u64,
            length: encoded.len() as u32,
            run_length: 0,
        });
        leaves.extend_from_slice(&encoded);
    }
    Directories {
        root: serialize_directory(&root_entries),
        leaf_count: root_entries.len(),
        leaves,
    }
}

/// Encode a sorted list of entries.
pub fn serialize_directory(entries: &[Entry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * 6 + 4);
    write_varint(&mut out, entries.len() as u64);

    let mut last_id = 0u64;
    for entry in entries {
        write_varint(&mut out, entry.tile_id - last_id);
        last_id = entry.tile_id;
    }
    for entry in entries {
        write_varint(&mut out, entry.run_length as u64);
    }
    for entry in entries {
        write_varint(&mut out, entry.length as u64);
    }
    for (i, entry) in entries.iter().enumerate() {
        let contiguous =
            i > 0 && entry.offset == entries[i - 1].offset + entries[i - 1].length as u64;
        if contiguous {
            write_varint(&mut out, 0);
        } else {
            write_varint(&mut out, entry.offset + 1);
        }
    }
    out
}

/// Decode a directory written by [`serialize_directory`].
pub fn deserialize_directory(bytes: &[u8]) -> Result<Vec<Entry>> {
    let mut cursor = 0usize;
    let count = read_varint(bytes, &mut cursor)? as usize;
    // Each entry needs at least four bytes
    if count > bytes.len() {
        return Err(ArchiveError::InvalidDirectory(format!(
            "{} entries in {} bytes",
            count,
            bytes.len()
        )));
    }

    let mut entries = vec![
        Entry {
            tile_id: 0,
            offset: 0,
            length: 0,
            run_length: 0,
        };
        count
    ];

    let mut last_id = 0u64;
    for entry in entries.iter_mut() {
        last_id = last_id
            .checked_add(read_varint(bytes, &mut cursor)?)
            .ok_or_else(|| ArchiveError::InvalidDirectory("tile id overflow".to_string()))?;
        entry.tile_id = last_id;
    }
    for entry in entries.iter_mut() {
        entry.run_length = to_u32(read_varint(bytes, &mut cursor)?)?;
    }
    for entry in entries.iter_mut() {
        entry.length = to_u32(read_varint(bytes, &mut cursor)?)?;
    }
    for i in 0..count {
        let raw = read_varint(bytes, &mut cursor)?;
        entries[i].offset = if raw == 0 {
            if i == 0 {
                return Err(ArchiveError::InvalidDirectory(
                    "first entry cannot be contiguous".to_string(),
                ));
            }
            entries[i - 1].offset + entries[i - 1].length as u64
        } else {
            raw - 1
        };
    }
    if cursor != bytes.len() {
        return Err(ArchiveError::InvalidDirectory(format!(
            "{} trailing bytes",
            bytes.len() - cursor
        )));
    }
    Ok(entries)
}

/// Entry responsible for `tile_id`: the last entry whose id is not greater.
///
/// For a tile entry the id must also fall inside its run; leaf entries are
/// returned as-is and the caller descends into them.
pub fn find_entry(entries: &[Entry], tile_id: u64) -> Option<&Entry> {
    let idx = entries.partition_point(|e| e.tile_id <= tile_id);
    let entry = entries.get(idx.checked_sub(1)?)?;
    if entry.is_leaf() || tile_id < entry.tile_id + entry.run_length as u64 {
        Some(entry)
    } else {
        None
    }
}

fn to_u32(v: u64) -> Result<u32> {
    u32::try_from(v).map_err(|_| ArchiveError::InvalidDirectory(format!("{} exceeds u32", v)))
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn read_varint(bytes: &[u8], cursor: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*cursor)
            .ok_or_else(|| ArchiveError::InvalidDirectory("truncated varint".to_string()))?;
        *cursor += 1;
        if shift >= 64 {
            return Err(ArchiveError::InvalidDirectory("varint too long".to_string()));
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}
