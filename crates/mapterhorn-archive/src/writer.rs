//! Packing a tile set into a sealed archive.

use crate::directory::{build_directories, DirectoryLayout, Entry, HEADER_LEN};
use crate::encoding::TileEncoding;
use crate::header::{Header, COMPRESSION_NONE};
use crate::summary::ArchiveSummary;
use crate::tile_id::tile_id;
use crate::{ArchiveError, Result};
use chrono::Utc;
use mapterhorn_dem::{sync_dir, write_atomic, TileBounds, TileCoord, TileStore, MAX_ZOOM};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default attribution embedded in archive metadata.
pub const DEFAULT_ATTRIBUTION: &str =
    "<a href=\"https://mapterhorn.com/attribution\">© Mapterhorn</a>";

/// Anything tiles can be packed from.
pub trait TileSource {
    /// Every tile present at zoom `z`.
    fn list_zoom(&self, z: u8) -> Result<Vec<TileCoord>>;

    /// Encoded bytes of one tile.
    fn read_bytes(&self, coord: TileCoord) -> Result<Vec<u8>>;
}

impl TileSource for TileStore {
    fn list_zoom(&self, z: u8) -> Result<Vec<TileCoord>> {
        Ok(TileStore::list_zoom(self, z)?)
    }

    fn read_bytes(&self, coord: TileCoord) -> Result<Vec<u8>> {
        Ok(TileStore::read_bytes(self, coord)?)
    }
}

impl TileSource for BTreeMap<TileCoord, Vec<u8>> {
    fn list_zoom(&self, z: u8) -> Result<Vec<TileCoord>> {
        Ok(self.keys().filter(|c| c.z == z).copied().collect())
    }

    fn read_bytes(&self, coord: TileCoord) -> Result<Vec<u8>> {
        self.get(&coord).cloned().ok_or_else(|| {
            ArchiveError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("tile {} missing", coord),
            ))
        })
    }
}

/// Options for [`pack`].
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Coarsest zoom to include.
    pub min_zoom: u8,
    /// Finest zoom to include.
    pub max_zoom: u8,
    /// Only pack this tile and its descendants.
    pub subtree: Option<TileCoord>,
    /// Plan version recorded in metadata and the summary.
    pub plan_version: Option<u64>,
    /// Attribution string for the metadata.
    pub attribution: String,
    /// Additional metadata keys.
    pub extra_metadata: Map<String, Value>,
    /// Root/leaf directory split.
    pub layout: DirectoryLayout,
    /// Payload encoding of the packed tiles.
    pub encoding: TileEncoding,
}

impl PackOptions {
    /// Pack zooms `min_zoom..=max_zoom` of the whole world.
    pub fn new(min_zoom: u8, max_zoom: u8) -> Self {
        Self {
            min_zoom,
            max_zoom,
            subtree: None,
            plan_version: None,
            attribution: DEFAULT_ATTRIBUTION.to_string(),
            extra_metadata: Map::new(),
            layout: DirectoryLayout::default(),
            encoding: TileEncoding::default(),
        }
    }

    /// Restrict packing to `root` and its descendants.
    pub fn with_subtree(mut self, root: TileCoord) -> Self {
        self.subtree = Some(root);
        self
    }

    /// Record the plan version the tiles came from.
    pub fn with_plan_version(mut self, version: u64) -> Self {
        self.plan_version = Some(version);
        self
    }

    /// Payload encoding of the packed tiles.
    pub fn with_encoding(mut self, encoding: TileEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Bundle name: `planet` for the whole world, `z-x-y` for a subtree.
    pub fn name(&self) -> String {
        match self.subtree {
            Some(root) if root != TileCoord::root() => {
                format!("{}-{}-{}", root.z, root.x, root.y)
            }
            _ => "planet".to_string(),
        }
    }

    fn includes(&self, coord: &TileCoord) -> bool {
        self.subtree.map_or(true, |root| root.contains(coord))
    }
}

impl Default for PackOptions {
    fn default() -> Self {
        Self::new(0, MAX_ZOOM)
    }
}

/// Path of the checksum sidecar of an archive.
pub fn checksum_path(archive: &Path) -> PathBuf {
    with_suffix(archive, ".sha256")
}

/// Path of the coverage summary of an archive.
pub fn summary_path(archive: &Path) -> PathBuf {
    with_suffix(archive, ".summary.json")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Pack every tile of `source` selected by `options` into `out`.
///
/// The archive is assembled in `<out>.partial`, synced and renamed over
/// `out`, so an existing archive at `out` is replaced only by a complete
/// new one. Any failure is reported as [`ArchiveError::WriteFailure`] and
/// leaves no partial files behind.
pub fn pack<S: TileSource + ?Sized>(
    source: &S,
    out: &Path,
    options: &PackOptions,
) -> Result<ArchiveSummary> {
    let partial = with_suffix(out, ".partial");
    let data_tmp = with_suffix(out, ".data.partial");

    let result = pack_inner(source, out, &partial, &data_tmp, options);
    let _ = fs::remove_file(&data_tmp);

    match result {
        Ok(summary) => Ok(summary),
        Err(ArchiveError::NoTiles) => Err(ArchiveError::NoTiles),
        Err(e) => {
            let _ = fs::remove_file(&partial);
            warn!(archive = %out.display(), error = %e, "archive write failed");
            Err(ArchiveError::WriteFailure {
                path: out.display().to_string(),
                reason: e.to_string(),
            })
        }
    }
}

struct PackedTiles {
    entries: Vec<Entry>,
    addressed: u64,
    contents: u64,
    data_length: u64,
    min_zoom: u8,
    max_zoom: u8,
    bounds: TileBounds,
}

fn pack_inner<S: TileSource + ?Sized>(
    source: &S,
    out: &Path,
    partial: &Path,
    data_tmp: &Path,
    options: &PackOptions,
) -> Result<ArchiveSummary> {
    let mut tiles = Vec::new();
    for z in options.min_zoom..=options.max_zoom.min(MAX_ZOOM) {
        for coord in source.list_zoom(z)? {
            if options.includes(&coord) {
                tiles.push((tile_id(coord), coord));
            }
        }
    }
    if tiles.is_empty() {
        return Err(ArchiveError::NoTiles);
    }
    tiles.sort_unstable();
    info!(archive = %out.display(), tiles = tiles.len(), "packing archive");

    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }

    let packed = write_tile_data(source, &tiles, data_tmp, options.encoding)?;
    let dirs = build_directories(&packed.entries, &options.layout);

    let name = options.name();
    let metadata = build_metadata(&name, &packed, options);
    let metadata = serde_json::to_vec(&metadata)?;

    let root_offset = HEADER_LEN as u64;
    let metadata_offset = root_offset + dirs.root.len() as u64;
    let leaf_offset = metadata_offset + metadata.len() as u64;
    let data_offset = leaf_offset + dirs.leaves.len() as u64;

    let center_lon = (packed.bounds.min_lon + packed.bounds.max_lon) / 2.0;
    let center_lat = (packed.bounds.min_lat + packed.bounds.max_lat) / 2.0;
    let header = Header {
        root_offset,
        root_length: dirs.root.len() as u64,
        metadata_offset,
        metadata_length: metadata.len() as u64,
        leaf_offset,
        leaf_length: dirs.leaves.len() as u64,
        data_offset,
        data_length: packed.data_length,
        addressed_tiles: packed.addressed,
        tile_entries: packed.entries.len() as u64,
        tile_contents: packed.contents,
        clustered: true,
        internal_compression: COMPRESSION_NONE,
        tile_compression: COMPRESSION_NONE,
        tile_type: options.encoding.tile_type(),
        min_zoom: packed.min_zoom,
        max_zoom: packed.max_zoom,
        bounds: packed.bounds,
        center_zoom: (packed.min_zoom + packed.max_zoom) / 2,
        center_lon,
        center_lat,
    };

    let mut writer = BufWriter::new(HashingWriter::new(File::create(partial)?));
    writer.write_all(&header.to_bytes())?;
    writer.write_all(&dirs.root)?;
    writer.write_all(&metadata)?;
    writer.write_all(&dirs.leaves)?;
    io::copy(&mut File::open(data_tmp)?, &mut writer)?;
    let hashing = writer.into_inner().map_err(|e| e.into_error())?;
    let (file, bytes, digest) = hashing.finish();
    file.sync_all()?;
    drop(file);

    fs::rename(partial, out)?;
    let parent = out.parent().unwrap_or_else(|| Path::new("."));
    sync_dir(parent)?;

    let file_name = out
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sha256 = hex::encode(digest);
    write_atomic(
        &checksum_path(out),
        format!("{} {}\n", sha256, file_name).as_bytes(),
    )?;

    let summary = ArchiveSummary {
        archive: file_name,
        name,
        plan_version: options.plan_version,
        subtree: options.subtree.map(|c| c.id()),
        min_zoom: packed.min_zoom,
        max_zoom: packed.max_zoom,
        bounds: packed.bounds,
        addressed_tiles: packed.addressed,
        tile_entries: packed.entries.len() as u64,
        unique_tiles: packed.contents,
        leaf_directories: dirs.leaf_count as u64,
        bytes,
        sha256,
        created_at: Utc::now(),
    };
    let mut json = serde_json::to_vec_pretty(&summary)?;
    json.push(b'\n');
    write_atomic(&summary_path(out), &json)?;

    info!(
        archive = %out.display(),
        bytes,
        addressed = packed.addressed,
        unique = packed.contents,
        leaves = dirs.leaf_count,
        "archive sealed"
    );
    Ok(summary)
}

/// Stream tile payloads in tile id order, deduplicating identical bytes and
/// merging consecutive repeats into runs.
fn write_tile_data<S: TileSource + ?Sized>(
    source: &S,
    tiles: &[(u64, TileCoord)],
    data_tmp: &Path,
    encoding: TileEncoding,
) -> Result<PackedTiles> {
    let mut data = BufWriter::new(File::create(data_tmp)?);
    let mut seen: HashMap<[u8; 32], (u64, u32)> = HashMap::new();
    let mut entries: Vec<Entry> = Vec::new();
    let mut data_length = 0u64;

    let min_zoom = tiles.iter().map(|(_, c)| c.z).min().unwrap_or(0);
    let max_zoom = tiles.iter().map(|(_, c)| c.z).max().unwrap_or(0);
    let mut bounds: Option<TileBounds> = None;

    for (i, &(id, coord)) in tiles.iter().enumerate() {
        let bytes = encoding.encode(source.read_bytes(coord)?)?;
        let length = u32::try_from(bytes.len())
            .map_err(|_| ArchiveError::TileTooLarge(coord.id()))?;
        let digest: [u8; 32] = Sha256::digest(&bytes).into();

        let offset = match seen.get(&digest) {
            Some(&(offset, _)) => offset,
            None => {
                data.write_all(&bytes)?;
                let offset = data_length;
                seen.insert(digest, (offset, length));
                data_length += length as u64;
                offset
            }
        };

        match entries.last_mut() {
            Some(last)
                if last.offset == offset
                    && last.length == length
                    && last.tile_id + last.run_length as u64 == id =>
            {
                last.run_length += 1;
            }
            _ => entries.push(Entry {
                tile_id: id,
                offset,
                length,
                run_length: 1,
            }),
        }

        if coord.z == max_zoom {
            let b = coord.bounds();
            bounds = Some(bounds.map_or(b, |acc| acc.union(&b)));
        }
        if (i + 1) % 10_000 == 0 {
            debug!(done = i + 1, total = tiles.len(), "tiles packed");
        }
    }

    let file = data.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(PackedTiles {
        entries,
        addressed: tiles.len() as u64,
        contents: seen.len() as u64,
        data_length,
        min_zoom,
        max_zoom,
        bounds: bounds.ok_or(ArchiveError::NoTiles)?,
    })
}

fn build_metadata(name: &str, packed: &PackedTiles, options: &PackOptions) -> Value {
    let mut metadata = options.extra_metadata.clone();
    metadata.insert("name".to_string(), json!(name));
    metadata.insert("attribution".to_string(), json!(options.attribution));
    metadata.insert("encoding".to_string(), json!(options.encoding.metadata_name()));
    metadata.insert("minzoom".to_string(), json!(packed.min_zoom));
    metadata.insert("maxzoom".to_string(), json!(packed.max_zoom));
    metadata.insert(
        "coverage".to_string(),
        json!({
            "bounds": [
                packed.bounds.min_lon,
                packed.bounds.min_lat,
                packed.bounds.max_lon,
                packed.bounds.max_lat,
            ],
            "addressed_tiles": packed.addressed,
            "unique_tiles": packed.contents,
            "plan_version": options.plan_version,
            "subtree": options.subtree.map(|c| c.id()),
        }),
    );
    Value::Object(metadata)
}

/// Writer that hashes everything passing through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (W, u64, [u8; 32]) {
        (self.inner, self.bytes, self.hasher.finalize().into())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_names() {
        assert_eq!(PackOptions::new(0, 5).name(), "planet");
        assert_eq!(
            PackOptions::new(0, 5)
                .with_subtree(TileCoord::new(6, 33, 22))
                .name(),
            "6-33-22"
        );
        assert_eq!(
            PackOptions::new(0, 5).with_subtree(TileCoord::root()).name(),
            "planet"
        );
    }

    #[test]
    fn test_sidecar_paths() {
        let out = Path::new("/out/planet.pmtiles");
        assert_eq!(checksum_path(out), PathBuf::from("/out/planet.pmtiles.sha256"));
        assert_eq!(
            summary_path(out),
            PathBuf::from("/out/planet.pmtiles.summary.json")
        );
    }

    #[test]
    fn test_hashing_writer_matches_digest() {
        let mut w = HashingWriter::new(Vec::new());
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        let (inner, bytes, digest) = w.finish();
        assert_eq!(inner, b"hello world");
        assert_eq!(bytes, 11);
        assert_eq!(digest.to_vec(), Sha256::digest(b"hello world").to_vec());
    }

    #[test]
    fn test_empty_source_is_no_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let source: BTreeMap<TileCoord, Vec<u8>> = BTreeMap::new();
        let result = pack(&source, &dir.path().join("a.pmtiles"), &PackOptions::new(0, 3));
        assert!(matches!(result, Err(ArchiveError::NoTiles)));
    }
}
