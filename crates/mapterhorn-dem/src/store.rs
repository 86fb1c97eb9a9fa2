//! On-disk tile store laid out as `<root>/<z>/<x>/<y>.tif`.

use crate::{Result, TileCoord, TileRaster};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Directory of output tiles with one provenance sidecar per tile.
///
/// Every write replaces the tile wholesale and is crash safe: a reader
/// either sees the previous file or the complete new one.
#[derive(Debug, Clone)]
pub struct TileStore {
    root: PathBuf,
    tile_size: u32,
}

impl TileStore {
    /// Open (or lazily create) a store rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P, tile_size: u32) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            tile_size,
        }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Edge length of the tiles in this store.
    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Path of the raster for `coord`.
    pub fn path_for(&self, coord: TileCoord) -> PathBuf {
        self.root
            .join(coord.z.to_string())
            .join(coord.x.to_string())
            .join(format!("{}.tif", coord.y))
    }

    /// Path of the provenance sidecar for `coord`.
    pub fn sidecar_path_for(&self, coord: TileCoord) -> PathBuf {
        self.path_for(coord).with_extension("json")
    }

    /// Write a tile and its provenance.
    ///
    /// The sidecar goes first so a tile on disk always has matching provenance.
    pub fn write<P: Serialize>(
        &self,
        coord: TileCoord,
        raster: &TileRaster,
        provenance: &P,
    ) -> Result<()> {
        let bytes = raster.encode(&coord.mercator_bounds())?;
        let sidecar = serde_json::to_vec_pretty(provenance)?;
        write_atomic(&self.sidecar_path_for(coord), &sidecar)?;
        write_atomic(&self.path_for(coord), &bytes)?;
        trace!(tile = %coord, bytes = bytes.len(), "tile written");
        Ok(())
    }

    /// Read and decode the raster for `coord`.
    pub fn read(&self, coord: TileCoord) -> Result<TileRaster> {
        let bytes = fs::read(self.path_for(coord))?;
        TileRaster::decode(&bytes, self.tile_size)
    }

    /// Read the encoded bytes of a tile without decoding.
    pub fn read_bytes(&self, coord: TileCoord) -> Result<Vec<u8>> {
        Ok(fs::read(self.path_for(coord))?)
    }

    /// Read the provenance sidecar for `coord`.
    pub fn read_provenance<P: DeserializeOwned>(&self, coord: TileCoord) -> Result<P> {
        let bytes = fs::read(self.sidecar_path_for(coord))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Check whether a tile has been written.
    pub fn exists(&self, coord: TileCoord) -> bool {
        self.path_for(coord).is_file()
    }

    /// Every tile present at zoom `z`, sorted.
    pub fn list_zoom(&self, z: u8) -> Result<Vec<TileCoord>> {
        let zoom_dir = self.root.join(z.to_string());
        if !zoom_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut tiles = Vec::new();
        for x_entry in fs::read_dir(&zoom_dir)? {
            let x_entry = x_entry?;
            let Some(x) = parse_stem(&x_entry.path(), None) else {
                continue;
            };
            for y_entry in fs::read_dir(x_entry.path())? {
                let y_entry = y_entry?;
                let Some(y) = parse_stem(&y_entry.path(), Some("tif")) else {
                    continue;
                };
                if let Ok(coord) = TileCoord::try_new(z, x, y) {
                    tiles.push(coord);
                }
            }
        }
        tiles.sort();
        Ok(tiles)
    }

    /// Remove the whole store from disk.
    pub fn remove_all(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}

/// Parse a numeric file or directory name, optionally requiring an extension.
fn parse_stem(path: &Path, extension: Option<&str>) -> Option<u32> {
    match extension {
        Some(ext) => {
            if path.extension()? != ext {
                return None;
            }
            path.file_stem()?.to_str()?.parse().ok()
        }
        None => path.file_name()?.to_str()?.parse().ok(),
    }
}

/// Write `bytes` to `path` via a temporary file, fsync and rename.
///
/// The parent directory is created if needed and synced after the rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    sync_dir(parent)?;
    Ok(())
}

/// Flush a directory entry to disk after a rename. No-op off unix.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        sources: Vec<String>,
    }

    #[test]
    fn test_path_layout() {
        let store = TileStore::new("/work/tiles/1", 512);
        assert_eq!(
            store.path_for(TileCoord::new(5, 3, 7)),
            PathBuf::from("/work/tiles/1/5/3/7.tif")
        );
        assert_eq!(
            store.sidecar_path_for(TileCoord::new(5, 3, 7)),
            PathBuf::from("/work/tiles/1/5/3/7.json")
        );
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path(), 4);
        let coord = TileCoord::new(2, 1, 3);
        let mut raster = TileRaster::new_empty(4);
        raster.set(0, 0, Some(42.0));
        let note = Note {
            sources: vec!["alps".to_string()],
        };

        assert!(!store.exists(coord));
        store.write(coord, &raster, &note).unwrap();
        assert!(store.exists(coord));
        assert_eq!(store.read(coord).unwrap(), raster);
        assert_eq!(store.read_provenance::<Note>(coord).unwrap(), note);

        // No temporary files left behind
        let leftovers: Vec<_> = fs::read_dir(store.path_for(coord).parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_list_zoom_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path(), 2);
        let raster = TileRaster::new_empty(2);
        let note = Note { sources: vec![] };
        for (x, y) in [(3, 1), (0, 2), (3, 0)] {
            store.write(TileCoord::new(2, x, y), &raster, &note).unwrap();
        }
        store.write(TileCoord::new(1, 0, 0), &raster, &note).unwrap();

        let tiles = store.list_zoom(2).unwrap();
        assert_eq!(
            tiles,
            vec![
                TileCoord::new(2, 0, 2),
                TileCoord::new(2, 3, 0),
                TileCoord::new(2, 3, 1),
            ]
        );
        assert!(store.list_zoom(7).unwrap().is_empty());
    }

    #[test]
    fn test_overwrite_replaces_tile() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path(), 2);
        let coord = TileCoord::new(0, 0, 0);
        let note = Note { sources: vec![] };

        store.write(coord, &TileRaster::new_empty(2), &note).unwrap();
        let full = TileRaster::from_data(2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        store.write(coord, &full, &note).unwrap();
        assert_eq!(store.read(coord).unwrap(), full);
    }
}
