//! Packing and reading archives end to end.

use mapterhorn_archive::{
    checksum_path, pack, summary_path, verify_checksum, ArchiveError, ArchiveReader,
    ArchiveSummary, DirectoryLayout, PackOptions, TileEncoding, TileSource,
};
use mapterhorn_archive::decode_terrarium;
use mapterhorn_archive::header::{TILE_TYPE_PNG, TILE_TYPE_WEBP};
use mapterhorn_dem::{TileCoord, TileRaster, TileStore};
use std::collections::BTreeMap;
use std::fs;
use std::io;

/// Options that copy the synthetic payloads unchanged.
fn stored(min_zoom: u8, max_zoom: u8) -> PackOptions {
    PackOptions::new(min_zoom, max_zoom).with_encoding(TileEncoding::Stored)
}

/// Every tile of zooms `0..=max_zoom`, each with distinct bytes.
fn unique_pyramid(max_zoom: u8) -> BTreeMap<TileCoord, Vec<u8>> {
    let mut tiles = BTreeMap::new();
    for z in 0..=max_zoom {
        let n = 1u32 << z;
        for x in 0..n {
            for y in 0..n {
                let coord = TileCoord::new(z, x, y);
                tiles.insert(coord, format!("tile {}", coord).into_bytes());
            }
        }
    }
    tiles
}

#[test]
fn test_dedup_and_run_length() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("planet.pmtiles");

    let mut tiles = BTreeMap::new();
    tiles.insert(TileCoord::root(), b"root".to_vec());
    for x in 0..4 {
        for y in 0..4 {
            tiles.insert(TileCoord::new(2, x, y), b"ocean".to_vec());
        }
    }
    tiles.insert(TileCoord::new(2, 2, 1), b"alps".to_vec());

    let summary = pack(&tiles, &out, &stored(0, 2)).unwrap();
    assert_eq!(summary.addressed_tiles, 17);
    assert_eq!(summary.unique_tiles, 3);
    // Runs of "ocean" are broken only by the root, the gap at zoom 1 and "alps"
    assert!(summary.tile_entries < summary.addressed_tiles);
    assert_eq!(summary.min_zoom, 0);
    assert_eq!(summary.max_zoom, 2);

    let mut reader = ArchiveReader::open(&out).unwrap();
    assert_eq!(reader.header().tile_contents, 3);
    for (coord, bytes) in &tiles {
        assert_eq!(reader.get_tile(*coord).unwrap().as_ref(), Some(bytes));
    }
    assert_eq!(reader.get_tile(TileCoord::new(1, 0, 0)).unwrap(), None);
    assert_eq!(reader.get_tile(TileCoord::new(3, 0, 0)).unwrap(), None);

    let listed = reader.tiles().unwrap();
    assert_eq!(listed.len(), 17);
}

#[test]
fn test_leaf_directories_bound_lookups() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("planet.pmtiles");
    let tiles = unique_pyramid(4);

    let mut options = stored(0, 4);
    options.layout = DirectoryLayout {
        max_root_bytes: 48,
        initial_leaf_entries: 4,
    };
    let summary = pack(&tiles, &out, &options).unwrap();
    assert!(summary.leaf_directories > 1);
    assert_eq!(summary.addressed_tiles, tiles.len() as u64);

    let mut reader = ArchiveReader::open(&out).unwrap();
    assert!(reader.header().root_length <= 48);
    assert!(reader.header().leaf_length > 0);
    assert_eq!(reader.directory_reads(), 1);

    for (coord, bytes) in &tiles {
        let before = reader.directory_reads();
        assert_eq!(reader.get_tile(*coord).unwrap().as_ref(), Some(bytes));
        // Root is cached; one leaf level below it
        assert!(reader.directory_reads() - before <= 1);
    }

    let entries = reader.entries().unwrap();
    assert_eq!(entries.len(), tiles.len());
    assert!(entries.windows(2).all(|w| w[0].tile_id < w[1].tile_id));
}

#[test]
fn test_default_layout_keeps_small_root() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("planet.pmtiles");
    let tiles = unique_pyramid(6);

    pack(&tiles, &out, &stored(0, 6)).unwrap();
    let reader = ArchiveReader::open(&out).unwrap();
    assert!(reader.header().root_offset + reader.header().root_length <= 16_384);
}

#[test]
fn test_subtree_restriction() {
    let dir = tempfile::tempdir().unwrap();
    let tiles = unique_pyramid(3);
    let root = TileCoord::new(1, 1, 0);
    let options = stored(0, 3).with_subtree(root).with_plan_version(4);
    let out = dir.path().join(format!("{}.pmtiles", options.name()));

    let summary = pack(&tiles, &out, &options).unwrap();
    assert_eq!(summary.name, "1-1-0");
    assert_eq!(summary.subtree.as_deref(), Some("1/1/0"));
    assert_eq!(summary.plan_version, Some(4));
    assert_eq!(summary.min_zoom, 1);
    assert_eq!(summary.max_zoom, 3);
    // 1 + 4 + 16 descendants
    assert_eq!(summary.addressed_tiles, 21);
    assert!(summary.bounds.min_lon >= 0.0 - 1e-9);
    assert!(summary.bounds.min_lat >= 0.0 - 1e-9);

    let mut reader = ArchiveReader::open(&out).unwrap();
    assert!(reader.get_tile(TileCoord::new(3, 7, 0)).unwrap().is_some());
    assert!(reader.get_tile(TileCoord::new(3, 0, 0)).unwrap().is_none());
    assert!(reader.get_tile(TileCoord::root()).unwrap().is_none());

    let metadata = reader.metadata().unwrap();
    assert_eq!(metadata["name"], "1-1-0");
    assert_eq!(metadata["coverage"]["plan_version"], 4);
}

#[test]
fn test_checksum_and_summary_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("planet.pmtiles");
    let summary = pack(&unique_pyramid(2), &out, &stored(0, 2)).unwrap();

    let sidecar = fs::read_to_string(checksum_path(&out)).unwrap();
    assert_eq!(sidecar, format!("{} planet.pmtiles\n", summary.sha256));
    assert!(verify_checksum(&out).unwrap());

    let on_disk: ArchiveSummary =
        serde_json::from_slice(&fs::read(summary_path(&out)).unwrap()).unwrap();
    assert_eq!(on_disk, summary);
    assert_eq!(on_disk.bytes, fs::metadata(&out).unwrap().len());

    // Any modification is detected
    let mut bytes = fs::read(&out).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&out, bytes).unwrap();
    assert!(!verify_checksum(&out).unwrap());
}

#[test]
fn test_repacking_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let tiles = unique_pyramid(3);
    let a = dir.path().join("a.pmtiles");
    let b = dir.path().join("b.pmtiles");
    pack(&tiles, &a, &stored(0, 3)).unwrap();
    pack(&tiles, &b, &stored(0, 3)).unwrap();
    assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
}

/// Source that fails on one tile.
struct FailingSource {
    tiles: BTreeMap<TileCoord, Vec<u8>>,
    broken: TileCoord,
}

impl TileSource for FailingSource {
    fn list_zoom(&self, z: u8) -> mapterhorn_archive::Result<Vec<TileCoord>> {
        self.tiles.list_zoom(z)
    }

    fn read_bytes(&self, coord: TileCoord) -> mapterhorn_archive::Result<Vec<u8>> {
        if coord == self.broken {
            return Err(ArchiveError::Io(io::Error::new(
                io::ErrorKind::Other,
                "disk on fire",
            )));
        }
        self.tiles.read_bytes(coord)
    }
}

#[test]
fn test_failed_write_keeps_previous_archive() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("planet.pmtiles");
    let tiles = unique_pyramid(2);
    pack(&tiles, &out, &stored(0, 2)).unwrap();
    let original = fs::read(&out).unwrap();

    let source = FailingSource {
        tiles: unique_pyramid(2),
        broken: TileCoord::new(2, 1, 1),
    };
    let err = pack(&source, &out, &stored(0, 2)).unwrap_err();
    match err {
        ArchiveError::WriteFailure { reason, .. } => assert!(reason.contains("disk on fire")),
        other => panic!("unexpected error {other:?}"),
    }

    assert_eq!(fs::read(&out).unwrap(), original);
    assert!(verify_checksum(&out).unwrap());
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_pack_from_tile_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = TileStore::new(dir.path().join("tiles"), 8);

    let mut raster = TileRaster::new_empty(8);
    raster.set(3, 4, Some(1234.5));
    for coord in [TileCoord::root(), TileCoord::new(1, 0, 0), TileCoord::new(1, 1, 1)] {
        store.write(coord, &raster, &serde_json::json!({})).unwrap();
    }

    let out = dir.path().join("planet.pmtiles");
    let summary = pack(&store, &out, &PackOptions::new(0, 1)).unwrap();
    assert_eq!(summary.addressed_tiles, 3);
    // Identical rasters encode to identical images
    assert_eq!(summary.unique_tiles, 1);

    let mut reader = ArchiveReader::open(&out).unwrap();
    assert_eq!(reader.header().tile_type, TILE_TYPE_WEBP);
    assert_eq!(reader.metadata().unwrap()["encoding"], "terrarium");
    let bytes = reader.get_tile(TileCoord::new(1, 1, 1)).unwrap().unwrap();
    assert_eq!(image::guess_format(&bytes).unwrap(), image::ImageFormat::WebP);
    let decoded = decode_terrarium(&bytes).unwrap();
    assert_eq!(decoded.get(3, 4), Some(1234.5));
    assert_eq!(decoded.get(0, 0), None);
}

#[test]
fn test_png_encoding() {
    let dir = tempfile::tempdir().unwrap();
    let store = TileStore::new(dir.path().join("tiles"), 8);
    let mut raster = TileRaster::new_empty(8);
    raster.set(0, 7, Some(-12.25));
    store.write(TileCoord::root(), &raster, &serde_json::json!({})).unwrap();

    let out = dir.path().join("planet.pmtiles");
    let options = PackOptions::new(0, 0).with_encoding(TileEncoding::TerrariumPng);
    pack(&store, &out, &options).unwrap();

    let mut reader = ArchiveReader::open(&out).unwrap();
    assert_eq!(reader.header().tile_type, TILE_TYPE_PNG);
    let bytes = reader.get_tile(TileCoord::root()).unwrap().unwrap();
    assert_eq!(image::guess_format(&bytes).unwrap(), image::ImageFormat::Png);
    assert_eq!(decode_terrarium(&bytes).unwrap(), raster);
}
