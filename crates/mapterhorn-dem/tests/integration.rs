//! Integration tests for mapterhorn-dem with synthetic GeoTIFF files.

use approx::assert_relative_eq;
use mapterhorn_dem::{
    pixel_size, write_geotiff, MercatorBounds, RasterCache, SourceRaster, TileCoord, TileRaster,
    TileStore,
};
use std::path::Path;

/// Write a planar ramp `z = x_metres / 1000` covering `bounds`.
fn write_ramp(path: &Path, bounds: MercatorBounds, size: u32) {
    let res = bounds.width() / size as f64;
    let mut data = Vec::with_capacity((size * size) as usize);
    for _row in 0..size {
        for col in 0..size {
            let x = bounds.min_x + (col as f64 + 0.5) * res;
            data.push((x / 1000.0) as f32);
        }
    }
    write_geotiff(path, &data, size, size, bounds, Some(-32768.0)).expect("write fixture");
}

#[test]
fn test_load_synthetic_geotiff() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ramp.tif");
    let bounds = TileCoord::new(4, 8, 5).mercator_bounds();
    write_ramp(&path, bounds, 64);

    let raster = SourceRaster::from_file(&path).expect("load");
    assert_eq!(raster.dimensions(), (64, 64));
    assert_eq!(raster.no_data_value(), Some(-32768.0));
    assert_relative_eq!(raster.bounds().min_x, bounds.min_x, epsilon = 1e-6);
    assert_relative_eq!(raster.bounds().max_y, bounds.max_y, epsilon = 1e-6);

    let header_only = SourceRaster::read_bounds(&path).expect("bounds");
    assert_relative_eq!(header_only.max_x, bounds.max_x, epsilon = 1e-6);

    // A planar ramp is reproduced exactly by bilinear sampling
    let x = bounds.min_x + bounds.width() * 0.37;
    let y = bounds.min_y + bounds.height() * 0.61;
    let value = raster.sample_bilinear(x, y).expect("inside");
    assert_relative_eq!(value as f64, x / 1000.0, epsilon = 0.05);
}

#[test]
fn test_resample_into_tile_and_store() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("source.tif");
    let parent = TileCoord::new(6, 33, 22);
    write_ramp(&source_path, parent.mercator_bounds(), 128);

    let cache = RasterCache::new();
    let source = cache.get_or_load(&source_path).unwrap();

    let tile_size = 32;
    let tile = parent.children()[3];
    let bounds = tile.mercator_bounds();
    let px = pixel_size(tile.z, tile_size);
    assert_relative_eq!(px, bounds.width() / tile_size as f64, epsilon = 1e-6);

    let mut raster = TileRaster::new_empty(tile_size);
    for row in 0..tile_size {
        for col in 0..tile_size {
            let x = bounds.min_x + (col as f64 + 0.5) * px;
            let y = bounds.max_y - (row as f64 + 0.5) * px;
            raster.set(col, row, source.sample_bilinear(x, y));
        }
    }
    assert_eq!(raster.valid_count(), (tile_size * tile_size) as usize);

    let store = TileStore::new(dir.path().join("tiles"), tile_size);
    store
        .write(tile, &raster, &serde_json::json!({ "sources": ["ramp"] }))
        .unwrap();
    let back = store.read(tile).unwrap();
    assert_eq!(back, raster);

    // Written tiles are themselves valid GeoTIFFs with the tile's extent
    let reopened = SourceRaster::from_file(store.path_for(tile)).unwrap();
    assert_relative_eq!(reopened.bounds().min_x, bounds.min_x, epsilon = 1e-6);
    assert_eq!(reopened.no_data_value(), Some(TileRaster::NODATA));
    assert_eq!(store.list_zoom(tile.z).unwrap(), vec![tile]);
}

#[test]
fn test_nodata_region_stays_nodata() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("holes.tif");
    let bounds = MercatorBounds::new(0.0, 0.0, 100.0, 100.0);
    // Left half valid, right half no-data
    let mut data = vec![0.0f32; 100];
    for row in 0..10 {
        for col in 0..10 {
            data[row * 10 + col] = if col < 5 { 250.0 } else { -9999.0 };
        }
    }
    write_geotiff(&path, &data, 10, 10, bounds, Some(-9999.0)).unwrap();
    let raster = SourceRaster::from_file(&path).unwrap();

    assert_eq!(raster.sample_bilinear(20.0, 50.0), Some(250.0));
    assert_eq!(raster.sample_bilinear(80.0, 50.0), None);
    // Near the seam no sample mixes the sentinel into the value
    for i in 0..20 {
        let x = 40.0 + i as f64;
        if let Some(v) = raster.sample_bilinear(x, 50.0) {
            assert_eq!(v, 250.0);
        }
    }
}
