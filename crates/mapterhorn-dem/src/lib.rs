//! # mapterhorn-dem
//!
//! Tile grid, elevation rasters and GeoTIFF I/O for the mapterhorn
//! aggregation engine.
//!
//! ## Overview
//!
//! ### Tile grid
//!
//! Output tiles follow the XYZ (slippy map) quad-tree in Web Mercator
//! (EPSG:3857). Tile `(z, x, y)` covers exactly its four children at `z + 1`,
//! with `y` growing southward. [`TileCoord`] provides parent/children
//! navigation, Mercator and lon/lat bounds, and the stable `"z/x/y"` id that
//! the state tracker and plans use as a unit-of-work key.
//!
//! ### Source rasters
//!
//! Sources are single-band GeoTIFFs already reprojected to EPSG:3857.
//! [`SourceRaster`] reads the ModelTiepoint / ModelPixelScale tags for the
//! extent and the GDAL_NODATA tag for the no-data value. Sampling never
//! averages no-data with valid data.
//!
//! ### Output tiles
//!
//! A [`TileRaster`] is a square Float32 grid with the sentinel
//! [`TileRaster::NODATA`]. The [`TileStore`] writes them as
//! `<root>/<z>/<x>/<y>.tif` next to a JSON provenance sidecar, using
//! write → fsync → rename so partial files are never visible.
//!
//! ## Example
//!
//! ```no_run
//! use mapterhorn_dem::{RasterCache, TileCoord, TileRaster, TileStore};
//!
//! let cache = RasterCache::new();
//! let source = cache.get_or_load("sources/alps/dem_001.tif")?;
//!
//! let tile = TileCoord::from_lat_lon(46.5, 8.0, 12)?;
//! let bounds = tile.mercator_bounds();
//! let mut raster = TileRaster::new_empty(512);
//! let px = bounds.width() / 512.0;
//! for row in 0..512 {
//!     for col in 0..512 {
//!         let x = bounds.min_x + (col as f64 + 0.5) * px;
//!         let y = bounds.max_y - (row as f64 + 0.5) * px;
//!         raster.set(col, row, source.sample_bilinear(x, y));
//!     }
//! }
//!
//! let store = TileStore::new("work/tiles/1", 512);
//! store.write(tile, &raster, &serde_json::json!({ "sources": ["alps"] }))?;
//! # Ok::<(), mapterhorn_dem::DemError>(())
//! ```

mod coord;
mod error;
mod manager;
mod raster;
mod source_raster;
mod store;

pub use coord::{
    lon_lat_to_mercator, mercator_to_lon_lat, pixel_size, tile_range, MercatorBounds, TileBounds,
    TileCoord, MAX_ZOOM, MERCATOR_HALF_EXTENT,
};
pub use error::DemError;
pub use manager::RasterCache;
pub use raster::TileRaster;
pub use source_raster::{write_geotiff, SourceRaster};
pub use store::{sync_dir, write_atomic, TileStore};

/// Result type for DEM operations.
pub type Result<T> = std::result::Result<T, DemError>;
