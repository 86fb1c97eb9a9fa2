//! Shared cache of loaded source rasters.

use crate::{Result, SourceRaster};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Default maximum number of rasters to keep loaded.
const DEFAULT_MAX_CACHE_SIZE: usize = 32;

/// Thread-safe LRU cache of [`SourceRaster`]s keyed by file path.
///
/// Rasters are loaded on first use and handed out as `Arc`s, so compositing
/// workers share one read-only copy of each file. Eviction only drops the
/// cache's reference; rasters still held by a worker stay alive until it
/// finishes.
///
/// # Example
///
/// ```no_run
/// use mapterhorn_dem::RasterCache;
///
/// let cache = RasterCache::new();
/// let raster = cache.get_or_load("sources/alps/dem_001.tif")?;
/// println!("{:?}", raster.bounds());
/// # Ok::<(), mapterhorn_dem::DemError>(())
/// ```
#[derive(Debug)]
pub struct RasterCache {
    inner: Mutex<LruRasters>,
    max_cache_size: usize,
}

/// LRU bookkeeping for loaded rasters.
#[derive(Debug, Default)]
struct LruRasters {
    rasters: HashMap<PathBuf, Arc<SourceRaster>>,
    /// Access order for LRU eviction (most recently used at the back).
    access_order: Vec<PathBuf>,
}

impl LruRasters {
    fn get(&mut self, path: &Path) -> Option<Arc<SourceRaster>> {
        let raster = self.rasters.get(path)?.clone();
        self.touch(path);
        Some(raster)
    }

    /// Move a key to the back of the access order.
    fn touch(&mut self, path: &Path) {
        if let Some(pos) = self.access_order.iter().position(|p| p == path) {
            let key = self.access_order.remove(pos);
            self.access_order.push(key);
        }
    }

    fn insert(&mut self, path: PathBuf, raster: Arc<SourceRaster>, max_size: usize) {
        if self.rasters.contains_key(&path) {
            self.touch(&path);
            return;
        }
        while self.rasters.len() >= max_size.max(1) && !self.access_order.is_empty() {
            let oldest = self.access_order.remove(0);
            self.rasters.remove(&oldest);
        }
        self.access_order.push(path.clone());
        self.rasters.insert(path, raster);
    }
}

impl Default for RasterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RasterCache {
    /// Create a cache with the default capacity.
    pub fn new() -> Self {
        Self::with_cache_size(DEFAULT_MAX_CACHE_SIZE)
    }

    /// Create a cache holding at most `max_cache_size` rasters.
    pub fn with_cache_size(max_cache_size: usize) -> Self {
        Self {
            inner: Mutex::new(LruRasters::default()),
            max_cache_size,
        }
    }

    /// Return the raster for `path`, loading it if it is not cached.
    ///
    /// The file is decoded outside the lock; two workers racing on the same
    /// path may both decode it, and the first insert wins.
    pub fn get_or_load<P: AsRef<Path>>(&self, path: P) -> Result<Arc<SourceRaster>> {
        let path = path.as_ref();
        if let Some(raster) = self.inner.lock().get(path) {
            return Ok(raster);
        }

        debug!(path = %path.display(), "loading source raster");
        let raster = Arc::new(SourceRaster::from_file(path)?);

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.get(path) {
            return Ok(existing);
        }
        inner.insert(path.to_path_buf(), raster.clone(), self.max_cache_size);
        Ok(raster)
    }

    /// Check whether `path` is currently loaded.
    pub fn is_loaded<P: AsRef<Path>>(&self, path: P) -> bool {
        self.inner.lock().rasters.contains_key(path.as_ref())
    }

    /// Number of rasters currently loaded.
    pub fn loaded_count(&self) -> usize {
        self.inner.lock().rasters.len()
    }

    /// Drop every cached raster.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.rasters.clear();
        inner.access_order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{write_geotiff, MercatorBounds};

    fn write_fixture(dir: &Path, name: &str, value: f32) -> PathBuf {
        let path = dir.join(name);
        write_geotiff(
            &path,
            &[value; 4],
            2,
            2,
            MercatorBounds::new(0.0, 0.0, 2.0, 2.0),
            None,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_get_or_load_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "a.tif", 5.0);
        let cache = RasterCache::new();

        assert!(!cache.is_loaded(&path));
        let first = cache.get_or_load(&path).unwrap();
        assert!(cache.is_loaded(&path));
        let second = cache.get_or_load(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.pixel(0, 0), Some(5.0));
    }

    #[test]
    fn test_lru_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_fixture(dir.path(), "a.tif", 1.0);
        let b = write_fixture(dir.path(), "b.tif", 2.0);
        let c = write_fixture(dir.path(), "c.tif", 3.0);
        let cache = RasterCache::with_cache_size(2);

        cache.get_or_load(&a).unwrap();
        cache.get_or_load(&b).unwrap();
        // Touch a so b becomes the oldest
        cache.get_or_load(&a).unwrap();
        cache.get_or_load(&c).unwrap();

        assert_eq!(cache.loaded_count(), 2);
        assert!(cache.is_loaded(&a));
        assert!(!cache.is_loaded(&b));
        assert!(cache.is_loaded(&c));
    }

    #[test]
    fn test_missing_file_is_error() {
        let cache = RasterCache::new();
        assert!(cache.get_or_load("/nonexistent/raster.tif").is_err());
        assert_eq!(cache.loaded_count(), 0);
    }
}
