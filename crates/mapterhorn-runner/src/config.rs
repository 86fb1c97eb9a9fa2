//! Pipeline configuration loaded from YAML.

use crate::{Result, RunnerError};
use mapterhorn_archive::TileEncoding;
use mapterhorn_dem::TileCoord;
use mapterhorn_plan::{BlendConfig, Kernel, PlanOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything a pipeline run needs besides the plan version.
///
/// Every field has a default, so a config file only lists what it changes:
///
/// ```yaml
/// catalog: sources.yaml
/// work_dir: work
/// max_zoom: 12
/// workers: 8
/// buffer_px: 24
/// blend:
///   falloff_px: 24
///   kernel: cosine
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Source catalog (YAML).
    pub catalog: PathBuf,
    /// Root of plans, tiles, state, reports and archives.
    pub work_dir: PathBuf,
    /// Coarsest zoom produced.
    pub min_zoom: u8,
    /// Finest zoom, the one composited from sources.
    pub max_zoom: u8,
    /// Output tile edge in pixels.
    pub tile_size: u32,
    /// Resampling margin around each tile, in pixels. At least `blend.falloff_px`.
    pub buffer_px: u32,
    /// Worker threads; `0` uses one per core.
    pub workers: usize,
    /// Source rasters kept decoded in memory.
    pub raster_cache_size: usize,
    /// Seam blending for new plans. A stored plan keeps the settings it was
    /// built with.
    pub blend: BlendConfig,
    /// Units running longer than this are logged as slow.
    pub watchdog_secs: u64,
    /// Connections in the SQLite state pool.
    pub state_pool_size: usize,
    /// Archive output.
    pub archive: ArchiveConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let plan = PlanOptions::default();
        Self {
            catalog: PathBuf::from("sources.yaml"),
            work_dir: PathBuf::from("work"),
            min_zoom: plan.min_zoom,
            max_zoom: plan.max_zoom,
            tile_size: plan.tile_size,
            buffer_px: plan.buffer_px,
            workers: 0,
            raster_cache_size: 64,
            blend: BlendConfig::default(),
            watchdog_secs: 300,
            state_pool_size: 4,
            archive: ArchiveConfig::default(),
        }
    }
}

/// Where and what to pack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Output directory; defaults to `<work_dir>/archives`.
    pub output_dir: Option<PathBuf>,
    /// Pack only this tile (`z/x/y`) and its descendants.
    pub subtree: Option<String>,
    /// Attribution embedded in the archive metadata.
    pub attribution: Option<String>,
    /// `terrarium-webp` (default), `terrarium-png` or `stored`.
    pub encoding: TileEncoding,
}

/// Command-line overrides applied on top of a loaded config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub catalog: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub min_zoom: Option<u8>,
    pub max_zoom: Option<u8>,
    pub workers: Option<usize>,
    pub falloff_px: Option<f32>,
    pub kernel: Option<Kernel>,
}

impl PipelineConfig {
    /// Load and validate a YAML config. Relative paths are resolved against
    /// the config file's directory.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let mut config: PipelineConfig = serde_yaml::from_str(&text)?;
        if let Some(base) = path.parent() {
            config.catalog = resolve(base, &config.catalog);
            config.work_dir = resolve(base, &config.work_dir);
            if let Some(dir) = &config.archive.output_dir {
                config.archive.output_dir = Some(resolve(base, dir));
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides and re-validate.
    pub fn apply(&mut self, overrides: &ConfigOverrides) -> Result<()> {
        if let Some(catalog) = &overrides.catalog {
            self.catalog = catalog.clone();
        }
        if let Some(work_dir) = &overrides.work_dir {
            self.work_dir = work_dir.clone();
        }
        if let Some(z) = overrides.min_zoom {
            self.min_zoom = z;
        }
        if let Some(z) = overrides.max_zoom {
            self.max_zoom = z;
        }
        if let Some(workers) = overrides.workers {
            self.workers = workers;
        }
        if let Some(falloff) = overrides.falloff_px {
            self.blend.falloff_px = falloff;
        }
        if let Some(kernel) = overrides.kernel {
            self.blend.kernel = kernel;
        }
        self.validate()
    }

    /// Reject settings no run could succeed with.
    pub fn validate(&self) -> Result<()> {
        self.plan_options().validate()?;
        if self.raster_cache_size == 0 {
            return Err(RunnerError::InvalidConfig(
                "raster_cache_size must be at least 1".to_string(),
            ));
        }
        if self.state_pool_size == 0 {
            return Err(RunnerError::InvalidConfig(
                "state_pool_size must be at least 1".to_string(),
            ));
        }
        self.archive_subtree()?;
        Ok(())
    }

    /// Planner settings derived from this config.
    pub fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            min_zoom: self.min_zoom,
            max_zoom: self.max_zoom,
            tile_size: self.tile_size,
            buffer_px: self.buffer_px,
            blend: self.blend,
        }
    }

    /// Parsed `archive.subtree`.
    pub fn archive_subtree(&self) -> Result<Option<TileCoord>> {
        self.archive
            .subtree
            .as_deref()
            .map(|s| {
                s.parse::<TileCoord>().map_err(|e| {
                    RunnerError::InvalidConfig(format!("archive.subtree {:?}: {}", s, e))
                })
            })
            .transpose()
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }

    pub fn plans_dir(&self) -> PathBuf {
        self.work_dir.join("plans")
    }

    /// Tiles of one plan version.
    pub fn tiles_dir(&self, version: u64) -> PathBuf {
        self.work_dir.join("tiles").join(version.to_string())
    }

    pub fn state_path(&self) -> PathBuf {
        self.work_dir.join("state.db")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.work_dir.join("reports")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.archive
            .output_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("archives"))
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: PipelineConfig = serde_yaml::from_str("max_zoom: 9\nworkers: 3\n").unwrap();
        assert_eq!(config.max_zoom, 9);
        assert_eq!(config.workers, 3);
        assert_eq!(config.tile_size, 512);
        assert_eq!(config.blend.kernel, Kernel::Smoothstep);
        assert_eq!(config.blend.falloff_px, 16.0);
        config.validate().unwrap();
    }

    #[test]
    fn test_relative_paths_resolved_against_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        fs::write(
            &path,
            "catalog: sources.yaml\nwork_dir: out\narchive:\n  subtree: 6/33/22\n  encoding: terrarium-png\n",
        )
        .unwrap();

        let config = PipelineConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.catalog, dir.path().join("sources.yaml"));
        assert_eq!(config.tiles_dir(4), dir.path().join("out/tiles/4"));
        assert_eq!(config.archive_dir(), dir.path().join("out/archives"));
        assert_eq!(config.archive.encoding, TileEncoding::TerrariumPng);
        assert_eq!(
            PipelineConfig::default().archive.encoding,
            TileEncoding::TerrariumWebp
        );
        assert_eq!(
            config.archive_subtree().unwrap(),
            Some(TileCoord::new(6, 33, 22))
        );
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut config = PipelineConfig::default();
        config.blend.falloff_px = 0.0;
        assert!(config.validate().is_err());

        // Wider than the buffer: adjacent tiles would disagree at the border
        let mut config = PipelineConfig::default();
        config.blend.falloff_px = 24.0;
        assert!(config.validate().is_err());
        config.buffer_px = 24;
        config.validate().unwrap();

        let mut config = PipelineConfig::default();
        config.tile_size = 500;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.min_zoom = 10;
        config.max_zoom = 5;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.archive.subtree = Some("not/a/tile".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = PipelineConfig::default();
        config
            .apply(&ConfigOverrides {
                max_zoom: Some(8),
                kernel: Some(Kernel::Cosine),
                falloff_px: Some(4.0),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(config.max_zoom, 8);
        assert_eq!(config.blend.kernel, Kernel::Cosine);
        assert_eq!(config.blend.falloff_px, 4.0);

        let bad = ConfigOverrides {
            min_zoom: Some(20),
            ..Default::default()
        };
        assert!(config.apply(&bad).is_err());
    }
}
