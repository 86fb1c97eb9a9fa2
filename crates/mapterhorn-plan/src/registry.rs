//! Source registry loaded from a YAML catalog.
//!
//! A catalog lists every source with its resolution, CRS and files:
//!
//! ```yaml
//! sources:
//!   - id: swissalti3d
//!     resolution: 0.5
//!     crs: EPSG:3857
//!     files:
//!       - path: swissalti3d/2600_1200.tif
//!         bounds: [960000.0, 5870000.0, 962000.0, 5872000.0]
//!       - path: swissalti3d/2601_1200.tif   # bounds read from the GeoTIFF
//!   - id: glo30
//!     resolution: 30
//!     bounds_csv: glo30/bounds.csv
//!     coverage:
//!       - [[0.0, 0.0], [1000.0, 0.0], [1000.0, 1000.0], [0.0, 1000.0]]
//! ```
//!
//! Relative paths are resolved against the catalog's directory.

use crate::{PlanError, Result};
use mapterhorn_dem::{MercatorBounds, SourceRaster};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The only CRS sources may be registered in.
pub const SUPPORTED_CRS: &str = "EPSG:3857";

/// One raster file of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Path to the GeoTIFF.
    pub path: PathBuf,
    /// Footprint in EPSG:3857 metres.
    pub bounds: MercatorBounds,
}

/// An elevation data source.
///
/// Sources are immutable once registered. Priority is derived from
/// resolution: a finer (smaller) resolution outranks a coarser one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Unique identifier.
    pub id: String,
    /// Ground sample distance in metres per pixel.
    pub resolution: f64,
    /// Coordinate reference system, always `EPSG:3857` after validation.
    pub crs: String,
    /// Explicit coverage polygons (exterior rings, EPSG:3857). When absent
    /// the coverage is the union of the file footprints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<Vec<Vec<[f64; 2]>>>,
    /// Raster files, sorted by path.
    pub files: Vec<SourceFile>,
}

impl Source {
    /// Create a source from files, sorting them by path.
    pub fn new(id: impl Into<String>, resolution: f64, mut files: Vec<SourceFile>) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            id: id.into(),
            resolution,
            crs: SUPPORTED_CRS.to_string(),
            coverage: None,
            files,
        }
    }

    /// Attach an explicit coverage polygon set.
    pub fn with_coverage(mut self, coverage: Vec<Vec<[f64; 2]>>) -> Self {
        self.coverage = Some(coverage);
        self
    }

    /// Union of the file footprints, if the source has files.
    pub fn file_extent(&self) -> Option<MercatorBounds> {
        self.files
            .iter()
            .map(|f| f.bounds)
            .reduce(|acc, b| acc.union(&b))
    }
}

/// Read-only set of registered sources, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    sources: BTreeMap<String, Source>,
}

impl Registry {
    /// Build a registry, rejecting duplicate ids, unsupported CRS and bad resolutions.
    pub fn new(sources: Vec<Source>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for mut source in sources {
            if !source.crs.eq_ignore_ascii_case(SUPPORTED_CRS) {
                return Err(PlanError::UnsupportedCrs {
                    source_id: source.id,
                    crs: source.crs,
                });
            }
            source.crs = SUPPORTED_CRS.to_string();
            if !source.resolution.is_finite() || source.resolution <= 0.0 {
                return Err(PlanError::InvalidResolution {
                    source_id: source.id,
                    resolution: source.resolution,
                });
            }
            if map.contains_key(&source.id) {
                return Err(PlanError::DuplicateSource(source.id));
            }
            map.insert(source.id.clone(), source);
        }
        Ok(Self { sources: map })
    }

    /// Load a registry from a YAML catalog file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let registry = Self::from_yaml_str(&text, base_dir)?;
        info!(
            catalog = %path.display(),
            sources = registry.len(),
            "loaded source registry"
        );
        Ok(registry)
    }

    /// Parse a YAML catalog, resolving relative paths against `base_dir`.
    pub fn from_yaml_str(text: &str, base_dir: &Path) -> Result<Self> {
        let catalog: Catalog = serde_yaml::from_str(text)?;
        let mut sources = Vec::with_capacity(catalog.sources.len());
        for entry in catalog.sources {
            sources.push(entry.into_source(base_dir)?);
        }
        Self::new(sources)
    }

    /// Look up a source by id.
    pub fn get(&self, id: &str) -> Option<&Source> {
        self.sources.get(id)
    }

    /// All sources in id order.
    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    /// Number of registered sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// True when no source is registered.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// SHA-256 over the canonical JSON of all sources, hex encoded.
    pub fn digest(&self) -> Result<String> {
        let sources: Vec<&Source> = self.sources.values().collect();
        let bytes = serde_json::to_vec(&sources)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// On-disk catalog layout.
#[derive(Debug, Deserialize)]
struct Catalog {
    sources: Vec<CatalogSource>,
}

#[derive(Debug, Deserialize)]
struct CatalogSource {
    id: String,
    resolution: f64,
    #[serde(default = "default_crs")]
    crs: String,
    #[serde(default)]
    coverage: Option<Vec<Vec<[f64; 2]>>>,
    #[serde(default)]
    files: Vec<CatalogFile>,
    #[serde(default)]
    bounds_csv: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    path: PathBuf,
    #[serde(default)]
    bounds: Option<[f64; 4]>,
}

fn default_crs() -> String {
    SUPPORTED_CRS.to_string()
}

impl CatalogSource {
    fn into_source(self, base_dir: &Path) -> Result<Source> {
        let mut files = Vec::with_capacity(self.files.len());
        for file in self.files {
            let path = resolve(base_dir, &file.path);
            let bounds = match file.bounds {
                Some([min_x, min_y, max_x, max_y]) => {
                    MercatorBounds::new(min_x, min_y, max_x, max_y)
                }
                None => {
                    debug!(path = %path.display(), "reading bounds from GeoTIFF");
                    SourceRaster::read_bounds(&path)?
                }
            };
            files.push(SourceFile { path, bounds });
        }
        if let Some(csv) = &self.bounds_csv {
            files.extend(read_bounds_csv(&resolve(base_dir, csv))?);
        }

        let mut source = Source::new(self.id, self.resolution, files);
        source.crs = self.crs;
        source.coverage = self.coverage;
        Ok(source)
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Read a `bounds.csv` with columns `filename,left,bottom,right,top,width,height`.
///
/// File names are resolved against the CSV's directory.
pub fn read_bounds_csv(path: &Path) -> Result<Vec<SourceFile>> {
    let text = fs::read_to_string(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let invalid = |line: usize, reason: String| PlanError::InvalidBoundsCsv {
        path: path.display().to_string(),
        line,
        reason,
    };

    let mut files = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.trim();
        if line.is_empty() || (idx == 0 && line.starts_with("filename")) {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 7 {
            return Err(invalid(line_no, format!("expected 7 fields, got {}", fields.len())));
        }
        let mut edges = [0.0f64; 4];
        for (slot, field) in edges.iter_mut().zip(&fields[1..5]) {
            *slot = field
                .parse()
                .map_err(|_| invalid(line_no, format!("'{}' is not a number", field)))?;
            if !slot.is_finite() {
                return Err(invalid(line_no, format!("'{}' is not finite", field)));
            }
        }
        for field in &fields[5..7] {
            field
                .parse::<u32>()
                .map_err(|_| invalid(line_no, format!("'{}' is not a pixel count", field)))?;
        }
        let [left, bottom, right, top] = edges;
        files.push(SourceFile {
            path: dir.join(fields[0]),
            bounds: MercatorBounds::new(left, bottom, right, top),
        });
    }
    Ok(files)
}
