//! Error types for the pipeline driver.

use mapterhorn_archive::ArchiveError;
use mapterhorn_dem::DemError;
use mapterhorn_plan::PlanError;
use mapterhorn_state::StateError;
use thiserror::Error;

/// Errors that can occur while running the pipeline.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Raster or tile store error.
    #[error("DEM error: {0}")]
    Dem(#[from] DemError),

    /// Registry or plan error.
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    /// State store error. Aborts the run.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Archive packing or reading error.
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// YAML configuration could not be parsed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON error writing reports or provenance.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid pipeline configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A contributing source file could not be read.
    #[error("Failed to read source file {path}: {reason}")]
    SourceReadFailure {
        /// Source file path.
        path: String,
        /// Underlying cause.
        reason: String,
    },

    /// A parent tile was requested before its children were complete.
    #[error("Tile {tile} is waiting on {}", waiting_on.join(", "))]
    DependencyNotReady {
        /// The parent tile.
        tile: String,
        /// Children that exist in the level below but are not done.
        waiting_on: Vec<String>,
    },

    /// The worker pool could not be created.
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
