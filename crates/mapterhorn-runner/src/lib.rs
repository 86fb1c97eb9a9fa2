//! # mapterhorn-runner
//!
//! Compositing, downsampling and the pipeline driver.
//!
//! A [`Pipeline`] owns a work directory:
//!
//! ```text
//! <work>/plans/<version>/plan.json   versioned work plans and their ledger
//! <work>/state.db                    per-unit state (SQLite)
//! <work>/tiles/<version>/<z>/<x>/<y>.tif
//! <work>/reports/<version>-<time>.json
//! <work>/archives/<name>.pmtiles
//! ```
//!
//! Stages always take an explicit plan version:
//! - [`Pipeline::composite`] blends the sources of every finest-zoom tile
//!   with the [`Compositor`];
//! - [`Pipeline::downsample`] builds the overview zooms bottom-up with the
//!   [`Downsampler`];
//! - [`Pipeline::pack`] seals the tiles into an archive.
//!
//! ## Example
//!
//! ```no_run
//! use mapterhorn_runner::{Pipeline, PipelineConfig};
//!
//! let config = PipelineConfig::from_yaml_file("pipeline.yaml")?;
//! let pipeline = Pipeline::open(config)?;
//! let report = pipeline.run(None)?;
//! println!("version {} clean: {}", report.plan_version, report.is_clean());
//! # Ok::<(), mapterhorn_runner::RunnerError>(())
//! ```

pub mod blend;
pub mod cli;
pub mod compositor;
pub mod config;
pub mod downsampler;
mod error;
pub mod pipeline;
pub mod report;
pub mod watchdog;

pub use blend::{distance_to_invalid, layer_weights};
pub use cli::{Cli, Commands};
pub use compositor::{CompositeOutput, Compositor};
pub use config::{ArchiveConfig, ConfigOverrides, PipelineConfig};
pub use downsampler::{downsample_children, Downsampler, Readiness};
pub use error::RunnerError;
pub use mapterhorn_plan::{BlendConfig, Kernel};
pub use pipeline::{Pipeline, StageStatus, VersionStatus};
pub use report::{
    BlockedTile, ContributorFailure, RunReport, SourceContribution, StageSummary, TileProvenance,
    UnitFailure,
};
pub use watchdog::{Watchdog, WatchdogState};

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, RunnerError>;
