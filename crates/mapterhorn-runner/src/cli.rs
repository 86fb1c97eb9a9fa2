//! Command-line interface of the `mapterhorn` binary.

use crate::config::{ConfigOverrides, PipelineConfig};
use crate::pipeline::{Pipeline, VersionStatus};
use crate::report::RunReport;
use crate::{Result, RunnerError};
use clap::{ArgAction, Args, Parser, Subcommand};
use mapterhorn_dem::TileCoord;
use mapterhorn_plan::Kernel;
use std::path::PathBuf;

/// Elevation tile aggregation: plan, composite, downsample and pack.
#[derive(Debug, Parser)]
#[command(name = "mapterhorn")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Pipeline config (YAML). Flags below override its values.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// More logging; repeat for trace output. `RUST_LOG` takes precedence.
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Work directory holding plans, tiles, state and reports.
    #[arg(long, global = true)]
    pub work_dir: Option<PathBuf>,

    /// Source catalog (YAML).
    #[arg(long, global = true)]
    pub catalog: Option<PathBuf>,

    /// Worker threads (0 = one per core).
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    #[arg(long, global = true)]
    pub min_zoom: Option<u8>,

    #[arg(long, global = true)]
    pub max_zoom: Option<u8>,

    /// Seam blending distance in pixels.
    #[arg(long, global = true)]
    pub falloff_px: Option<f32>,

    /// Seam blending falloff shape: smoothstep, linear or cosine.
    #[arg(long, global = true)]
    pub kernel: Option<Kernel>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build a plan from the catalog and store it as a new version.
    Plan,
    /// List stored plan versions.
    Versions,
    /// Show tiles that differ between two plan versions.
    Diff(DiffArgs),
    /// Delete a plan version with its state and tiles.
    Discard(VersionArgs),
    /// Composite the finest-zoom tiles of a version.
    Composite(VersionArgs),
    /// Build the overview zooms of a version.
    Downsample(VersionArgs),
    /// Pack the tiles of a version into an archive.
    Pack(PackArgs),
    /// Composite, downsample and pack in one go.
    Run(RunArgs),
    /// Per-stage progress of a version.
    Status(VersionArgs),
}

#[derive(Debug, Args)]
pub struct VersionArgs {
    /// Plan version.
    pub version: u64,
}

#[derive(Debug, Args)]
pub struct DiffArgs {
    /// Newer plan version.
    pub new: u64,
    /// Older plan version.
    pub old: u64,
}

#[derive(Debug, Args)]
pub struct PackArgs {
    /// Plan version.
    pub version: u64,

    /// Pack only this tile (`z/x/y`) and its descendants.
    #[arg(long)]
    pub subtree: Option<String>,

    /// Archive path; defaults to `<archive dir>/<name>.pmtiles`.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Existing plan version; a new plan is built when omitted.
    pub version: Option<u64>,
}

impl Cli {
    /// Flags that override config values.
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            catalog: self.catalog.clone(),
            work_dir: self.work_dir.clone(),
            min_zoom: self.min_zoom,
            max_zoom: self.max_zoom,
            workers: self.workers,
            falloff_px: self.falloff_px,
            kernel: self.kernel,
        }
    }

    /// The config file (or defaults) with flags applied.
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_yaml_file(path)?,
            None => PipelineConfig::default(),
        };
        config.apply(&self.overrides())?;
        Ok(config)
    }

    /// Default log filter for the verbosity flag.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    /// Run the subcommand. Returns whether everything completed cleanly.
    pub fn execute(&self, pipeline: &Pipeline) -> Result<bool> {
        match &self.command {
            Commands::Plan => {
                let record = pipeline.plan()?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                } else {
                    println!(
                        "plan {}: {} tiles, digest {}",
                        record.version, record.tile_count, record.digest
                    );
                }
                Ok(true)
            }
            Commands::Versions => {
                let versions = pipeline.plans().versions()?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&versions)?);
                } else if versions.is_empty() {
                    println!("no plans");
                } else {
                    for record in &versions {
                        println!(
                            "{:>5}  {}  {:>8} tiles  {}",
                            record.version,
                            record.created_at.format("%Y-%m-%d %H:%M:%S"),
                            record.tile_count,
                            record.digest
                        );
                    }
                }
                Ok(true)
            }
            Commands::Diff(args) => {
                let diff = pipeline.diff(args.new, args.old)?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&diff)?);
                } else {
                    for (mark, tiles) in [("+", &diff.added), ("-", &diff.removed), ("~", &diff.changed)] {
                        for tile in tiles {
                            println!("{} {}", mark, tile);
                        }
                    }
                    println!(
                        "{} added, {} removed, {} changed",
                        diff.added.len(),
                        diff.removed.len(),
                        diff.changed.len()
                    );
                }
                Ok(true)
            }
            Commands::Discard(args) => {
                pipeline.discard(args.version)?;
                println!("discarded version {}", args.version);
                Ok(true)
            }
            Commands::Composite(args) => {
                let mut report = RunReport::new(args.version);
                pipeline.composite(args.version, &mut report)?;
                pipeline.write_report(&mut report)?;
                self.print_report(&report)?;
                Ok(report.is_clean())
            }
            Commands::Downsample(args) => {
                let mut report = RunReport::new(args.version);
                pipeline.downsample(args.version, &mut report)?;
                pipeline.write_report(&mut report)?;
                self.print_report(&report)?;
                Ok(report.is_clean())
            }
            Commands::Pack(args) => {
                let subtree = match &args.subtree {
                    Some(s) => Some(s.parse::<TileCoord>().map_err(|e| {
                        RunnerError::InvalidConfig(format!("--subtree {:?}: {}", s, e))
                    })?),
                    None => pipeline.config().archive_subtree()?,
                };
                let summary = pipeline.pack(args.version, subtree, args.output.clone())?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                } else {
                    println!(
                        "{}: {} tiles ({} unique), {} bytes, sha256 {}",
                        summary.archive,
                        summary.addressed_tiles,
                        summary.unique_tiles,
                        summary.bytes,
                        summary.sha256
                    );
                }
                Ok(true)
            }
            Commands::Run(args) => {
                let report = pipeline.run(args.version)?;
                self.print_report(&report)?;
                Ok(report.is_clean())
            }
            Commands::Status(args) => {
                let status = pipeline.status(args.version)?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&status)?);
                } else {
                    print_status(&status);
                }
                Ok(true)
            }
        }
    }

    fn print_report(&self, report: &RunReport) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(report)?);
            return Ok(());
        }
        println!("plan version {}", report.plan_version);
        for (name, stage) in [("composite", &report.composite), ("downsample", &report.downsample)] {
            println!(
                "  {:<10} {} done, {} skipped, {} failed, {} not started",
                name, stage.done, stage.skipped, stage.failed, stage.not_started
            );
        }
        for failure in &report.failures {
            println!("  failed  {} {}: {}", failure.stage, failure.tile, failure.reason);
        }
        for blocked in &report.blocked {
            println!("  blocked {} waiting on {}", blocked.tile, blocked.waiting_on.join(", "));
        }
        if !report.dropped_contributors.is_empty() {
            println!("  {} source files dropped", report.dropped_contributors.len());
        }
        if let Some(archive) = &report.archive {
            println!("  archive {} ({} bytes)", archive.archive, archive.bytes);
        }
        if let Some(error) = &report.archive_error {
            println!("  archive not sealed: {}", error);
        }
        if report.stopped {
            println!("  stopped before completion");
        }
        Ok(())
    }
}

fn print_status(status: &VersionStatus) {
    println!(
        "plan {} ({} tiles, created {})",
        status.plan.version,
        status.plan.tile_count,
        status.plan.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    for stage in &status.stages {
        let eta = stage
            .progress
            .eta
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<10} {:>8}/{:<8} done  {} in progress  {} failed  eta {}",
            stage.stage.as_str(),
            stage.counts.done,
            stage.counts.total(),
            stage.counts.in_progress,
            stage.counts.failed,
            eta
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "mapterhorn",
            "composite",
            "3",
            "--work-dir",
            "/tmp/work",
            "--max-zoom",
            "9",
            "--kernel",
            "cosine",
            "-vv",
        ]);
        assert!(matches!(cli.command, Commands::Composite(VersionArgs { version: 3 })));
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_filter(), "trace");

        let config = cli.pipeline_config().unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/tmp/work"));
        assert_eq!(config.max_zoom, 9);
        assert_eq!(config.blend.kernel, Kernel::Cosine);
    }

    #[test]
    fn test_pack_args() {
        let cli = Cli::parse_from([
            "mapterhorn",
            "pack",
            "4",
            "--subtree",
            "6/33/22",
            "-o",
            "out.pmtiles",
        ]);
        match cli.command {
            Commands::Pack(args) => {
                assert_eq!(args.version, 4);
                assert_eq!(args.subtree.as_deref(), Some("6/33/22"));
                assert_eq!(args.output, Some(PathBuf::from("out.pmtiles")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_run_version_optional() {
        let cli = Cli::parse_from(["mapterhorn", "run"]);
        assert!(matches!(cli.command, Commands::Run(RunArgs { version: None })));
        assert_eq!(cli.log_filter(), "info");

        let cli = Cli::parse_from(["mapterhorn", "--json", "run", "2"]);
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Run(RunArgs { version: Some(2) })));
    }

    #[test]
    fn test_diff_requires_two_versions() {
        assert!(Cli::try_parse_from(["mapterhorn", "diff", "3"]).is_err());
        let cli = Cli::parse_from(["mapterhorn", "diff", "3", "2"]);
        assert!(matches!(cli.command, Commands::Diff(DiffArgs { new: 3, old: 2 })));
    }

    #[test]
    fn test_invalid_override_rejected() {
        let cli = Cli::parse_from(["mapterhorn", "plan", "--min-zoom", "9", "--max-zoom", "3"]);
        assert!(cli.pipeline_config().is_err());
    }
}
