//! Tile provenance and the per-run report.

use crate::Result;
use chrono::{DateTime, Utc};
use mapterhorn_archive::ArchiveSummary;
use mapterhorn_dem::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Sidecar written next to every output tile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TileProvenance {
    /// Tile id, `z/x/y`.
    pub tile: String,
    pub plan_version: u64,
    /// Sources that contributed pixels, in priority order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceContribution>,
    /// Children an overview tile was built from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    /// Contributors dropped because they could not be read.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ContributorFailure>,
}

/// One source's share of a composited tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceContribution {
    pub source_id: String,
    /// Tile pixels where the source had data.
    pub pixels: usize,
    /// Mean blend weight over those pixels; 1 where nothing lay beneath.
    pub mean_weight: f64,
}

/// A source file that was skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributorFailure {
    pub tile: String,
    pub source_id: String,
    pub path: PathBuf,
    pub error: String,
}

/// A unit that failed outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub stage: String,
    pub tile: String,
    pub reason: String,
}

/// A parent whose children never all completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedTile {
    pub tile: String,
    pub waiting_on: Vec<String>,
}

/// Unit counts for one stage of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    /// Units produced by this run.
    pub done: usize,
    /// Units already done before this run.
    pub skipped: usize,
    /// Units that failed.
    pub failed: usize,
    /// Units never started because the run was stopped.
    pub not_started: usize,
}

/// Manifest of one pipeline run, written to `<work>/reports/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub plan_version: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// The stop flag was raised before the run completed.
    pub stopped: bool,
    pub composite: StageSummary,
    pub downsample: StageSummary,
    pub failures: Vec<UnitFailure>,
    pub dropped_contributors: Vec<ContributorFailure>,
    pub blocked: Vec<BlockedTile>,
    pub archive: Option<ArchiveSummary>,
    pub archive_error: Option<String>,
}

impl RunReport {
    pub fn new(plan_version: u64) -> Self {
        Self {
            plan_version,
            started_at: Utc::now(),
            finished_at: None,
            stopped: false,
            composite: StageSummary::default(),
            downsample: StageSummary::default(),
            failures: Vec::new(),
            dropped_contributors: Vec::new(),
            blocked: Vec::new(),
            archive: None,
            archive_error: None,
        }
    }

    /// True when every unit completed and the archive (if attempted) sealed.
    pub fn is_clean(&self) -> bool {
        !self.stopped
            && self.failures.is_empty()
            && self.blocked.is_empty()
            && self.archive_error.is_none()
    }

    /// Stamp the finish time and write to `<dir>/<version>-<timestamp>.json`.
    pub fn write(&mut self, dir: &Path) -> Result<PathBuf> {
        let finished = Utc::now();
        self.finished_at = Some(finished);
        let path = dir.join(format!(
            "{}-{}.json",
            self.plan_version,
            finished.format("%Y%m%dT%H%M%S%.3fZ")
        ));
        let mut json = serde_json::to_vec_pretty(self)?;
        json.push(b'\n');
        write_atomic(&path, &json)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_written_under_version_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = RunReport::new(5);
        report.failures.push(UnitFailure {
            stage: "composite".to_string(),
            tile: "3/1/2".to_string(),
            reason: "disk full".to_string(),
        });
        let path = report.write(dir.path()).unwrap();

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("5-"));
        assert!(name.ends_with(".json"));

        let loaded: RunReport = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(loaded, report);
        assert!(loaded.finished_at.is_some());
        assert!(!loaded.is_clean());
    }

    #[test]
    fn test_provenance_omits_empty_lists() {
        let provenance = TileProvenance {
            tile: "2/1/1".to_string(),
            plan_version: 1,
            children: vec!["3/2/2".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_string(&provenance).unwrap();
        assert!(!json.contains("sources"));
        assert!(!json.contains("failures"));
        let back: TileProvenance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, provenance);
    }
}
