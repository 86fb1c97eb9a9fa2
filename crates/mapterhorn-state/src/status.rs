//! Stages, unit statuses, records and progress.

use crate::StateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A pipeline stage with its own set of units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Compositing sources into finest-zoom tiles.
    Composite,
    /// Building overview tiles from their children.
    Downsample,
}

impl Stage {
    /// Name stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Composite => "composite",
            Stage::Downsample => "downsample",
        }
    }

    /// Every stage, in pipeline order.
    pub fn all() -> [Stage; 2] {
        [Stage::Composite, Stage::Downsample]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "composite" => Ok(Stage::Composite),
            "downsample" => Ok(Stage::Downsample),
            other => Err(StateError::InvalidStage(other.to_string())),
        }
    }
}

/// Status of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Not started.
    Pending,
    /// Claimed by a worker. After a crash this is safe to redo.
    InProgress,
    /// Output durably written. Never regenerated.
    Done,
    /// Last attempt failed; eligible for retry.
    Failed,
}

impl UnitStatus {
    /// Name stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::InProgress => "in_progress",
            UnitStatus::Done => "done",
            UnitStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UnitStatus::Pending),
            "in_progress" => Ok(UnitStatus::InProgress),
            "done" => Ok(UnitStatus::Done),
            "failed" => Ok(UnitStatus::Failed),
            other => Err(StateError::InvalidStatus(other.to_string())),
        }
    }
}

/// State of one `(plan version, stage, unit)` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Plan version.
    pub version: u64,
    /// Stage.
    pub stage: Stage,
    /// Unit id, a tile id `"z/x/y"`.
    pub unit_id: String,
    /// Current status.
    pub status: UnitStatus,
    /// Number of claims so far.
    pub attempts: u32,
    /// Error from the last failed attempt.
    pub error: Option<String>,
    /// Time of the last transition.
    pub updated_at: DateTime<Utc>,
    /// Time the unit became done.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Number of units per status for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    /// Units not yet started.
    pub pending: usize,
    /// Units claimed but not finished.
    pub in_progress: usize,
    /// Units done.
    pub done: usize,
    /// Units whose last attempt failed.
    pub failed: usize,
}

impl StageCounts {
    /// Total number of units.
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.done + self.failed
    }

    /// Count one more unit in `status`.
    pub fn add(&mut self, status: UnitStatus) {
        match status {
            UnitStatus::Pending => self.pending += 1,
            UnitStatus::InProgress => self.in_progress += 1,
            UnitStatus::Done => self.done += 1,
            UnitStatus::Failed => self.failed += 1,
        }
    }
}

/// Progress of a stage with an estimated completion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Units done.
    pub done: usize,
    /// Units in the stage.
    pub total: usize,
    /// Time of the first completion.
    pub started_at: Option<DateTime<Utc>>,
    /// Projected completion, extrapolated linearly from the first completion.
    pub eta: Option<DateTime<Utc>>,
}

impl Progress {
    /// Extrapolate from `done / total` units finished since `started_at`.
    pub fn estimate(
        done: usize,
        total: usize,
        started_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let eta = match started_at {
            Some(start) if done > 0 && total > 0 => {
                let elapsed = (now - start).num_milliseconds().max(0) as f64;
                let fraction = done as f64 / total as f64;
                let total_ms = elapsed / fraction;
                Some(start + chrono::Duration::milliseconds(total_ms.round() as i64))
            }
            _ => None,
        };
        Self {
            done,
            total,
            started_at,
            eta,
        }
    }

    /// Completed fraction in `[0, 1]`; an empty stage counts as complete.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            UnitStatus::Pending,
            UnitStatus::InProgress,
            UnitStatus::Done,
            UnitStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<UnitStatus>().unwrap(), status);
        }
        assert!("finished".parse::<UnitStatus>().is_err());
        assert_eq!("downsample".parse::<Stage>().unwrap(), Stage::Downsample);
    }

    #[test]
    fn test_eta_linear_extrapolation() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let now = start + chrono::Duration::hours(1);
        let progress = Progress::estimate(25, 100, Some(start), now);
        assert_eq!(progress.eta, Some(start + chrono::Duration::hours(4)));
        assert_eq!(progress.fraction(), 0.25);
    }

    #[test]
    fn test_eta_unknown_before_first_completion() {
        let now = Utc::now();
        let progress = Progress::estimate(0, 10, None, now);
        assert_eq!(progress.eta, None);
        assert_eq!(Progress::estimate(0, 0, None, now).fraction(), 1.0);
    }
}
