//! The state store abstraction shared by all backends.

use crate::{Progress, Result, Stage, StageCounts, StateRecord};
use chrono::{DateTime, Utc};

/// Per-unit status tracking keyed by `(plan version, stage, unit id)`.
///
/// Implementations must make every transition of a single key atomic;
/// transitions of different keys must not contend on one global lock.
/// A `done` unit is final: no method moves it to another status.
pub trait StateStore: Send + Sync {
    /// Register units as pending. Units already known keep their status.
    /// Returns the number of newly registered units.
    fn seed(&self, version: u64, stage: Stage, unit_ids: &[String]) -> Result<usize>;

    /// Claim a unit for processing.
    ///
    /// Returns `false` if the unit is already done. Otherwise the unit moves
    /// to in-progress (registering it if needed), its attempt count grows
    /// and `true` is returned. A unit left in progress by a crashed run can
    /// be claimed again.
    fn claim(&self, version: u64, stage: Stage, unit_id: &str) -> Result<bool>;

    /// Mark a unit done. Call only after its output is durably written.
    fn mark_done(&self, version: u64, stage: Stage, unit_id: &str) -> Result<()>;

    /// Record a failed attempt. Has no effect on a done unit.
    fn mark_failed(&self, version: u64, stage: Stage, unit_id: &str, error: &str) -> Result<()>;

    /// Current record for a unit, if it is known.
    fn status(&self, version: u64, stage: Stage, unit_id: &str) -> Result<Option<StateRecord>>;

    /// Every unit that is not done, sorted by id.
    fn list_pending(&self, version: u64, stage: Stage) -> Result<Vec<String>>;

    /// Every done unit, sorted by id.
    fn list_done(&self, version: u64, stage: Stage) -> Result<Vec<String>>;

    /// Number of units per status.
    fn counts(&self, version: u64, stage: Stage) -> Result<StageCounts>;

    /// Earliest completion time in a stage.
    fn first_done_at(&self, version: u64, stage: Stage) -> Result<Option<DateTime<Utc>>>;

    /// Drop every record of a plan version. Returns the number removed.
    fn discard(&self, version: u64) -> Result<usize>;

    /// True if the unit is done.
    fn is_done(&self, version: u64, stage: Stage, unit_id: &str) -> Result<bool> {
        Ok(self
            .status(version, stage, unit_id)?
            .is_some_and(|r| r.status == crate::UnitStatus::Done))
    }

    /// Done/total with an ETA extrapolated from the first completion.
    fn progress(&self, version: u64, stage: Stage, now: DateTime<Utc>) -> Result<Progress> {
        let counts = self.counts(version, stage)?;
        let started_at = self.first_done_at(version, stage)?;
        Ok(Progress::estimate(
            counts.done,
            counts.total(),
            started_at,
            now,
        ))
    }
}
