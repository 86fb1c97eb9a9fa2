//! # mapterhorn-state
//!
//! Resumable per-unit state for the mapterhorn pipeline.
//!
//! Every tile of every stage is a unit keyed by `(plan version, stage,
//! unit id)`. Workers [`claim`](StateStore::claim) a unit before working on
//! it and [`mark_done`](StateStore::mark_done) only after its output is
//! durably written, so a restarted run resumes from the first unit that is
//! not done. Done is final.
//!
//! Two backends implement [`StateStore`]:
//! - [`SqliteStateTracker`], the persistent store used by real runs;
//! - [`MemoryStateTracker`], for tests and dry runs.
//!
//! ## Example
//!
//! ```no_run
//! use mapterhorn_state::{SqliteStateTracker, Stage, StateStore};
//!
//! let state = SqliteStateTracker::open("work/state.db")?;
//! if state.claim(1, Stage::Composite, "12/2138/1450")? {
//!     // ... write the tile, fsync, rename ...
//!     state.mark_done(1, Stage::Composite, "12/2138/1450")?;
//! }
//! let progress = state.progress(1, Stage::Composite, chrono::Utc::now())?;
//! println!("{}/{} done, eta {:?}", progress.done, progress.total, progress.eta);
//! # Ok::<(), mapterhorn_state::StateError>(())
//! ```

mod error;
mod memory;
mod sqlite;
mod status;
mod tracker;

pub use error::StateError;
pub use memory::MemoryStateTracker;
pub use sqlite::{SqliteConfig, SqliteStateTracker};
pub use status::{Progress, Stage, StageCounts, StateRecord, UnitStatus};
pub use tracker::StateStore;

/// Result type for state operations.
pub type Result<T> = std::result::Result<T, StateError>;
