//! # mapterhorn-plan
//!
//! Source registry and coverage planning.
//!
//! The [`Registry`] holds every elevation source with its resolution and
//! files. [`build_plan`] rasterises each source's coverage polygon onto the
//! tile grid at the finest zoom and produces a [`WorkPlan`]: one
//! [`WorkItem`] per tile, listing contributing sources finest-first.
//! Plans are deterministic and are stored by version in a [`PlanStore`];
//! old versions stay on disk until explicitly discarded.
//!
//! ## Example
//!
//! ```no_run
//! use mapterhorn_plan::{build_plan, PlanOptions, PlanStore, Registry};
//!
//! let registry = Registry::from_yaml_file("catalog.yaml")?;
//! let options = PlanOptions { max_zoom: 12, ..PlanOptions::default() };
//! let plan = build_plan(&registry, &options)?;
//!
//! let store = PlanStore::open("work/plans")?;
//! let version = store.save(&plan)?;
//! println!("plan {} covers {} tiles", version, plan.len());
//! # Ok::<(), mapterhorn_plan::PlanError>(())
//! ```

mod blend;
mod coverage;
mod error;
mod plan;
mod planner;
mod registry;
mod store;

pub use blend::{BlendConfig, Kernel};
pub use coverage::Coverage;
pub use error::PlanError;
pub use plan::{Contributor, FileContribution, PlanDiff, RejectedSource, WorkItem, WorkPlan};
pub use planner::{build_plan, PlanOptions};
pub use registry::{read_bounds_csv, Registry, Source, SourceFile, SUPPORTED_CRS};
pub use store::{PlanRecord, PlanStore};

/// Result type for planning operations.
pub type Result<T> = std::result::Result<T, PlanError>;
