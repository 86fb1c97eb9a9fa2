//! The pipeline driver: plan, composite, downsample, pack.
//!
//! Every stage takes an explicit plan version. Units are claimed in the
//! state store before work starts and marked done only after their tile is
//! durably written, so any stage can be interrupted and rerun; done units
//! are skipped.

use crate::compositor::Compositor;
use crate::config::PipelineConfig;
use crate::downsampler::{parents_of, Downsampler, Readiness};
use crate::report::{BlockedTile, ContributorFailure, RunReport, StageSummary, UnitFailure};
use crate::watchdog::{Watchdog, WatchdogState};
use crate::{Result, RunnerError};
use mapterhorn_archive::{ArchiveSummary, PackOptions};
use mapterhorn_dem::{RasterCache, TileCoord, TileStore};
use mapterhorn_metrics::{metric_defs, MetricLabels};
use mapterhorn_plan::{build_plan, PlanDiff, PlanRecord, PlanStore, Registry, WorkItem, WorkPlan};
use mapterhorn_state::{
    Progress, SqliteConfig, SqliteStateTracker, Stage, StageCounts, StateStore,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Display;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// What happened to one unit in one run.
enum UnitOutcome {
    Done(Vec<ContributorFailure>),
    Skipped,
    NotStarted,
    Failed(UnitFailure),
}

/// Per-stage progress of one plan version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatus {
    pub stage: Stage,
    pub counts: StageCounts,
    pub progress: Progress,
}

/// Output of `mapterhorn status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionStatus {
    pub plan: PlanRecord,
    pub stages: Vec<StageStatus>,
}

/// Drives the stages of one work directory.
pub struct Pipeline {
    config: PipelineConfig,
    plans: PlanStore,
    state: Arc<dyn StateStore>,
    cache: RasterCache,
    stop: Arc<AtomicBool>,
    pool: rayon::ThreadPool,
}

impl Pipeline {
    /// Open the work directory with the SQLite state store at
    /// `<work_dir>/state.db`.
    pub fn open(config: PipelineConfig) -> Result<Self> {
        fs::create_dir_all(&config.work_dir)?;
        let mut sqlite = SqliteConfig::new(config.state_path());
        sqlite.pool_size = config.state_pool_size;
        let state = SqliteStateTracker::with_config(sqlite)?;
        Self::with_state(config, Arc::new(state))
    }

    /// Open the work directory with a caller-supplied state store.
    pub fn with_state(config: PipelineConfig, state: Arc<dyn StateStore>) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.work_dir)?;
        let plans = PlanStore::open(config.plans_dir())?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("mapterhorn-worker-{}", i))
            .build()?;
        let cache = RasterCache::with_cache_size(config.raster_cache_size);
        debug!(
            work_dir = %config.work_dir.display(),
            workers = pool.current_num_threads(),
            "opened pipeline"
        );
        Ok(Self {
            config,
            plans,
            state,
            cache,
            stop: Arc::new(AtomicBool::new(false)),
            pool,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn plans(&self) -> &PlanStore {
        &self.plans
    }

    pub fn state(&self) -> &dyn StateStore {
        self.state.as_ref()
    }

    /// Raising this flag stops new units from starting; running units finish.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn store_for(&self, version: u64, plan: &WorkPlan) -> TileStore {
        TileStore::new(self.config.tiles_dir(version), plan.tile_size)
    }

    /// Tile store holding the output of `version`.
    pub fn tile_store(&self, version: u64) -> Result<TileStore> {
        let plan = self.plans.load(version)?;
        Ok(self.store_for(version, &plan))
    }

    /// Build a plan from the catalog and store it under a new version.
    pub fn plan(&self) -> Result<PlanRecord> {
        let registry = Registry::from_yaml_file(&self.config.catalog)?;
        let plan = build_plan(&registry, &self.config.plan_options())?;
        for rejected in &plan.rejected {
            warn!(
                source = %rejected.source_id,
                reason = %rejected.reason,
                "source left out of plan"
            );
        }
        let version = self.plans.save(&plan)?;
        Ok(self.plans.record(version)?)
    }

    /// Tiles that differ between two stored plans.
    pub fn diff(&self, newer: u64, older: u64) -> Result<PlanDiff> {
        let newer = self.plans.load(newer)?;
        let older = self.plans.load(older)?;
        Ok(newer.diff(&older))
    }

    /// Remove a plan version with its state records and tiles.
    pub fn discard(&self, version: u64) -> Result<()> {
        self.plans.discard(version)?;
        let records = self.state.discard(version)?;
        let tiles = self.config.tiles_dir(version);
        if tiles.exists() {
            fs::remove_dir_all(&tiles)?;
        }
        info!(version, records, "discarded version");
        Ok(())
    }

    /// Composite every work item of `version` that is not done yet.
    pub fn composite(&self, version: u64, report: &mut RunReport) -> Result<()> {
        let plan = self.plans.load(version)?;
        let store = self.store_for(version, &plan);
        let ids: Vec<String> = plan.items.iter().map(|item| item.tile.id()).collect();
        let seeded = self.state.seed(version, Stage::Composite, &ids)?;
        info!(version, tiles = ids.len(), seeded, "compositing");

        if plan.blend != self.config.blend {
            warn!(
                version,
                plan_falloff_px = plan.blend.falloff_px,
                plan_kernel = %plan.blend.kernel,
                "configured blend differs from the plan; using the plan's"
            );
        }
        let compositor = Compositor::new(
            &self.cache,
            plan.blend,
            plan.tile_size,
            plan.buffer_px,
            version,
        );
        let labels = MetricLabels::new(version, Stage::Composite.as_str());
        let watchdog = Watchdog::start(self.config.watchdog_timeout());
        let started = Instant::now();

        let outcomes: Vec<Result<UnitOutcome>> = self.pool.install(|| {
            plan.items
                .par_iter()
                .map(|item| {
                    self.composite_one(version, item, &compositor, &store, watchdog.state(), &labels)
                })
                .collect()
        });
        watchdog.stop();

        let summary = self.tally(outcomes, report)?;
        report.composite = add_summaries(report.composite, summary);
        info!(
            version,
            done = summary.done,
            skipped = summary.skipped,
            failed = summary.failed,
            not_started = summary.not_started,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "composite finished"
        );
        Ok(())
    }

    fn composite_one(
        &self,
        version: u64,
        item: &WorkItem,
        compositor: &Compositor<'_>,
        store: &TileStore,
        watchdog: &Arc<WatchdogState>,
        labels: &MetricLabels,
    ) -> Result<UnitOutcome> {
        let id = item.tile.id();
        if self.state.is_done(version, Stage::Composite, &id)? {
            return Ok(UnitOutcome::Skipped);
        }
        if self.stopped() {
            return Ok(UnitOutcome::NotStarted);
        }
        if !self.state.claim(version, Stage::Composite, &id)? {
            return Ok(UnitOutcome::Skipped);
        }

        let _guard = watchdog.begin(version, Stage::Composite, &id);
        let started = Instant::now();
        let output = compositor.composite(item);
        if let Err(e) = store.write(item.tile, &output.raster, &output.provenance) {
            return self.fail_unit(version, Stage::Composite, &id, &e, labels);
        }
        self.state.mark_done(version, Stage::Composite, &id)?;

        let label_pairs = labels.to_labels();
        metrics::counter!(metric_defs::TILES_COMPOSITED.name, &label_pairs).increment(1);
        metrics::histogram!(metric_defs::UNIT_DURATION.name, &label_pairs)
            .record(started.elapsed().as_secs_f64() * 1000.0);
        for failure in &output.provenance.failures {
            let dropped = labels.with(&[("source", failure.source_id.clone())]);
            metrics::counter!(metric_defs::CONTRIBUTORS_DROPPED.name, &dropped).increment(1);
        }
        debug!(tile = %id, sources = output.provenance.sources.len(), "composited");
        Ok(UnitOutcome::Done(output.provenance.failures))
    }

    /// Build every overview level of `version`, finest first.
    ///
    /// A level starts only after the level below has been attempted in
    /// full. A parent with a child that is not done is left pending and
    /// recorded as blocked; it is produced by a later run once the child
    /// completes.
    pub fn downsample(&self, version: u64, report: &mut RunReport) -> Result<()> {
        let plan = self.plans.load(version)?;
        let store = self.store_for(version, &plan);
        let downsampler = Downsampler::new(&store, self.state.as_ref(), version, plan.max_zoom);
        let labels = MetricLabels::new(version, Stage::Downsample.as_str());
        let watchdog = Watchdog::start(self.config.watchdog_timeout());
        let mut total = StageSummary::default();

        let mut level_below: HashSet<TileCoord> = plan.tiles().collect();
        for z in (plan.min_zoom..plan.max_zoom).rev() {
            if self.stopped() {
                info!(version, zoom = z, "stop requested, leaving coarser levels pending");
                report.stopped = true;
                break;
            }
            let parents = parents_of(&level_below);
            let ids: Vec<String> = parents.iter().map(TileCoord::id).collect();
            self.state.seed(version, Stage::Downsample, &ids)?;

            let mut ready = Vec::new();
            let mut blocked = Vec::new();
            let mut summary = StageSummary::default();
            for &parent in &parents {
                if self.state.is_done(version, Stage::Downsample, &parent.id())? {
                    summary.skipped += 1;
                    continue;
                }
                match downsampler.readiness(parent, &level_below)? {
                    Readiness::Ready => ready.push(parent),
                    Readiness::Waiting(children) => blocked.push(BlockedTile {
                        tile: parent.id(),
                        waiting_on: children.iter().map(TileCoord::id).collect(),
                    }),
                }
            }

            let outcomes: Vec<Result<UnitOutcome>> = self.pool.install(|| {
                ready
                    .par_iter()
                    .map(|&parent| {
                        self.downsample_one(
                            version,
                            parent,
                            &level_below,
                            &downsampler,
                            &store,
                            watchdog.state(),
                            &labels,
                        )
                    })
                    .collect()
            });
            summary = add_summaries(summary, self.tally(outcomes, report)?);

            if !blocked.is_empty() {
                warn!(version, zoom = z, blocked = blocked.len(), "parents waiting on children");
                metrics::counter!(metric_defs::TILES_BLOCKED.name, &labels.to_labels())
                    .increment(blocked.len() as u64);
                report.blocked.extend(blocked);
            }
            info!(
                version,
                zoom = z,
                parents = parents.len(),
                done = summary.done,
                skipped = summary.skipped,
                failed = summary.failed,
                "downsampled level"
            );
            total = add_summaries(total, summary);
            level_below = parents.into_iter().collect();
        }
        watchdog.stop();

        report.downsample = add_summaries(report.downsample, total);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn downsample_one(
        &self,
        version: u64,
        parent: TileCoord,
        level_below: &HashSet<TileCoord>,
        downsampler: &Downsampler<'_>,
        store: &TileStore,
        watchdog: &Arc<WatchdogState>,
        labels: &MetricLabels,
    ) -> Result<UnitOutcome> {
        let id = parent.id();
        if self.stopped() {
            return Ok(UnitOutcome::NotStarted);
        }
        if !self.state.claim(version, Stage::Downsample, &id)? {
            return Ok(UnitOutcome::Skipped);
        }

        let _guard = watchdog.begin(version, Stage::Downsample, &id);
        let started = Instant::now();
        let (raster, provenance) = match downsampler.produce(parent, level_below) {
            Ok(produced) => produced,
            Err(e @ RunnerError::State(_)) => return Err(e),
            Err(e) => return self.fail_unit(version, Stage::Downsample, &id, &e, labels),
        };
        if let Err(e) = store.write(parent, &raster, &provenance) {
            return self.fail_unit(version, Stage::Downsample, &id, &e, labels);
        }
        self.state.mark_done(version, Stage::Downsample, &id)?;

        let zoom = labels.with(&[("zoom", parent.z.to_string())]);
        metrics::counter!(metric_defs::TILES_DOWNSAMPLED.name, &zoom).increment(1);
        metrics::histogram!(metric_defs::UNIT_DURATION.name, &labels.to_labels())
            .record(started.elapsed().as_secs_f64() * 1000.0);
        debug!(tile = %id, children = provenance.children.len(), "downsampled");
        Ok(UnitOutcome::Done(Vec::new()))
    }

    fn fail_unit(
        &self,
        version: u64,
        stage: Stage,
        id: &str,
        err: &dyn Display,
        labels: &MetricLabels,
    ) -> Result<UnitOutcome> {
        let reason = err.to_string();
        warn!(tile = %id, %stage, %reason, "unit failed");
        self.state.mark_failed(version, stage, id, &reason)?;
        metrics::counter!(metric_defs::UNITS_FAILED.name, &labels.to_labels()).increment(1);
        Ok(UnitOutcome::Failed(UnitFailure {
            stage: stage.to_string(),
            tile: id.to_string(),
            reason,
        }))
    }

    /// Fold unit outcomes into counts, moving failures into the report.
    /// The first structural error aborts.
    fn tally(&self, outcomes: Vec<Result<UnitOutcome>>, report: &mut RunReport) -> Result<StageSummary> {
        let mut summary = StageSummary::default();
        for outcome in outcomes {
            match outcome? {
                UnitOutcome::Done(dropped) => {
                    summary.done += 1;
                    report.dropped_contributors.extend(dropped);
                }
                UnitOutcome::Skipped => summary.skipped += 1,
                UnitOutcome::NotStarted => summary.not_started += 1,
                UnitOutcome::Failed(failure) => {
                    summary.failed += 1;
                    report.failures.push(failure);
                }
            }
        }
        if summary.not_started > 0 {
            report.stopped = true;
        }
        Ok(summary)
    }

    /// Pack the tiles of `version` into an archive.
    ///
    /// `output` defaults to `<archive dir>/<name>.pmtiles`, where the name is
    /// `planet` or the subtree root as `z-x-y`.
    pub fn pack(
        &self,
        version: u64,
        subtree: Option<TileCoord>,
        output: Option<PathBuf>,
    ) -> Result<ArchiveSummary> {
        let plan = self.plans.load(version)?;
        let store = self.store_for(version, &plan);
        let mut options = PackOptions::new(plan.min_zoom, plan.max_zoom)
            .with_plan_version(version)
            .with_encoding(self.config.archive.encoding);
        if let Some(root) = subtree {
            options = options.with_subtree(root);
        }
        if let Some(attribution) = &self.config.archive.attribution {
            options.attribution = attribution.clone();
        }
        let out = output.unwrap_or_else(|| {
            self.config
                .archive_dir()
                .join(format!("{}.pmtiles", options.name()))
        });
        if let Some(dir) = out.parent() {
            fs::create_dir_all(dir)?;
        }

        let summary = mapterhorn_archive::pack(&store, &out, &options)?;
        let name = vec![("name", summary.name.clone())];
        metrics::gauge!(metric_defs::ARCHIVE_BYTES.name, &name).set(summary.bytes as f64);
        metrics::gauge!(metric_defs::ARCHIVE_TILES.name, &name).set(summary.addressed_tiles as f64);
        Ok(summary)
    }

    /// Run every stage for `version`, or for a freshly built plan when
    /// `version` is `None`, and write the run report.
    ///
    /// Per-tile failures and archive errors are recorded in the report;
    /// only structural errors are returned.
    pub fn run(&self, version: Option<u64>) -> Result<RunReport> {
        let version = match version {
            Some(v) => self.plans.record(v)?.version,
            None => self.plan()?.version,
        };
        let mut report = RunReport::new(version);

        self.composite(version, &mut report)?;
        if !report.stopped {
            self.downsample(version, &mut report)?;
        }
        if !report.stopped {
            match self
                .config
                .archive_subtree()
                .and_then(|subtree| self.pack(version, subtree, None))
            {
                Ok(summary) => report.archive = Some(summary),
                Err(e) => {
                    error!(version, error = %e, "archive not sealed");
                    report.archive_error = Some(e.to_string());
                }
            }
        }

        self.write_report(&mut report)?;
        Ok(report)
    }

    /// Write `report` to the reports directory.
    pub fn write_report(&self, report: &mut RunReport) -> Result<PathBuf> {
        let path = report.write(&self.config.reports_dir())?;
        info!(
            version = report.plan_version,
            failures = report.failures.len(),
            blocked = report.blocked.len(),
            clean = report.is_clean(),
            path = %path.display(),
            "wrote run report"
        );
        Ok(path)
    }

    /// Per-stage counts and ETA for `version`.
    pub fn status(&self, version: u64) -> Result<VersionStatus> {
        let plan = self.plans.record(version)?;
        let now = chrono::Utc::now();
        let mut stages = Vec::new();
        for stage in Stage::all() {
            stages.push(StageStatus {
                stage,
                counts: self.state.counts(version, stage)?,
                progress: self.state.progress(version, stage, now)?,
            });
        }
        Ok(VersionStatus { plan, stages })
    }
}

fn add_summaries(a: StageSummary, b: StageSummary) -> StageSummary {
    StageSummary {
        done: a.done + b.done,
        skipped: a.skipped + b.skipped,
        failed: a.failed + b.failed,
        not_started: a.not_started + b.not_started,
    }
}
