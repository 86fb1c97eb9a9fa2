//! Versioned plan storage under `<work>/plans/`.
//!
//! Layout:
//!
//! ```text
//! plans/
//!   ledger.json          # versions, digests, creation times
//!   1/plan.json
//!   2/plan.json
//! ```
//!
//! Versions are allocated monotonically and never reused, even after a
//! plan is discarded.

use crate::plan::{digest_bytes, WorkPlan};
use crate::{PlanError, Result};
use chrono::{DateTime, Utc};
use mapterhorn_dem::write_atomic;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const LEDGER_FILE: &str = "ledger.json";
const LOCK_FILE: &str = "ledger.lock";
const PLAN_FILE: &str = "plan.json";

/// How long to wait for another process to release the ledger.
const LOCK_WAIT: Duration = Duration::from_secs(30);
/// A lock file older than this was left behind by a crashed process.
const LOCK_STALE: Duration = Duration::from_secs(300);

/// Ledger entry for one stored plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    /// Plan version.
    pub version: u64,
    /// Hex SHA-256 of `plan.json`.
    pub digest: String,
    /// Digest of the registry the plan came from.
    pub registry_digest: String,
    /// Number of work items.
    pub tile_count: usize,
    /// When the plan was saved.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    next_version: u64,
    plans: Vec<PlanRecord>,
}

/// Directory of versioned plans.
#[derive(Debug, Clone)]
pub struct PlanStore {
    root: PathBuf,
}

impl PlanStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the artifacts of `version`.
    pub fn version_dir(&self, version: u64) -> PathBuf {
        self.root.join(version.to_string())
    }

    fn read_ledger(&self) -> Result<Ledger> {
        let path = self.root.join(LEDGER_FILE);
        if !path.exists() {
            return Ok(Ledger {
                next_version: 1,
                plans: Vec::new(),
            });
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    fn write_ledger(&self, ledger: &Ledger) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(ledger)?;
        write_atomic(&self.root.join(LEDGER_FILE), &bytes)?;
        Ok(())
    }

    fn lock(&self) -> Result<LedgerLock> {
        LedgerLock::acquire(&self.root.join(LOCK_FILE))
    }

    /// Reserve the next version number.
    ///
    /// Safe against concurrent callers in other processes sharing the store.
    pub fn allocate_version(&self) -> Result<u64> {
        let _lock = self.lock()?;
        let mut ledger = self.read_ledger()?;
        let version = ledger.next_version.max(1);
        ledger.next_version = version + 1;
        self.write_ledger(&ledger)?;
        Ok(version)
    }

    /// Store `plan` under a freshly allocated version and return it.
    pub fn save(&self, plan: &WorkPlan) -> Result<u64> {
        let version = self.allocate_version()?;
        self.save_as(version, plan)?;
        Ok(version)
    }

    /// Store `plan` under an already allocated version.
    pub fn save_as(&self, version: u64, plan: &WorkPlan) -> Result<PlanRecord> {
        let bytes = plan.to_json_bytes()?;
        let digest = digest_bytes(&bytes);
        write_atomic(&self.version_dir(version).join(PLAN_FILE), &bytes)?;

        let _lock = self.lock()?;
        let mut ledger = self.read_ledger()?;
        if let Some(previous) = ledger.plans.iter().find(|r| r.digest == digest) {
            info!(
                version,
                identical_to = previous.version,
                "plan identical to an existing version"
            );
        }
        let record = PlanRecord {
            version,
            digest,
            registry_digest: plan.registry_digest.clone(),
            tile_count: plan.len(),
            created_at: Utc::now(),
        };
        ledger.plans.retain(|r| r.version != version);
        ledger.plans.push(record.clone());
        ledger.plans.sort_by_key(|r| r.version);
        ledger.next_version = ledger.next_version.max(version + 1);
        self.write_ledger(&ledger)?;

        info!(version, tiles = record.tile_count, "saved plan");
        Ok(record)
    }

    /// Load a plan, checking the file against the digest recorded in the ledger.
    pub fn load(&self, version: u64) -> Result<WorkPlan> {
        let record = self.record(version)?;
        let bytes = match fs::read(self.version_dir(version).join(PLAN_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PlanError::UnknownVersion(version))
            }
            Err(e) => return Err(e.into()),
        };
        let actual = digest_bytes(&bytes);
        if actual != record.digest {
            return Err(PlanError::DigestMismatch {
                version,
                expected: record.digest,
                actual,
            });
        }
        WorkPlan::from_json_bytes(&bytes)
    }

    /// Ledger entry for `version`.
    pub fn record(&self, version: u64) -> Result<PlanRecord> {
        self.read_ledger()?
            .plans
            .into_iter()
            .find(|r| r.version == version)
            .ok_or(PlanError::UnknownVersion(version))
    }

    /// All stored plans, oldest first.
    pub fn versions(&self) -> Result<Vec<PlanRecord>> {
        Ok(self.read_ledger()?.plans)
    }

    /// Delete a plan and its directory. Its version is not reused.
    pub fn discard(&self, version: u64) -> Result<()> {
        let _lock = self.lock()?;
        let mut ledger = self.read_ledger()?;
        let before = ledger.plans.len();
        ledger.plans.retain(|r| r.version != version);
        if ledger.plans.len() == before {
            return Err(PlanError::UnknownVersion(version));
        }
        let dir = self.version_dir(version);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        self.write_ledger(&ledger)?;
        info!(version, "discarded plan");
        Ok(())
    }
}

/// Exclusive hold on the ledger, released on drop.
struct LedgerLock {
    path: PathBuf,
}

impl LedgerLock {
    fn acquire(path: &Path) -> Result<Self> {
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(path) {
                        warn!(path = %path.display(), "removing stale ledger lock");
                        let _ = fs::remove_file(path);
                        continue;
                    }
                    if started.elapsed() > LOCK_WAIT {
                        return Err(PlanError::LedgerLocked(path.display().to_string()));
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map_or(false, |age| age > LOCK_STALE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Contributor, FileContribution, WorkItem};
    use crate::BlendConfig;
    use mapterhorn_dem::TileCoord;

    fn empty_plan(digest: &str) -> WorkPlan {
        WorkPlan {
            min_zoom: 0,
            max_zoom: 4,
            tile_size: 256,
            buffer_px: 16,
            blend: BlendConfig::default(),
            registry_digest: digest.to_string(),
            items: Vec::new(),
            rejected: Vec::new(),
        }
    }

    #[test]
    fn test_versions_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::open(dir.path()).unwrap();
        assert_eq!(store.save(&empty_plan("a")).unwrap(), 1);
        assert_eq!(store.save(&empty_plan("b")).unwrap(), 2);
        store.discard(2).unwrap();
        assert_eq!(store.save(&empty_plan("c")).unwrap(), 3);

        let versions: Vec<u64> = store.versions().unwrap().iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 3]);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::open(dir.path()).unwrap();
        let plan = empty_plan("abc");
        let version = store.save(&plan).unwrap();
        assert_eq!(store.load(version).unwrap(), plan);
        assert_eq!(store.record(version).unwrap().digest, plan.digest().unwrap());
    }

    #[test]
    fn test_tampered_plan_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::open(dir.path()).unwrap();
        let version = store.save(&empty_plan("abc")).unwrap();
        let other = empty_plan("xyz").to_json_bytes().unwrap();
        fs::write(store.version_dir(version).join(PLAN_FILE), other).unwrap();
        assert!(matches!(
            store.load(version),
            Err(PlanError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_awkward_floats_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::open(dir.path()).unwrap();
        let overlaps = [0.1 + 0.2, 1.0 / 3.0, 2f64.sqrt() / 7.0, 5.949307045138672e-15, 0.7071067811865476];
        let mut plan = empty_plan("floats");
        plan.items = overlaps
            .iter()
            .enumerate()
            .map(|(i, &overlap)| WorkItem {
                tile: TileCoord::new(6, i as u32, 9),
                contributors: vec![Contributor {
                    source_id: "s".to_string(),
                    resolution: 1.0 / 3.0,
                    overlap,
                    files: vec![FileContribution {
                        path: PathBuf::from("s.tif"),
                        overlap: overlap / 3.0,
                    }],
                }],
            })
            .collect();

        let version = store.save(&plan).unwrap();
        let loaded = store.load(version).unwrap();
        assert_eq!(loaded, plan);
        let on_disk = fs::read(store.version_dir(version).join(PLAN_FILE)).unwrap();
        assert_eq!(loaded.to_json_bytes().unwrap(), on_disk);
    }

    #[test]
    fn test_concurrent_allocation_never_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = PlanStore::open(dir.path()).unwrap();
                std::thread::spawn(move || {
                    (0..10)
                        .map(|_| store.allocate_version().unwrap())
                        .collect::<Vec<u64>>()
                })
            })
            .collect();
        let mut versions: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        versions.sort_unstable();
        assert_eq!(versions, (1..=40).collect::<Vec<u64>>());
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_discard_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::open(dir.path()).unwrap();
        assert!(matches!(store.discard(9), Err(PlanError::UnknownVersion(9))));
        assert!(matches!(store.load(9), Err(PlanError::UnknownVersion(9))));
    }
}
