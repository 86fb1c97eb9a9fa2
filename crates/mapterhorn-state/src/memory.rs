//! In-memory state store for tests and dry runs.

use crate::{Result, Stage, StageCounts, StateRecord, StateStore, UnitStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

const SHARDS: usize = 16;

type Key = (u64, Stage, String);

/// Hash-sharded in-memory state store.
///
/// Each key lives in one of a fixed number of shards, each behind its own
/// lock, so transitions on different keys rarely contend.
#[derive(Debug)]
pub struct MemoryStateTracker {
    shards: Vec<Mutex<HashMap<Key, StateRecord>>>,
}

impl Default for MemoryStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &Key) -> &Mutex<HashMap<Key, StateRecord>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARDS]
    }

    fn key(version: u64, stage: Stage, unit_id: &str) -> Key {
        (version, stage, unit_id.to_string())
    }

    fn new_record(version: u64, stage: Stage, unit_id: &str, status: UnitStatus) -> StateRecord {
        StateRecord {
            version,
            stage,
            unit_id: unit_id.to_string(),
            status,
            attempts: 0,
            error: None,
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Ids of units in a stage matching `filter`, sorted.
    fn collect_ids(
        &self,
        version: u64,
        stage: Stage,
        filter: impl Fn(UnitStatus) -> bool,
    ) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .values()
                    .filter(|r| r.version == version && r.stage == stage && filter(r.status))
                    .map(|r| r.unit_id.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        ids.sort();
        ids
    }
}

impl StateStore for MemoryStateTracker {
    fn seed(&self, version: u64, stage: Stage, unit_ids: &[String]) -> Result<usize> {
        let mut inserted = 0;
        for id in unit_ids {
            let key = Self::key(version, stage, id);
            let mut shard = self.shard(&key).lock();
            if !shard.contains_key(&key) {
                shard.insert(key, Self::new_record(version, stage, id, UnitStatus::Pending));
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn claim(&self, version: u64, stage: Stage, unit_id: &str) -> Result<bool> {
        let key = Self::key(version, stage, unit_id);
        let mut shard = self.shard(&key).lock();
        let record = shard
            .entry(key)
            .or_insert_with(|| Self::new_record(version, stage, unit_id, UnitStatus::Pending));
        if record.status == UnitStatus::Done {
            return Ok(false);
        }
        record.status = UnitStatus::InProgress;
        record.attempts += 1;
        record.error = None;
        record.updated_at = Utc::now();
        Ok(true)
    }

    fn mark_done(&self, version: u64, stage: Stage, unit_id: &str) -> Result<()> {
        let key = Self::key(version, stage, unit_id);
        let mut shard = self.shard(&key).lock();
        let record = shard.entry(key).or_insert_with(|| {
            let mut r = Self::new_record(version, stage, unit_id, UnitStatus::Pending);
            r.attempts = 1;
            r
        });
        if record.status != UnitStatus::Done {
            let now = Utc::now();
            record.status = UnitStatus::Done;
            record.error = None;
            record.updated_at = now;
            record.completed_at = Some(now);
        }
        Ok(())
    }

    fn mark_failed(&self, version: u64, stage: Stage, unit_id: &str, error: &str) -> Result<()> {
        let key = Self::key(version, stage, unit_id);
        let mut shard = self.shard(&key).lock();
        let record = shard.entry(key).or_insert_with(|| {
            let mut r = Self::new_record(version, stage, unit_id, UnitStatus::Pending);
            r.attempts = 1;
            r
        });
        if record.status != UnitStatus::Done {
            record.status = UnitStatus::Failed;
            record.error = Some(error.to_string());
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    fn status(&self, version: u64, stage: Stage, unit_id: &str) -> Result<Option<StateRecord>> {
        let key = Self::key(version, stage, unit_id);
        Ok(self.shard(&key).lock().get(&key).cloned())
    }

    fn list_pending(&self, version: u64, stage: Stage) -> Result<Vec<String>> {
        Ok(self.collect_ids(version, stage, |s| s != UnitStatus::Done))
    }

    fn list_done(&self, version: u64, stage: Stage) -> Result<Vec<String>> {
        Ok(self.collect_ids(version, stage, |s| s == UnitStatus::Done))
    }

    fn counts(&self, version: u64, stage: Stage) -> Result<StageCounts> {
        let mut counts = StageCounts::default();
        for shard in &self.shards {
            for record in shard.lock().values() {
                if record.version == version && record.stage == stage {
                    counts.add(record.status);
                }
            }
        }
        Ok(counts)
    }

    fn first_done_at(&self, version: u64, stage: Stage) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .shards
            .iter()
            .filter_map(|shard| {
                shard
                    .lock()
                    .values()
                    .filter(|r| r.version == version && r.stage == stage)
                    .filter_map(|r| r.completed_at)
                    .min()
            })
            .min())
    }

    fn discard(&self, version: u64) -> Result<usize> {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|(v, _, _), _| *v != version);
            removed += before - shard.len();
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_and_done() {
        let t = MemoryStateTracker::new();
        assert!(t.claim(1, Stage::Composite, "u").unwrap());
        t.mark_done(1, Stage::Composite, "u").unwrap();
        assert!(!t.claim(1, Stage::Composite, "u").unwrap());
        assert!(t.is_done(1, Stage::Composite, "u").unwrap());
    }

    #[test]
    fn test_counts_and_lists() {
        let t = MemoryStateTracker::new();
        let ids: Vec<String> = (0..20).map(|i| format!("5/{}/0", i)).collect();
        t.seed(3, Stage::Composite, &ids).unwrap();
        for id in &ids[..5] {
            t.claim(3, Stage::Composite, id).unwrap();
            t.mark_done(3, Stage::Composite, id).unwrap();
        }
        t.mark_failed(3, Stage::Composite, &ids[7], "boom").unwrap();

        let counts = t.counts(3, Stage::Composite).unwrap();
        assert_eq!(counts.done, 5);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 14);
        assert_eq!(t.list_pending(3, Stage::Composite).unwrap().len(), 15);

        let done = t.list_done(3, Stage::Composite).unwrap();
        let mut expected: Vec<String> = ids[..5].to_vec();
        expected.sort();
        assert_eq!(done, expected);
        assert!(t.first_done_at(3, Stage::Composite).unwrap().is_some());

        assert_eq!(t.discard(3).unwrap(), 20);
        assert_eq!(t.counts(3, Stage::Composite).unwrap().total(), 0);
    }
}
