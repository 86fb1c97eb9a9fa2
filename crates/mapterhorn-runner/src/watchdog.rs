//! Watchdog thread flagging units that run too long.
//!
//! Workers register each unit for as long as they hold its [`UnitGuard`].
//! A background thread scans the active units and logs a warning the first
//! time one exceeds the timeout, so a hung read or a pathological tile shows
//! up in the log while the run is still going.

use mapterhorn_metrics::{metric_defs, MetricLabels};
use mapterhorn_state::Stage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::warn;

/// A unit currently being worked on.
#[derive(Debug, Clone)]
pub struct ActiveUnit {
    pub version: u64,
    pub stage: Stage,
    pub tile: String,
    pub started_at: Instant,
    alerted: bool,
}

/// State shared between workers and the watchdog thread.
#[derive(Default)]
pub struct WatchdogState {
    active: Mutex<HashMap<u64, ActiveUnit>>,
    next_token: AtomicU64,
    stop_flag: AtomicBool,
    alert_count: AtomicU64,
}

impl WatchdogState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit; it stays active until the guard drops.
    pub fn begin(self: &Arc<Self>, version: u64, stage: Stage, tile: &str) -> UnitGuard {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(
            token,
            ActiveUnit {
                version,
                stage,
                tile: tile.to_string(),
                started_at: Instant::now(),
                alerted: false,
            },
        );
        UnitGuard {
            state: Arc::clone(self),
            token,
        }
    }

    /// Number of units currently registered.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Alerts fired so far.
    pub fn alert_count(&self) -> u64 {
        self.alert_count.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    pub fn should_stop(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed)
    }

    /// Flag every unit past `timeout` that has not been flagged yet.
    fn check(&self, timeout: Duration) {
        let mut active = self.active.lock();
        for unit in active.values_mut() {
            let elapsed = unit.started_at.elapsed();
            if unit.alerted || elapsed < timeout {
                continue;
            }
            unit.alerted = true;
            let alert = self.alert_count.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                alert,
                version = unit.version,
                stage = %unit.stage,
                tile = %unit.tile,
                elapsed_secs = elapsed.as_secs_f64(),
                "unit running longer than {:.0}s",
                timeout.as_secs_f64()
            );
            let labels = MetricLabels::new(unit.version, unit.stage.as_str());
            metrics::counter!(metric_defs::SLOW_UNITS.name, &labels.to_labels()).increment(1);
        }
    }
}

/// Keeps a unit registered with the watchdog while alive.
pub struct UnitGuard {
    state: Arc<WatchdogState>,
    token: u64,
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        self.state.active.lock().remove(&self.token);
    }
}

/// Watchdog thread handle.
pub struct Watchdog {
    state: Arc<WatchdogState>,
    thread_handle: Option<JoinHandle<()>>,
    timeout: Duration,
}

impl Watchdog {
    /// Start the watchdog thread.
    pub fn start(timeout: Duration) -> Self {
        let state = Arc::new(WatchdogState::new());
        let watchdog_state = Arc::clone(&state);
        let check_interval = (timeout / 2).clamp(Duration::from_millis(1), Duration::from_millis(500));

        let thread_handle = thread::spawn(move || {
            while !watchdog_state.should_stop() {
                thread::sleep(check_interval);
                watchdog_state.check(timeout);
            }
        });

        Watchdog {
            state,
            thread_handle: Some(thread_handle),
            timeout,
        }
    }

    pub fn state(&self) -> &Arc<WatchdogState> {
        &self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Stop the thread and wait for it. Returns the number of alerts fired.
    pub fn stop(mut self) -> u64 {
        self.state.stop();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.state.alert_count()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.state.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_unregisters_on_drop() {
        let state = Arc::new(WatchdogState::new());
        let a = state.begin(1, Stage::Composite, "3/1/1");
        let b = state.begin(1, Stage::Downsample, "2/0/0");
        assert_eq!(state.active_count(), 2);
        drop(a);
        assert_eq!(state.active_count(), 1);
        drop(b);
        assert_eq!(state.active_count(), 0);
    }

    #[test]
    fn test_slow_unit_alerted_once() {
        let watchdog = Watchdog::start(Duration::from_millis(20));
        let guard = watchdog.state().begin(1, Stage::Composite, "3/5/3");
        thread::sleep(Duration::from_millis(200));
        assert_eq!(watchdog.state().alert_count(), 1);
        drop(guard);
        assert_eq!(watchdog.stop(), 1);
    }

    #[test]
    fn test_fast_units_not_alerted() {
        let watchdog = Watchdog::start(Duration::from_secs(60));
        for i in 0..10 {
            let _guard = watchdog.state().begin(1, Stage::Composite, &format!("3/{}/0", i));
        }
        assert_eq!(watchdog.stop(), 0);
    }
}
