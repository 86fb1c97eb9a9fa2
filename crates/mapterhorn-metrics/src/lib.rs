//! Metric definitions for the mapterhorn pipeline.
//!
//! Every metric the pipeline emits is declared here as a [`Metric`] constant
//! so names, units and label keys live in one place. Recording goes through
//! the [`metrics`] facade; with no recorder installed every call is a no-op.
//!
//! # Example
//!
//! ```rust
//! use mapterhorn_metrics::{describe_metrics, metric_defs, MetricLabels};
//!
//! describe_metrics();
//!
//! let labels = MetricLabels::new(3, "composite");
//! metrics::counter!(metric_defs::TILES_COMPOSITED.name, &labels.to_labels()).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

impl MetricKind {
    /// Returns the kind as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration with its metadata.
///
/// ```rust
/// use mapterhorn_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const TILES: Metric = Metric::counter("mapterhorn.example.tiles")
///     .with_description("Tiles seen")
///     .with_unit(Unit::Count)
///     .with_labels(&["version"]);
///
/// assert_eq!(TILES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "mapterhorn.composite.tiles").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// Unit of measurement, if any.
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    /// Declare a counter.
    pub const fn counter(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Counter,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Declare a gauge.
    pub const fn gauge(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Gauge,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Declare a histogram.
    pub const fn histogram(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Histogram,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Register the description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => {
                describe_counter!(self.name, unit, self.description);
            }
            (MetricKind::Counter, None) => {
                describe_counter!(self.name, self.description);
            }
            (MetricKind::Gauge, Some(unit)) => {
                describe_gauge!(self.name, unit, self.description);
            }
            (MetricKind::Gauge, None) => {
                describe_gauge!(self.name, self.description);
            }
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description);
            }
            (MetricKind::Histogram, None) => {
                describe_histogram!(self.name, self.description);
            }
        }
    }
}

/// All metrics emitted by the pipeline.
pub mod metric_defs {
    use super::{Metric, Unit};

    /// Labels carried by every per-stage metric.
    pub const STAGE_LABELS: &[&str] = &["version", "stage"];

    // Compositor

    pub const TILES_COMPOSITED: Metric = Metric::counter("mapterhorn.composite.tiles")
        .with_description("Finest-zoom tiles composited and written")
        .with_unit(Unit::Count)
        .with_labels(STAGE_LABELS);

    pub const CONTRIBUTORS_DROPPED: Metric =
        Metric::counter("mapterhorn.composite.contributors_dropped")
            .with_description("Source files skipped because they could not be read")
            .with_unit(Unit::Count)
            .with_labels(&["version", "stage", "source"]);

    // Downsampler

    pub const TILES_DOWNSAMPLED: Metric = Metric::counter("mapterhorn.downsample.tiles")
        .with_description("Overview tiles produced from their children")
        .with_unit(Unit::Count)
        .with_labels(&["version", "stage", "zoom"]);

    pub const TILES_BLOCKED: Metric = Metric::counter("mapterhorn.downsample.blocked")
        .with_description("Parents left unproduced because a child never completed")
        .with_unit(Unit::Count)
        .with_labels(STAGE_LABELS);

    // Units

    pub const UNITS_FAILED: Metric = Metric::counter("mapterhorn.units.failed")
        .with_description("Units marked failed")
        .with_unit(Unit::Count)
        .with_labels(STAGE_LABELS);

    pub const UNIT_DURATION: Metric = Metric::histogram("mapterhorn.units.duration_ms")
        .with_description("Wall-clock time to produce one tile")
        .with_unit(Unit::Milliseconds)
        .with_labels(STAGE_LABELS);

    pub const SLOW_UNITS: Metric = Metric::counter("mapterhorn.units.slow")
        .with_description("Units flagged by the watchdog for running too long")
        .with_unit(Unit::Count)
        .with_labels(STAGE_LABELS);

    // Archive

    pub const ARCHIVE_BYTES: Metric = Metric::gauge("mapterhorn.archive.bytes")
        .with_description("Size of the last sealed archive")
        .with_unit(Unit::Bytes)
        .with_labels(&["name"]);

    pub const ARCHIVE_TILES: Metric = Metric::gauge("mapterhorn.archive.tiles")
        .with_description("Tiles addressed by the last sealed archive")
        .with_unit(Unit::Count)
        .with_labels(&["name"]);

    /// Every metric, for bulk registration.
    pub const ALL: &[&Metric] = &[
        &TILES_COMPOSITED,
        &CONTRIBUTORS_DROPPED,
        &TILES_DOWNSAMPLED,
        &TILES_BLOCKED,
        &UNITS_FAILED,
        &UNIT_DURATION,
        &SLOW_UNITS,
        &ARCHIVE_BYTES,
        &ARCHIVE_TILES,
    ];
}

/// Labels identifying the plan version and stage a metric belongs to.
#[derive(Debug, Clone)]
pub struct MetricLabels {
    pub version: u64,
    pub stage: String,
}

impl MetricLabels {
    pub fn new(version: u64, stage: impl Into<String>) -> Self {
        Self {
            version,
            stage: stage.into(),
        }
    }

    /// Convert to `(key, value)` pairs for the `metrics` macros.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![
            ("version", self.version.to_string()),
            ("stage", self.stage.clone()),
        ]
    }

    /// Base labels plus `extra`.
    pub fn with(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        let mut labels = self.to_labels();
        labels.extend_from_slice(extra);
        labels
    }
}

/// Register descriptions for every metric in [`metric_defs::ALL`].
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_labels() {
        let labels = MetricLabels::new(7, "downsample");
        let pairs = labels.to_labels();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.contains(&("version", "7".to_string())));
        assert!(pairs.contains(&("stage", "downsample".to_string())));

        let extended = labels.with(&[("zoom", "11".to_string())]);
        assert_eq!(extended.len(), 3);
        assert!(extended.contains(&("zoom", "11".to_string())));
    }

    #[test]
    fn test_metric_names_unique_and_namespaced() {
        let mut seen = HashSet::new();
        for metric in metric_defs::ALL {
            assert!(metric.name.starts_with("mapterhorn."), "{}", metric.name);
            assert!(!metric.description.is_empty(), "{}", metric.name);
            assert!(seen.insert(metric.name), "duplicate {}", metric.name);
        }
    }

    #[test]
    fn test_kinds() {
        assert_eq!(metric_defs::UNIT_DURATION.kind, MetricKind::Histogram);
        assert_eq!(metric_defs::ARCHIVE_BYTES.kind, MetricKind::Gauge);
        assert_eq!(metric_defs::TILES_COMPOSITED.kind.to_string(), "counter");
    }

    #[test]
    fn test_describe_without_recorder() {
        describe_metrics();
    }
}
