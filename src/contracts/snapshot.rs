use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-interval aggregate, broadcast as-is to raw subscribers.
///
/// Histogram buckets are keyed by their compressed value; see
/// [`crate::metrics::codec`] for the encoding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawMetricSet {
    /// Interval boundary at which this snapshot was collected.
    pub time: DateTime<Utc>,
    /// All-time counter totals, including this interval.
    pub counters: HashMap<String, u64>,
    /// Counter increments observed during this interval only.
    pub rates: HashMap<String, u64>,
    /// Compressed bucket -> occurrence count, per histogram.
    pub histograms: HashMap<String, HashMap<i16, u64>>,
    /// Gauge values sampled once at collection.
    pub gauges: HashMap<String, f64>,
}

impl RawMetricSet {
    /// Creates an empty snapshot for `time`.
    pub fn empty(time: DateTime<Utc>) -> Self {
        Self {
            time,
            counters: HashMap::new(),
            rates: HashMap::new(),
            histograms: HashMap::new(),
            gauges: HashMap::new(),
        }
    }
}

/// Human-readable statistics derived from one [`RawMetricSet`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedMetricSet {
    pub time: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
}

impl ProcessedMetricSet {
    /// Looks up a derived metric by name.
    #[inline]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}
