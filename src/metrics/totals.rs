//! All-time running totals that outlive individual intervals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// All-time counter values, fed once per interval by the collector.
#[derive(Default)]
pub struct CounterTotals {
    totals: DashMap<String, AtomicU64>,
}

impl CounterTotals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one interval's increments. Totals only grow (wrapping on overflow).
    pub fn merge(&self, increments: &HashMap<String, u64>) {
        for (name, &amount) in increments {
            // optimistic read, only insert for a new name
            if let Some(total) = self.totals.get(name) {
                total.fetch_add(amount, Ordering::Relaxed);
                continue;
            }
            self.totals
                .entry(name.clone())
                .or_default()
                .fetch_add(amount, Ordering::Relaxed);
        }
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.totals.get(name).map(|t| t.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.totals
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

/// All-time sum and sample count of one histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HistogramTotal {
    pub sum: f64,
    pub count: u64,
}

impl HistogramTotal {
    /// All-time mean, or `None` before the first sample.
    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// All-time histogram sums and counts. Bucket detail is not retained.
#[derive(Default)]
pub struct HistogramTotals {
    totals: DashMap<String, HistogramTotal>,
}

impl HistogramTotals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one interval's sum and count into the running total for `name`.
    pub fn add(&self, name: &str, sum: f64, count: u64) {
        if let Some(mut total) = self.totals.get_mut(name) {
            total.sum += sum;
            total.count = total.count.wrapping_add(count);
            return;
        }
        let mut total = self.totals.entry(name.to_string()).or_default();
        total.sum += sum;
        total.count = total.count.wrapping_add(count);
    }

    pub fn get(&self, name: &str) -> Option<HistogramTotal> {
        self.totals.get(name).map(|t| *t)
    }
}
