//! Per-interval accumulation of counters, histograms and gauges.
//!
//! Producers write into interval caches through a shared read lock on the
//! cache pointer; new names are created with an atomic get-or-insert on the
//! inner map. The collector takes the write lock only long enough to swap
//! each cache for an empty one, so every write lands in exactly one interval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::contracts::RawMetricSet;

use super::codec::compress;
use super::percentile::Proportions;
use super::timer::TimerToken;
use super::totals::{CounterTotals, HistogramTotals};

/// A gauge callback, sampled once per interval.
pub type GaugeFn = Arc<dyn Fn() -> f64 + Send + Sync>;

type CounterCache = DashMap<String, AtomicU64>;
type HistogramCache = DashMap<String, DashMap<i16, AtomicU64>>;

/// Concurrent store behind every recording operation.
#[derive(Default)]
pub struct Aggregator {
    counters: RwLock<CounterCache>,
    histograms: RwLock<HistogramCache>,
    gauges: Mutex<HashMap<String, GaugeFn>>,
    counter_totals: CounterTotals,
    histogram_totals: HistogramTotals,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `amount` to the named counter for the current interval.
    #[inline]
    pub fn record_counter(&self, name: &str, amount: u64) {
        let cache = self.counters.read();
        if let Some(counter) = cache.get(name) {
            counter.fetch_add(amount, Ordering::Relaxed);
            return;
        }
        cache
            .entry(name.to_string())
            .or_default()
            .fetch_add(amount, Ordering::Relaxed);
    }

    /// Records one histogram sample for the current interval.
    #[inline]
    pub fn record_histogram(&self, name: &str, value: f64) {
        let bucket = compress(value);
        let cache = self.histograms.read();
        if let Some(buckets) = cache.get(name) {
            increment_bucket(&buckets, bucket);
            return;
        }
        let buckets = cache.entry(name.to_string()).or_default().downgrade();
        increment_bucket(&buckets, bucket);
    }

    /// Records a duration sample in nanoseconds.
    #[inline]
    pub fn record_duration(&self, name: &str, elapsed: Duration) {
        self.record_histogram(name, elapsed.as_nanos() as f64);
    }

    /// Starts a timer that records into this store when stopped.
    pub fn start_timer(self: &Arc<Self>, name: impl Into<String>) -> TimerToken {
        TimerToken::start(name, Arc::clone(self))
    }

    /// Installs (or replaces) the gauge callback for `name`.
    ///
    /// Callbacks run while the gauge table is locked, so they must not
    /// register or deregister gauges themselves.
    pub fn register_gauge<F>(&self, name: impl Into<String>, gauge: F)
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.gauges.lock().insert(name.into(), Arc::new(gauge));
    }

    /// Removes the gauge callback for `name`. Returns whether one existed.
    pub fn deregister_gauge(&self, name: &str) -> bool {
        self.gauges.lock().remove(name).is_some()
    }

    pub fn gauge_count(&self) -> usize {
        self.gauges.lock().len()
    }

    pub fn counter_totals(&self) -> &CounterTotals {
        &self.counter_totals
    }

    pub fn histogram_totals(&self) -> &HistogramTotals {
        &self.histogram_totals
    }

    /// Closes the current interval.
    ///
    /// Swaps out both caches, folds the drained values into the cumulative
    /// stores and samples every gauge once.
    pub fn collect_interval(&self, time: DateTime<Utc>) -> RawMetricSet {
        let drained_counters = std::mem::take(&mut *self.counters.write());
        let rates: HashMap<String, u64> = drained_counters
            .into_iter()
            .map(|(name, counter)| (name, counter.into_inner()))
            .collect();
        self.counter_totals.merge(&rates);
        let counters = self.counter_totals.snapshot();

        let drained_histograms = std::mem::take(&mut *self.histograms.write());
        let histograms: HashMap<String, HashMap<i16, u64>> = drained_histograms
            .into_iter()
            .map(|(name, buckets)| {
                let buckets = buckets
                    .into_iter()
                    .map(|(bucket, count)| (bucket, count.into_inner()))
                    .collect();
                (name, buckets)
            })
            .collect();
        for (name, buckets) in &histograms {
            let proportions = Proportions::from_buckets(buckets);
            self.histogram_totals
                .add(name, proportions.sum(), proportions.total_count());
        }

        let gauges = self.sample_gauges();

        tracing::debug!(
            interval = %time,
            counters = rates.len(),
            histograms = histograms.len(),
            gauges = gauges.len(),
            "Collected interval"
        );

        RawMetricSet {
            time,
            counters,
            rates,
            histograms,
            gauges,
        }
    }

    fn sample_gauges(&self) -> HashMap<String, f64> {
        let gauges = self.gauges.lock();
        gauges
            .iter()
            .map(|(name, gauge)| (name.clone(), gauge()))
            .collect()
    }
}

#[inline]
fn increment_bucket(buckets: &DashMap<i16, AtomicU64>, bucket: i16) {
    if let Some(count) = buckets.get(&bucket) {
        count.fetch_add(1, Ordering::Relaxed);
        return;
    }
    buckets
        .entry(bucket)
        .or_default()
        .fetch_add(1, Ordering::Relaxed);
}
