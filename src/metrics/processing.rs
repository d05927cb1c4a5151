//! Derivation of processed statistics from a raw interval snapshot.

use std::collections::BTreeMap;

use crate::contracts::{ProcessedMetricSet, RawMetricSet};

use super::percentile::Proportions;
use super::quantiles::Quantiles;
use super::totals::HistogramTotals;

/// Builds the processed view of `raw`.
///
/// Output keys:
/// - counters as-is, interval increments as `<name>_rate`
/// - per histogram `<name>_sum`, `<name>_count`, `<name>_avg`, one key per
///   quantile label and the all-time `<name>_agg_sum`, `<name>_agg_count`,
///   `<name>_agg_avg`
/// - gauges as-is
///
/// An empty histogram interval reports sum and count only. Quantiles that
/// cannot be computed are logged and left out.
pub fn derive_processed(
    raw: &RawMetricSet,
    totals: &HistogramTotals,
    quantiles: &Quantiles,
) -> ProcessedMetricSet {
    let mut metrics = BTreeMap::new();

    for (name, &count) in &raw.counters {
        metrics.insert(name.clone(), count as f64);
    }

    for (name, &count) in &raw.rates {
        metrics.insert(format!("{}_rate", name), count as f64);
    }

    for (name, buckets) in &raw.histograms {
        let proportions = Proportions::from_buckets(buckets);

        metrics.insert(format!("{}_sum", name), proportions.sum());
        metrics.insert(format!("{}_count", name), proportions.total_count() as f64);

        if let Some(average) = proportions.average() {
            metrics.insert(format!("{}_avg", name), average);

            for (label, q) in quantiles.labelled(name) {
                match proportions.quantile(q) {
                    Ok(value) => {
                        metrics.insert(label, value);
                    }
                    Err(e) => {
                        tracing::error!(histogram = %name, label = %label, error = %e, "Unable to calculate quantile");
                    }
                }
            }
        }

        if let Some(total) = totals.get(name) {
            if let Some(average) = total.average() {
                metrics.insert(format!("{}_agg_avg", name), average);
                metrics.insert(format!("{}_agg_count", name), total.count as f64);
                metrics.insert(format!("{}_agg_sum", name), total.sum);
            }
        }
    }

    for (name, &value) in &raw.gauges {
        metrics.insert(name.clone(), value);
    }

    ProcessedMetricSet {
        time: raw.time,
        metrics,
    }
}
