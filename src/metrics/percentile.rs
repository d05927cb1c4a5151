//! Weighted percentile estimation over decoded histogram buckets.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::contracts::MetricsError;

use super::codec::decompress;

/// A decoded bucket value with its occurrence count in one interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Proportion {
    pub value: f64,
    pub count: u64,
}

impl Proportion {
    pub fn new(value: f64, count: u64) -> Self {
        Self { value, count }
    }
}

/// Returns the value of the first pair (ascending by value) whose cumulative
/// share of `total_count` reaches `quantile`.
///
/// Fails with [`MetricsError::InvalidQuantile`] when every pair is exhausted
/// without reaching the target, which happens for quantiles above 1 or when
/// `total_count` does not cover the pairs.
pub fn percentile(
    total_count: u64,
    proportions: &mut [Proportion],
    quantile: f64,
) -> Result<f64, MetricsError> {
    proportions.sort_by(by_value);
    quantile_of_sorted(total_count, proportions, quantile)
}

fn quantile_of_sorted(
    total_count: u64,
    sorted: &[Proportion],
    quantile: f64,
) -> Result<f64, MetricsError> {
    let mut so_far = 0u64;
    for proportion in sorted {
        so_far += proportion.count;
        if so_far as f64 / total_count as f64 >= quantile {
            return Ok(proportion.value);
        }
    }
    Err(MetricsError::InvalidQuantile(quantile))
}

fn by_value(a: &Proportion, b: &Proportion) -> Ordering {
    a.value.total_cmp(&b.value)
}

/// Decoded buckets of one histogram, sorted once and queried many times.
#[derive(Debug, Clone)]
pub struct Proportions {
    sorted: Vec<Proportion>,
    total_count: u64,
    sum: f64,
}

impl Proportions {
    /// Decodes and sorts the buckets of one histogram interval.
    pub fn from_buckets(buckets: &HashMap<i16, u64>) -> Self {
        let mut sorted: Vec<Proportion> = buckets
            .iter()
            .map(|(&bucket, &count)| Proportion::new(decompress(bucket), count))
            .collect();
        sorted.sort_by(by_value);

        // summed in sorted order so the result does not depend on map iteration
        let mut total_count = 0u64;
        let mut sum = 0.0;
        for p in &sorted {
            total_count += p.count;
            sum += p.value * p.count as f64;
        }

        Self {
            sorted,
            total_count,
            sum,
        }
    }

    #[inline]
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    #[inline]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Mean of all samples, or `None` for an empty interval.
    pub fn average(&self) -> Option<f64> {
        (self.total_count > 0).then(|| self.sum / self.total_count as f64)
    }

    /// Estimates `quantile` over the shared sort.
    pub fn quantile(&self, quantile: f64) -> Result<f64, MetricsError> {
        quantile_of_sorted(self.total_count, &self.sorted, quantile)
    }
}
