//! Recording, compression and derivation of metrics.
//!
//! Producers write through an [`Aggregator`]; every interval the reaper
//! collects a [`crate::contracts::RawMetricSet`] from it and
//! [`derive_processed`] turns that into human-readable statistics.

pub mod aggregator;
pub mod codec;
pub mod percentile;
pub mod processing;
pub mod quantiles;
pub mod runtime;
pub mod timer;
pub mod totals;

pub use aggregator::{Aggregator, GaugeFn};
pub use codec::{compress, decompress};
pub use percentile::{percentile, Proportion, Proportions};
pub use processing::derive_processed;
pub use quantiles::Quantiles;
pub use runtime::register_runtime_gauges;
pub use timer::TimerToken;
pub use totals::{CounterTotals, HistogramTotal, HistogramTotals};
