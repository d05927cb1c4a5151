//! In-process metrics aggregation and distribution.
//!
//! Application code records counters, histogram samples, timers and gauges
//! on a [`MetricSystem`]. Once per wall-clock-aligned interval the system
//! broadcasts a [`RawMetricSet`] to raw subscribers and, from a worker pool,
//! a [`ProcessedMetricSet`] of sums, averages and percentiles to processed
//! subscribers. Recording never blocks, and subscribers that stop draining
//! their queues are evicted rather than slowing anyone down.

pub mod contracts;
pub mod metrics;
pub mod reaper;

pub use contracts::{MetricsError, ProcessedMetricSet, RawMetricSet};
pub use metrics::{Aggregator, Quantiles, TimerToken};
pub use reaper::{MetricSystem, MetricSystemConfig, SubscriptionId};
