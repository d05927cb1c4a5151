pub mod error;
pub mod snapshot;

pub use error::MetricsError;
pub use snapshot::{ProcessedMetricSet, RawMetricSet};
