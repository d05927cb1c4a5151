use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricsError {
    #[error("Invalid quantile {0}: must be within [0, 1] and reachable by the data")]
    InvalidQuantile(f64),

    #[error("Invalid quantile label: {0}")]
    InvalidQuantileLabel(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Processing overloaded: dropped processed metrics for interval {interval}")]
    ProcessingOverloaded { interval: DateTime<Utc> },

    #[error("Subscription queue is full")]
    SubscriptionQueueFull,

    #[error("Metric system is already running")]
    AlreadyRunning,

    #[error("Metric system has already been stopped")]
    AlreadyStopped,

    #[error("Metric system is stopped")]
    Stopped,

    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}
