use std::sync::Arc;
use std::time::{Duration, Instant};

use super::aggregator::Aggregator;

/// Measures one duration and records it as a histogram sample.
///
/// Tokens share nothing with each other, so any number of them may be
/// running under the same name at once.
#[must_use = "a timer records nothing until it is stopped"]
pub struct TimerToken {
    name: String,
    start: Instant,
    aggregator: Arc<Aggregator>,
}

impl TimerToken {
    pub(crate) fn start(name: impl Into<String>, aggregator: Arc<Aggregator>) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
            aggregator,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records the elapsed time in nanoseconds under the token's name and
    /// returns it.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        self.aggregator.record_duration(&self.name, elapsed);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::metrics::codec::decompress;

    #[test]
    fn test_stop_records_elapsed_nanoseconds() {
        let agg = Arc::new(Aggregator::new());
        let token = agg.start_timer("sleep");
        std::thread::sleep(Duration::from_millis(20));
        let elapsed = token.stop();

        let raw = agg.collect_interval(Utc::now());
        let buckets = &raw.histograms["sleep"];
        assert_eq!(buckets.values().sum::<u64>(), 1);

        let (&bucket, _) = buckets.iter().next().unwrap();
        let recorded = decompress(bucket);
        let measured = elapsed.as_nanos() as f64;
        assert!((recorded - measured).abs() / measured <= 0.02);
    }

    #[test]
    fn test_concurrent_tokens_are_independent() {
        let agg = Arc::new(Aggregator::new());
        let outer = agg.start_timer("op");
        let inner = agg.start_timer("op");
        assert_eq!(inner.name(), "op");
        let inner_elapsed = inner.stop();
        std::thread::sleep(Duration::from_millis(2));
        let outer_elapsed = outer.stop();
        assert!(outer_elapsed > inner_elapsed);

        let raw = agg.collect_interval(Utc::now());
        assert_eq!(raw.histograms["op"].values().sum::<u64>(), 2);
    }
}
