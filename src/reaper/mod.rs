//! The metric system and its reaper loop.
//!
//! The reaper sleeps until the next wall-clock interval boundary, collects a
//! raw snapshot, broadcasts it to raw subscribers and hands processing of the
//! same snapshot to the worker pool. Producers never wait on any of this.

pub mod pool;
pub mod schedule;
pub mod subscribers;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::contracts::{MetricsError, ProcessedMetricSet, RawMetricSet};
use crate::metrics::{derive_processed, register_runtime_gauges, Aggregator, Quantiles, TimerToken};

pub use pool::{Job, WorkerPool};
pub use subscribers::{BroadcastReport, SubscriberRegistry, SubscriptionChange, SubscriptionId};

/// Configuration for a [`MetricSystem`].
#[derive(Debug, Clone)]
pub struct MetricSystemConfig {
    /// Time between collections, aligned to the Unix epoch.
    pub interval: Duration,
    /// Register process memory and thread gauges at construction.
    pub runtime_gauges: bool,
    /// Number of processing workers.
    pub workers: usize,
    /// Processing jobs that may wait before an interval is dropped.
    pub job_queue_capacity: usize,
    /// Pending subscription changes accepted between two ticks, per kind.
    pub subscription_queue_capacity: usize,
    /// Consecutive failed deliveries before a subscriber is evicted.
    pub eviction_threshold: u32,
    /// Quantiles reported for every histogram.
    pub quantiles: Quantiles,
}

impl Default for MetricSystemConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            runtime_gauges: false,
            workers: default_workers(),
            job_queue_capacity: 16,
            subscription_queue_capacity: 64,
            eviction_threshold: 3,
            quantiles: Quantiles::default(),
        }
    }
}

impl MetricSystemConfig {
    /// Default configuration with a different interval.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    /// Creates a config from environment variables.
    ///
    /// Environment variables:
    /// - `LOGMETRICS_INTERVAL_MS`: collection interval (default: 60000)
    /// - `LOGMETRICS_RUNTIME_GAUGES`: `true`/`1` to enable process gauges
    /// - `LOGMETRICS_WORKERS`: processing workers (default: max(cpus/4, 4))
    /// - `LOGMETRICS_JOB_QUEUE`: processing queue capacity (default: 16)
    /// - `LOGMETRICS_SUBSCRIPTION_QUEUE`: subscription queue capacity (default: 64)
    /// - `LOGMETRICS_EVICTION_THRESHOLD`: failed deliveries before eviction (default: 3)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            interval: std::env::var("LOGMETRICS_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.interval),
            runtime_gauges: std::env::var("LOGMETRICS_RUNTIME_GAUGES")
                .ok()
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default.runtime_gauges),
            workers: std::env::var("LOGMETRICS_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.workers),
            job_queue_capacity: std::env::var("LOGMETRICS_JOB_QUEUE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.job_queue_capacity),
            subscription_queue_capacity: std::env::var("LOGMETRICS_SUBSCRIPTION_QUEUE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.subscription_queue_capacity),
            eviction_threshold: std::env::var("LOGMETRICS_EVICTION_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.eviction_threshold),
            quantiles: default.quantiles,
        }
    }

    fn validate(&self) -> Result<(), MetricsError> {
        let invalid = |msg: &str| Err(MetricsError::InvalidConfig(msg.to_string()));
        if self.interval.is_zero() {
            return invalid("interval must be non-zero");
        }
        if self.workers == 0 {
            return invalid("workers must be non-zero");
        }
        if self.job_queue_capacity == 0 || self.subscription_queue_capacity == 0 {
            return invalid("queue capacities must be non-zero");
        }
        if self.eviction_threshold == 0 {
            return invalid("eviction threshold must be non-zero");
        }
        Ok(())
    }
}

/// One worker per four cores, and never fewer than four.
pub fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus / 4).max(4)
}

/// Subscription receivers held until the reaper takes them at start.
struct PendingRequests {
    raw: mpsc::Receiver<SubscriptionChange<RawMetricSet>>,
    processed: mpsc::Receiver<SubscriptionChange<ProcessedMetricSet>>,
}

/// Collects metrics from producers and distributes interval snapshots.
///
/// Lifecycle: construct, optionally [`set_quantiles`](Self::set_quantiles),
/// [`start`](Self::start), then [`stop`](Self::stop) exactly once. A stopped
/// system cannot be restarted.
pub struct MetricSystem {
    config: MetricSystemConfig,
    quantiles: RwLock<Arc<Quantiles>>,
    aggregator: Arc<Aggregator>,
    processed_subscribers: Arc<Mutex<SubscriberRegistry<ProcessedMetricSet>>>,
    raw_requests: mpsc::Sender<SubscriptionChange<RawMetricSet>>,
    processed_requests: mpsc::Sender<SubscriptionChange<ProcessedMetricSet>>,
    pending: Mutex<Option<PendingRequests>>,
    next_subscription: AtomicU64,
    reaping: Arc<AtomicBool>,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MetricSystem {
    /// Creates a system broadcasting every `interval`.
    pub fn new(interval: Duration, runtime_gauges: bool) -> Result<Self, MetricsError> {
        Self::with_config(MetricSystemConfig {
            interval,
            runtime_gauges,
            ..MetricSystemConfig::default()
        })
    }

    pub fn with_config(config: MetricSystemConfig) -> Result<Self, MetricsError> {
        config.validate()?;

        let (raw_requests, raw_pending) = mpsc::channel(config.subscription_queue_capacity);
        let (processed_requests, processed_pending) =
            mpsc::channel(config.subscription_queue_capacity);

        let aggregator = Arc::new(Aggregator::new());
        if config.runtime_gauges {
            register_runtime_gauges(&aggregator);
        }

        Ok(Self {
            quantiles: RwLock::new(Arc::new(config.quantiles.clone())),
            aggregator,
            processed_subscribers: Arc::new(Mutex::new(SubscriberRegistry::new(
                "processed",
                config.eviction_threshold,
            ))),
            raw_requests,
            processed_requests,
            pending: Mutex::new(Some(PendingRequests {
                raw: raw_pending,
                processed: processed_pending,
            })),
            next_subscription: AtomicU64::new(1),
            reaping: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            task_handle: Mutex::new(None),
            config,
        })
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// The underlying store, for collaborators that record directly.
    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Whether the reaper loop is currently running.
    pub fn is_running(&self) -> bool {
        self.reaping.load(Ordering::SeqCst)
    }

    /// Replaces the reported quantiles. Only allowed before [`start`](Self::start).
    pub fn set_quantiles(&self, quantiles: Quantiles) -> Result<(), MetricsError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(MetricsError::Stopped);
        }
        let task_handle = self.task_handle.lock();
        if task_handle.is_some() {
            return Err(MetricsError::AlreadyRunning);
        }
        *self.quantiles.write() = Arc::new(quantiles);
        Ok(())
    }

    pub fn quantiles(&self) -> Arc<Quantiles> {
        Arc::clone(&self.quantiles.read())
    }

    // ---------------------------------------------------------------------
    // Recording
    // ---------------------------------------------------------------------

    /// Adds `amount` to a counter. Reported as a total and as `<name>_rate`.
    #[inline]
    pub fn record_counter(&self, name: &str, amount: u64) {
        self.aggregator.record_counter(name, amount);
    }

    /// Records one sample of a continuous value.
    #[inline]
    pub fn record_histogram(&self, name: &str, value: f64) {
        self.aggregator.record_histogram(name, value);
    }

    /// Starts a timer whose duration is recorded under `name` in nanoseconds.
    pub fn start_timer(&self, name: impl Into<String>) -> TimerToken {
        self.aggregator.start_timer(name)
    }

    pub fn register_gauge<F>(&self, name: impl Into<String>, gauge: F)
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.aggregator.register_gauge(name, gauge);
    }

    pub fn deregister_gauge(&self, name: &str) -> bool {
        self.aggregator.deregister_gauge(name)
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    /// Registers `queue` for raw snapshots from the next tick on.
    ///
    /// The system keeps `queue` and never blocks on it. A queue that stays
    /// full for `eviction_threshold` ticks in a row is dropped; once no other
    /// senders exist the consumer's `recv()` returns `None`.
    pub fn subscribe_raw(
        &self,
        queue: mpsc::Sender<Arc<RawMetricSet>>,
    ) -> Result<SubscriptionId, MetricsError> {
        let id = self.next_subscription_id()?;
        submit(&self.raw_requests, SubscriptionChange::Subscribe(id, queue))?;
        Ok(id)
    }

    pub fn unsubscribe_raw(&self, id: SubscriptionId) -> Result<(), MetricsError> {
        self.ensure_not_stopped()?;
        submit(&self.raw_requests, SubscriptionChange::Unsubscribe(id))
    }

    /// Registers `queue` for processed snapshots; same delivery rules as
    /// [`subscribe_raw`](Self::subscribe_raw).
    pub fn subscribe_processed(
        &self,
        queue: mpsc::Sender<Arc<ProcessedMetricSet>>,
    ) -> Result<SubscriptionId, MetricsError> {
        let id = self.next_subscription_id()?;
        submit(&self.processed_requests, SubscriptionChange::Subscribe(id, queue))?;
        Ok(id)
    }

    pub fn unsubscribe_processed(&self, id: SubscriptionId) -> Result<(), MetricsError> {
        self.ensure_not_stopped()?;
        submit(&self.processed_requests, SubscriptionChange::Unsubscribe(id))
    }

    fn next_subscription_id(&self) -> Result<SubscriptionId, MetricsError> {
        self.ensure_not_stopped()?;
        Ok(SubscriptionId(
            self.next_subscription.fetch_add(1, Ordering::Relaxed),
        ))
    }

    fn ensure_not_stopped(&self) -> Result<(), MetricsError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(MetricsError::Stopped);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Spawns the reaper and worker pool on the current tokio runtime.
    ///
    /// Calling `start` on a running system does nothing.
    pub fn start(&self) -> Result<(), MetricsError> {
        self.ensure_not_stopped()?;
        let runtime = Handle::try_current().map_err(|e| MetricsError::NoRuntime(e.to_string()))?;

        let mut task_handle = self.task_handle.lock();
        if task_handle.is_some() {
            return Ok(());
        }
        let Some(pending) = self.pending.lock().take() else {
            return Err(MetricsError::Stopped);
        };

        let pool = WorkerPool::spawn(
            &runtime,
            self.config.workers,
            self.config.job_queue_capacity,
        );
        let reaper = Reaper {
            interval: self.config.interval,
            aggregator: Arc::clone(&self.aggregator),
            raw_subscribers: SubscriberRegistry::new("raw", self.config.eviction_threshold),
            raw_requests: pending.raw,
            processed_requests: pending.processed,
            publisher: Arc::new(ProcessedPublisher {
                aggregator: Arc::clone(&self.aggregator),
                quantiles: self.quantiles(),
                subscribers: Arc::clone(&self.processed_subscribers),
            }),
            pool,
            shutdown: self.shutdown.clone(),
            reaping: Arc::clone(&self.reaping),
        };

        self.reaping.store(true, Ordering::SeqCst);
        *task_handle = Some(runtime.spawn(reaper.run()));

        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            workers = self.config.workers,
            "Metric system started"
        );
        Ok(())
    }

    /// Signals shutdown and waits for the reaper and any queued processing
    /// to finish.
    ///
    /// The shutdown signal fires exactly once: a second call returns
    /// [`MetricsError::AlreadyStopped`]. Stopping a system that was never
    /// started is allowed and makes it terminal.
    pub async fn stop(&self) -> Result<(), MetricsError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(MetricsError::AlreadyStopped);
        }
        self.shutdown.cancel();
        self.pending.lock().take();

        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| MetricsError::TaskJoin(e.to_string()))?;
        }

        tracing::info!("Metric system stopped");
        Ok(())
    }
}

impl Drop for MetricSystem {
    fn drop(&mut self) {
        // a dropped system must not leave its reaper running
        self.shutdown.cancel();
    }
}

fn submit<T>(
    requests: &mpsc::Sender<SubscriptionChange<T>>,
    change: SubscriptionChange<T>,
) -> Result<(), MetricsError> {
    requests.try_send(change).map_err(|e| match e {
        TrySendError::Full(_) => MetricsError::SubscriptionQueueFull,
        TrySendError::Closed(_) => MetricsError::Stopped,
    })
}

/// Derives and broadcasts the processed view of one interval.
struct ProcessedPublisher {
    aggregator: Arc<Aggregator>,
    quantiles: Arc<Quantiles>,
    subscribers: Arc<Mutex<SubscriberRegistry<ProcessedMetricSet>>>,
}

impl ProcessedPublisher {
    fn publish(&self, raw: &RawMetricSet) {
        let processed = Arc::new(derive_processed(
            raw,
            self.aggregator.histogram_totals(),
            &self.quantiles,
        ));
        let report = self.subscribers.lock().broadcast(&processed);
        tracing::debug!(
            interval = %raw.time,
            metrics = processed.metrics.len(),
            delivered = report.delivered,
            dropped = report.dropped,
            evicted = report.evicted,
            disconnected = report.disconnected,
            "Broadcast processed metrics"
        );
    }
}

struct Reaper {
    interval: Duration,
    aggregator: Arc<Aggregator>,
    raw_subscribers: SubscriberRegistry<RawMetricSet>,
    raw_requests: mpsc::Receiver<SubscriptionChange<RawMetricSet>>,
    processed_requests: mpsc::Receiver<SubscriptionChange<ProcessedMetricSet>>,
    publisher: Arc<ProcessedPublisher>,
    pool: WorkerPool,
    shutdown: CancellationToken,
    reaping: Arc<AtomicBool>,
}

impl Reaper {
    async fn run(mut self) {
        tracing::info!("Reaper started");

        loop {
            let wait = schedule::until_next_boundary(SystemTime::now(), self.interval);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Reaper shutdown requested");
                    break;
                }
            }
            self.tick();
        }

        self.reaping.store(false, Ordering::SeqCst);
        if let Err(e) = self.pool.shutdown().await {
            tracing::error!(error = %e, "Worker pool did not shut down cleanly");
        }
        tracing::info!("Reaper stopped");
    }

    fn tick(&mut self) {
        let raw_changes = self.raw_subscribers.drain(&mut self.raw_requests);
        let processed_changes = self
            .publisher
            .subscribers
            .lock()
            .drain(&mut self.processed_requests);

        let time = schedule::interval_floor(SystemTime::now(), self.interval);
        let raw = Arc::new(self.aggregator.collect_interval(time));

        let report = self.raw_subscribers.broadcast(&raw);
        tracing::debug!(
            interval = %time,
            raw_changes = raw_changes,
            processed_changes = processed_changes,
            delivered = report.delivered,
            dropped = report.dropped,
            evicted = report.evicted,
            disconnected = report.disconnected,
            "Broadcast raw metrics"
        );

        let publisher = Arc::clone(&self.publisher);
        let job: Job = Box::new(move || publisher.publish(&raw));
        match self.pool.try_submit(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let e = MetricsError::ProcessingOverloaded { interval: time };
                tracing::error!(error = %e, "Processing is falling behind, not blocking the reaper");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(interval = %time, "Worker pool closed, processed metrics dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = MetricSystemConfig::default();
        assert_eq!(config.interval, Duration::from_secs(60));
        assert!(!config.runtime_gauges);
        assert!(config.workers >= 4);
        assert_eq!(config.job_queue_capacity, 16);
        assert_eq!(config.subscription_queue_capacity, 64);
        assert_eq!(config.eviction_threshold, 3);
        assert_eq!(config.quantiles.len(), 9);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let zero_interval = MetricSystemConfig::with_interval(Duration::ZERO);
        assert!(matches!(
            MetricSystem::with_config(zero_interval),
            Err(MetricsError::InvalidConfig(_))
        ));

        let no_workers = MetricSystemConfig {
            workers: 0,
            ..MetricSystemConfig::default()
        };
        assert!(MetricSystem::with_config(no_workers).is_err());
    }

    #[test]
    fn test_start_requires_runtime() {
        let system = MetricSystem::new(Duration::from_secs(1), false).unwrap();
        assert!(matches!(system.start(), Err(MetricsError::NoRuntime(_))));
        assert!(!system.is_running());
    }

    #[test]
    fn test_subscription_queue_full() {
        let config = MetricSystemConfig {
            subscription_queue_capacity: 1,
            ..MetricSystemConfig::default()
        };
        let system = MetricSystem::with_config(config).unwrap();
        let (tx_a, _rx_a) = mpsc::channel(1);
        let (tx_b, _rx_b) = mpsc::channel(1);

        assert!(system.subscribe_raw(tx_a).is_ok());
        assert_eq!(
            system.subscribe_raw(tx_b).unwrap_err(),
            MetricsError::SubscriptionQueueFull
        );
    }

    /// A reaper with one raw and one processed subscriber, ticked by hand.
    fn reaper_with_pool(
        pool: WorkerPool,
    ) -> (
        Reaper,
        mpsc::Receiver<Arc<RawMetricSet>>,
        mpsc::Receiver<Arc<ProcessedMetricSet>>,
    ) {
        let aggregator = Arc::new(Aggregator::new());
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let (processed_tx, processed_rx) = mpsc::channel(16);

        let mut raw_subscribers = SubscriberRegistry::new("raw", 3);
        raw_subscribers.apply(SubscriptionChange::Subscribe(SubscriptionId(1), raw_tx));
        let mut processed_subscribers = SubscriberRegistry::new("processed", 3);
        processed_subscribers.apply(SubscriptionChange::Subscribe(
            SubscriptionId(2),
            processed_tx,
        ));

        // no pending changes: both request queues are already closed
        let (_, raw_requests) = mpsc::channel(1);
        let (_, processed_requests) = mpsc::channel(1);

        let reaper = Reaper {
            interval: Duration::from_secs(60),
            aggregator: Arc::clone(&aggregator),
            raw_subscribers,
            raw_requests,
            processed_requests,
            publisher: Arc::new(ProcessedPublisher {
                aggregator,
                quantiles: Arc::new(Quantiles::default()),
                subscribers: Arc::new(Mutex::new(processed_subscribers)),
            }),
            pool,
            shutdown: CancellationToken::new(),
            reaping: Arc::new(AtomicBool::new(true)),
        };
        (reaper, raw_rx, processed_rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_job_queue_drops_processed_but_not_raw() {
        let pool = WorkerPool::spawn(&Handle::current(), 1, 1);
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        // occupy the only worker so the next job fills the queue
        pool.try_submit(Box::new(move || {
            started_tx.send(()).ok();
            release_rx.recv().ok();
        }))
        .unwrap_or_else(|_| panic!("blocking job should be accepted"));
        tokio::task::spawn_blocking(move || started_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();

        let (mut reaper, mut raw_rx, mut processed_rx) = reaper_with_pool(pool);
        for tick in 1..=4u64 {
            reaper.aggregator.record_counter("ticks", tick);
            reaper.tick();
            let raw = raw_rx.try_recv().expect("raw snapshot on every tick");
            assert_eq!(raw.rates["ticks"], tick);
        }
        assert!(processed_rx.try_recv().is_err());

        release_tx.send(()).unwrap();
        let Reaper { pool, .. } = reaper;
        pool.shutdown().await.unwrap();

        // only the first interval made it into the queue
        let processed = processed_rx.try_recv().expect("queued interval processed");
        assert_eq!(processed.get("ticks_rate"), Some(1.0));
        assert!(processed_rx.try_recv().is_err());
    }

    #[test]
    fn test_runtime_gauges_flag() {
        let with = MetricSystem::new(Duration::from_secs(1), true).unwrap();
        assert_eq!(with.aggregator().gauge_count(), 3);
        let without = MetricSystem::new(Duration::from_secs(1), false).unwrap();
        assert_eq!(without.aggregator().gauge_count(), 0);
    }
}
