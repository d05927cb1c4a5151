use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use logmetrics::{MetricSystem, MetricSystemConfig, ProcessedMetricSet};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("logmetrics=info".parse()?))
        .init();

    let config = MetricSystemConfig {
        runtime_gauges: true,
        ..MetricSystemConfig::from_env()
    };
    tracing::info!(
        interval_ms = config.interval.as_millis() as u64,
        workers = config.workers,
        "logmetrics reporter starting"
    );

    let system = Arc::new(MetricSystem::with_config(config)?);

    let (tx, mut rx) = mpsc::channel::<Arc<ProcessedMetricSet>>(8);
    system.subscribe_processed(tx)?;
    let reporter = tokio::spawn(async move {
        while let Some(processed) = rx.recv().await {
            match serde_json::to_string(&*processed) {
                Ok(json) => tracing::info!(metrics = %json, "Processed metrics"),
                Err(e) => tracing::error!(error = %e, "Failed to serialize processed metrics"),
            }
        }
        tracing::info!("Processed metrics stream closed");
    });

    system.start()?;

    // heartbeat so an idle reporter still has something to show
    let heartbeat = {
        let system = Arc::clone(&system);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let timer = system.start_timer("heartbeat.latency");
                tokio::task::yield_now().await;
                timer.stop();
                system.record_counter("heartbeat", 1);
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    heartbeat.abort();
    if let Err(e) = heartbeat.await {
        if !e.is_cancelled() {
            tracing::error!(error = %e, "Heartbeat task failed");
        }
    }
    system.stop().await?;
    drop(system);
    reporter.await?;

    Ok(())
}
