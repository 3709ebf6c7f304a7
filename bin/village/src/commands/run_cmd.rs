use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use village_agent::LogSink;
use village_core::{Config, Paths};
use village_scheduler::{HeartbeatService, PerformanceService};

use crate::workers::build_coordinator;

/// Run the coordinator and its background services until Ctrl-C or the
/// optional deadline, then dispose.
pub async fn run(seconds: Option<u64>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let coordinator = build_coordinator(&config).await?;
    coordinator.add_sink(Arc::new(LogSink));

    let router_handle = coordinator.start();
    let heartbeat = Arc::new(HeartbeatService::new(Arc::clone(&coordinator)));
    let sampler = Arc::new(PerformanceService::new(Arc::clone(&coordinator)));
    let heartbeat_handle = tokio::spawn(heartbeat.run_loop(coordinator.shutdown_receiver()));
    let sampler_handle = tokio::spawn(sampler.run_loop(coordinator.shutdown_receiver()));

    info!(
        workers = coordinator.registry().len(),
        heartbeat_ms = config.coordinator.heartbeat_interval_ms,
        "Coordinator running, press Ctrl-C to stop"
    );

    match seconds {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!(seconds = secs, "Run time elapsed");
                }
                res = tokio::signal::ctrl_c() => {
                    res?;
                    info!("Shutdown signal received");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
        }
    }

    coordinator.dispose().await;

    let mut handles = vec![("heartbeat", heartbeat_handle), ("sampler", sampler_handle)];
    if let Some(handle) = router_handle {
        handles.push(("router", handle));
    }
    for (name, handle) in handles {
        if let Err(e) = handle.await {
            warn!(service = name, error = %e, "Service task ended abnormally");
        }
    }
    info!("Coordinator stopped");
    Ok(())
}
