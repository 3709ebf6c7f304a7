use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};
use village_agent::Coordinator;

/// Takes a performance sample every `performance_interval` and hands it to
/// the coordinator's telemetry sinks.
pub struct PerformanceService {
    coordinator: Arc<Coordinator>,
    interval: Duration,
}

impl PerformanceService {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        let interval = coordinator.config().performance_interval();
        Self { coordinator, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_ms = self.interval.as_millis() as u64, "PerformanceService started");

        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.coordinator.is_disposed() {
                info!("Coordinator disposed, PerformanceService stopping");
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    if let Some(sample) = self.coordinator.sample_performance().await {
                        debug!(
                            agents = sample.agents.len(),
                            tasks = sample.tasks.total,
                            queued = sample.queues.messages,
                            "Performance sampled"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    info!("PerformanceService shutting down");
                    break;
                }
            }
        }
    }
}
