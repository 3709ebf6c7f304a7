use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};
use village_agent::Coordinator;

/// Periodic liveness sweep over every registered worker.
pub struct HeartbeatService {
    coordinator: Arc<Coordinator>,
    interval: Duration,
}

impl HeartbeatService {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        let interval = coordinator.config().heartbeat_interval();
        Self { coordinator, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self) {
        debug!("Running heartbeat sweep");
        self.coordinator.run_health_sweep().await;
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_ms = self.interval.as_millis() as u64, "HeartbeatService started");

        // First sweep one full interval after start.
        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.coordinator.is_disposed() {
                info!("Coordinator disposed, HeartbeatService stopping");
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    info!("HeartbeatService shutting down");
                    break;
                }
            }
        }
    }
}
