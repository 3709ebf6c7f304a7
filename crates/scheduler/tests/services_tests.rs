use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use village_agent::{
    handler_fn, AgentStatus, Coordinator, SystemStatus, TelemetrySink, WorkerHandler,
};
use village_core::{CoordinationMessage, CoordinatorConfig, Error, MessageType, Result};
use village_scheduler::{HeartbeatService, PerformanceService};

fn ok_worker() -> Arc<dyn WorkerHandler> {
    Arc::new(handler_fn(|_| async { Ok::<_, Error>(Value::Null) }))
}

struct FailingProbe;

#[async_trait]
impl WorkerHandler for FailingProbe {
    async fn handle(&self, _payload: &Value) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn probe(&self) -> Result<()> {
        Err(Error::Other("probe refused".to_string()))
    }
}

async fn coordinator_with(id: &str, handler: Arc<dyn WorkerHandler>) -> Arc<Coordinator> {
    let coordinator = Arc::new(Coordinator::new(CoordinatorConfig::default()));
    coordinator
        .register_worker(id, handler, Vec::<String>::new())
        .await
        .unwrap();
    coordinator
}

fn status_transitions(events: &mut broadcast::Receiver<CoordinationMessage>) -> Vec<String> {
    let mut seen = Vec::new();
    while let Ok(msg) = events.try_recv() {
        if msg.msg_type == MessageType::StatusUpdate {
            seen.push(msg.payload["to"].as_str().unwrap_or_default().to_string());
        }
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn test_silent_worker_is_failed_and_recovered() {
    // Dispatch loop not started: heartbeats are queued but never delivered.
    let coordinator = coordinator_with("A", ok_worker()).await;
    let mut events = coordinator.subscribe();

    let service = Arc::new(HeartbeatService::new(Arc::clone(&coordinator)));
    let handle = tokio::spawn(service.run_loop(coordinator.shutdown_receiver()));

    // Sweeps at 5s, 10s and 15s see no timeout yet.
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert!(status_transitions(&mut events).is_empty());
    assert_eq!(coordinator.worker_health("A").await.unwrap().error_count, 0);

    // The sweep at 20s does.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(status_transitions(&mut events), vec!["error", "recovering", "idle"]);

    let health = coordinator.worker_health("A").await.unwrap();
    assert_eq!(health.status, AgentStatus::Idle);
    assert_eq!(health.error_count, 1);
    assert!(health.last_error.unwrap().contains("Heartbeat timeout"));

    coordinator.dispose().await;
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_keep_running_worker_alive() {
    let coordinator = coordinator_with("A", ok_worker()).await;
    coordinator.start();

    let service = Arc::new(HeartbeatService::new(Arc::clone(&coordinator)));
    let handle = tokio::spawn(service.run_loop(coordinator.shutdown_receiver()));

    tokio::time::sleep(Duration::from_secs(60)).await;
    let health = coordinator.worker_health("A").await.unwrap();
    assert_eq!(health.status, AgentStatus::Idle);
    assert_eq!(health.error_count, 0);
    assert_eq!(health.success_count, 0);

    coordinator.dispose().await;
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_takes_failure_path() {
    let coordinator = coordinator_with("B", Arc::new(FailingProbe)).await;
    coordinator.start();

    let service = Arc::new(HeartbeatService::new(Arc::clone(&coordinator)));
    let handle = tokio::spawn(service.run_loop(coordinator.shutdown_receiver()));

    tokio::time::sleep(Duration::from_secs(6)).await;
    let health = coordinator.worker_health("B").await.unwrap();
    assert_eq!(health.error_count, 1);
    assert_eq!(health.last_error.as_deref(), Some("probe refused"));
    assert_eq!(health.status, AgentStatus::Idle);

    coordinator.dispose().await;
    handle.await.unwrap();
}

#[derive(Default)]
struct RecordingSink {
    samples: StdMutex<Vec<SystemStatus>>,
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn record(&self, status: &SystemStatus) -> Result<()> {
        self.samples.lock().unwrap().push(status.clone());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_sampler_publishes_every_interval() {
    let coordinator = coordinator_with("A", ok_worker()).await;
    let sink = Arc::new(RecordingSink::default());
    coordinator.add_sink(Arc::clone(&sink) as Arc<dyn TelemetrySink>);

    let service = Arc::new(PerformanceService::new(Arc::clone(&coordinator)));
    let handle = tokio::spawn(service.run_loop(coordinator.shutdown_receiver()));

    tokio::time::sleep(Duration::from_secs(25)).await;
    {
        let samples = sink.samples.lock().unwrap();
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.agents.contains_key("A")));
    }
    assert!(coordinator.last_sample().await.is_some());

    coordinator.dispose().await;
    handle.await.unwrap();
    assert!(coordinator.last_sample().await.is_none());
}

#[tokio::test]
async fn test_services_exit_when_already_disposed() {
    let coordinator = coordinator_with("A", ok_worker()).await;
    let shutdown = coordinator.shutdown_receiver();
    coordinator.dispose().await;

    let heartbeat = Arc::new(HeartbeatService::new(Arc::clone(&coordinator)));
    heartbeat.run_loop(shutdown).await;

    let sampler = Arc::new(PerformanceService::new(Arc::clone(&coordinator)));
    sampler.run_loop(coordinator.shutdown_receiver()).await;
}
