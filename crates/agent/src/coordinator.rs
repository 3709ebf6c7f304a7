use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use village_core::{CoordinationMessage, CoordinatorConfig, Error, MessageType, Result};

use crate::handler::WorkerHandler;
use crate::health::{AgentHealth, AgentStatus, HealthMonitor};
use crate::registry::AgentRegistry;
use crate::router::{MessageQueue, Router};
use crate::task_manager::{AgentTask, TaskManager};
use crate::telemetry::{QueueDepths, SystemStatus, TelemetrySink};

/// Sender id used for requests created by [`Coordinator::process_input`].
pub const INPUT_SOURCE: &str = "smart_input";

/// Shown to the user whenever input could not be handed to a worker.
pub const FALLBACK_REPLY: &str =
    "抱歉，我暂时无法回复您的问题。请稍后再试，或者您可以尝试换个方式提问 🤔";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    Text,
    Voice,
}

impl std::fmt::Display for InputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputType::Text => write!(f, "text"),
            InputType::Voice => write!(f, "voice"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInput {
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    pub content: String,
    pub session_id: String,
    /// Milliseconds since the epoch. Zero means "now".
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub output_format: Option<String>,
}

impl UserInput {
    pub fn text(session_id: &str, content: &str) -> Self {
        Self {
            input_type: InputType::Text,
            content: content.to_string(),
            session_id: session_id.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            output_format: None,
        }
    }

    pub fn voice(session_id: &str, content: &str) -> Self {
        Self {
            input_type: InputType::Voice,
            ..Self::text(session_id, content)
        }
    }
}

/// Enqueue-time result of [`Coordinator::process_input`]. The worker's
/// actual reply arrives later through [`Coordinator::subscribe`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputOutcome {
    pub success: bool,
    #[serde(rename = "responseTime")]
    pub response_time_ms: u64,
    pub strategy: String,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Latest performance sample kept on the coordinator.
pub type PerformanceSample = SystemStatus;

/// Owns the registry, health monitor, task tracker and message router of one
/// worker pool. Build it once at the composition root and share it as
/// `Arc<Coordinator>`.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<AgentRegistry>,
    health: Arc<HealthMonitor>,
    tasks: TaskManager,
    queue: Arc<MessageQueue>,
    router: Arc<Router>,
    events: broadcast::Sender<CoordinationMessage>,
    shutdown_tx: broadcast::Sender<()>,
    sinks: RwLock<Vec<Arc<dyn TelemetrySink>>>,
    last_sample: Mutex<Option<PerformanceSample>>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(config.subscriber_buffer.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(AgentRegistry::new());
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            config.heartbeat_timeout(),
            events.clone(),
        ));
        let tasks = TaskManager::new();
        let queue = Arc::new(MessageQueue::new());
        let router = Arc::new(Router::new(
            &config,
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&health),
            tasks.clone(),
            events.clone(),
        ));

        Self {
            config,
            registry,
            health,
            tasks,
            queue,
            router,
            events,
            shutdown_tx,
            sinks: RwLock::new(Vec::new()),
            last_sample: Mutex::new(None),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Spawn the dispatch loop. Only the first call spawns; later calls
    /// return `None`. Must be called from inside a tokio runtime.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.is_disposed() || self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let router = Arc::clone(&self.router);
        let shutdown = self.shutdown_tx.subscribe();
        info!(workers = self.registry.len(), "Coordinator started");
        Some(tokio::spawn(router.run(shutdown)))
    }

    /// Shutdown signal for background services (heartbeat, sampler).
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Application-level feed of `response`, `error` and `status_update` messages.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationMessage> {
        self.events.subscribe()
    }

    /// Register (or replace) a worker. New workers start `idle`; replacing a
    /// worker keeps its health record.
    pub async fn register_worker<I, S>(
        &self,
        id: &str,
        handler: Arc<dyn WorkerHandler>,
        capabilities: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        let replaced = self.registry.register(id, handler, capabilities);
        self.health.ensure_record(id).await;
        info!(agent_id = %id, replaced, "Worker registered");
        Ok(())
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Enqueue a message and return its id. Does not wait for processing.
    pub async fn send_message(&self, message: CoordinationMessage) -> Result<String> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        let id = self.queue.push(message).await?;
        debug!(message_id = %id, "Message enqueued");
        Ok(id)
    }

    /// Enqueue a request and wait for its `response` (the `result` value) or
    /// `error` reply. With retries configured the wait covers every attempt.
    pub async fn request(
        &self,
        mut message: CoordinationMessage,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        if message.msg_type != MessageType::Request {
            return Err(Error::Other(format!(
                "only request messages get a reply, got {}",
                message.msg_type
            )));
        }
        message.ensure_identity();
        let id = message.id.clone();
        let reply = self.router.await_reply(&id).await;
        if let Err(e) = self.queue.push(message).await {
            self.router.forget_reply(&id).await;
            return Err(e);
        }

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(received) => received,
                Err(_) => {
                    self.router.forget_reply(&id).await;
                    return Err(Error::Timeout(format!(
                        "no reply to {} within {}ms",
                        id,
                        limit.as_millis()
                    )));
                }
            },
            None => reply.await,
        };
        received.unwrap_or(Err(Error::Disposed))
    }

    /// Wrap user input as a request to the default worker. Success means the
    /// request was accepted, not that the worker answered.
    pub async fn process_input(&self, input: UserInput) -> InputOutcome {
        let started = Instant::now();
        let strategy = match input.input_type {
            InputType::Voice => "voice_processing",
            InputType::Text => "text_processing",
        };
        let worker = self.config.default_worker.clone();

        let payload = serde_json::json!({
            "uid": format!("user_{}", input.session_id),
            "text": input.content,
            "contextSpot": self.config.default_context_spot,
            "inputType": input.input_type,
        });
        let mut message = CoordinationMessage::request(INPUT_SOURCE, &worker, payload);
        message.id = village_core::message::new_message_id("input");
        if input.timestamp > 0 {
            message.timestamp = input.timestamp;
        }

        let sent = if self.registry.contains(&worker) {
            self.send_message(message).await
        } else {
            Err(Error::NotFound(format!("worker {}", worker)))
        };

        let response_time_ms = started.elapsed().as_millis() as u64;
        match sent {
            Ok(message_id) => InputOutcome {
                success: true,
                response_time_ms,
                strategy: strategy.to_string(),
                cached: false,
                error: None,
                message_id: Some(message_id),
            },
            Err(e) => {
                warn!(session_id = %input.session_id, error = %e, "Input not accepted");
                InputOutcome {
                    success: false,
                    response_time_ms,
                    strategy: strategy.to_string(),
                    cached: false,
                    error: Some(FALLBACK_REPLY.to_string()),
                    message_id: None,
                }
            }
        }
    }

    pub async fn agent_health(&self) -> BTreeMap<String, AgentHealth> {
        self.health.snapshot().await
    }

    pub async fn worker_health(&self, agent_id: &str) -> Option<AgentHealth> {
        self.health.get(agent_id).await
    }

    pub async fn system_status(&self) -> SystemStatus {
        SystemStatus {
            agents: self.health.snapshot().await,
            tasks: self.tasks.counts_by_status().await,
            queues: QueueDepths {
                messages: self.queue.len().await,
                tasks: self.tasks.len().await,
            },
            timestamp: Utc::now(),
        }
    }

    /// Every tracked task, newest first.
    pub async fn task_queue(&self) -> Vec<AgentTask> {
        self.tasks.list(None).await
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// Messages waiting for dispatch, head first.
    pub async fn message_queue(&self) -> Vec<CoordinationMessage> {
        self.queue.snapshot().await
    }

    /// Ask every worker to drop its caches. Failures are logged and counted.
    pub async fn clear_cache(&self) -> usize {
        let mut failed = 0;
        for worker in self.registry.all() {
            if let Err(e) = worker.handler.clear_cache().await {
                warn!(agent_id = %worker.id, error = %e, "Cache clear failed");
                failed += 1;
            }
        }
        info!(workers = self.registry.len(), failed, "Worker caches cleared");
        failed
    }

    /// Operator-triggered recovery of a worker in `error` or `offline`.
    pub async fn recover(&self, agent_id: &str) -> Result<AgentStatus> {
        match self.health.status(agent_id).await {
            None => Err(Error::NotFound(format!("worker {}", agent_id))),
            Some(_) => Ok(self.health.recover(agent_id).await),
        }
    }

    /// Take a worker out of rotation. Requests to it are dropped and the
    /// heartbeat sweep skips it until [`Coordinator::recover`] is called.
    pub async fn take_offline(&self, agent_id: &str) -> Result<()> {
        if self.health.transition(agent_id, AgentStatus::Offline).await {
            info!(agent_id, "Worker taken offline");
            Ok(())
        } else {
            Err(Error::NotFound(format!("worker {}", agent_id)))
        }
    }

    /// One heartbeat tick: fail silent workers, probe and ping the rest.
    pub async fn run_health_sweep(&self) {
        if self.is_disposed() {
            return;
        }
        self.health.sweep(&self.queue).await;
    }

    pub fn add_sink(&self, sink: Arc<dyn TelemetrySink>) {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        debug!(sink = sink.name(), "Telemetry sink added");
        sinks.push(sink);
    }

    /// One sampler tick: prune old finished tasks, snapshot the system and
    /// publish the snapshot to every sink.
    pub async fn sample_performance(&self) -> Option<PerformanceSample> {
        if self.is_disposed() {
            return None;
        }
        self.tasks.cleanup_finished(self.config.task_retention()).await;
        let sample = self.system_status().await;
        *self.last_sample.lock().await = Some(sample.clone());

        let sinks: Vec<Arc<dyn TelemetrySink>> = {
            let sinks = self.sinks.read().unwrap_or_else(|e| e.into_inner());
            sinks.clone()
        };
        for sink in sinks {
            if let Err(e) = sink.record(&sample).await {
                warn!(sink = sink.name(), error = %e, "Telemetry sink failed");
            }
        }
        Some(sample)
    }

    pub async fn last_sample(&self) -> Option<PerformanceSample> {
        self.last_sample.lock().await.clone()
    }

    /// Stop the dispatch loop and background services and drop all state.
    /// Safe to call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!("Coordinator already disposed");
            return;
        }
        let _ = self.shutdown_tx.send(());
        self.queue.close().await;
        self.router.fail_all_pending().await;
        self.registry.clear();
        self.health.clear().await;
        self.tasks.clear().await;
        *self.last_sample.lock().await = None;
        info!("Coordinator disposed");
    }
}
