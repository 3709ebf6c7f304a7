use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use village_core::{CoordinationMessage, CoordinatorConfig, Error, MessageType, Result};

use crate::health::{AgentStatus, HealthMonitor};
use crate::registry::AgentRegistry;
use crate::task_manager::{TaskManager, TaskTransition};

struct QueueState {
    messages: VecDeque<CoordinationMessage>,
    closed: bool,
}

/// Single global FIFO shared by every producer. Drained by one [`Router`].
pub struct MessageQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append to the tail, filling in id/timestamp when missing.
    pub async fn push(&self, mut message: CoordinationMessage) -> Result<String> {
        message.ensure_identity();
        let id = message.id.clone();
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(Error::Disposed);
            }
            state.messages.push_back(message);
        }
        self.notify.notify_one();
        Ok(id)
    }

    pub async fn pop(&self) -> Option<CoordinationMessage> {
        self.state.lock().await.messages.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> Vec<CoordinationMessage> {
        self.state.lock().await.messages.iter().cloned().collect()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Reject further pushes and drop everything still queued.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.messages.clear();
        }
        self.notify.notify_waiters();
    }

    /// Wait for a push, or at most `poll`.
    async fn wait(&self, poll: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

type ReplyWaiter = oneshot::Sender<Result<Value>>;

/// Dispatches queued messages to workers one at a time, in arrival order.
pub struct Router {
    queue: Arc<MessageQueue>,
    registry: Arc<AgentRegistry>,
    health: Arc<HealthMonitor>,
    tasks: TaskManager,
    events: broadcast::Sender<CoordinationMessage>,
    pending: Mutex<HashMap<String, ReplyWaiter>>,
    config: CoordinatorConfig,
}

impl Router {
    pub fn new(
        config: &CoordinatorConfig,
        queue: Arc<MessageQueue>,
        registry: Arc<AgentRegistry>,
        health: Arc<HealthMonitor>,
        tasks: TaskManager,
        events: broadcast::Sender<CoordinationMessage>,
    ) -> Self {
        Self {
            queue,
            registry,
            health,
            tasks,
            events,
            pending: Mutex::new(HashMap::new()),
            config: config.clone(),
        }
    }

    /// Register interest in the reply to `message_id`.
    pub async fn await_reply(&self, message_id: &str) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(message_id.to_string(), tx);
        rx
    }

    pub async fn forget_reply(&self, message_id: &str) {
        self.pending.lock().await.remove(message_id);
    }

    pub async fn pending_replies(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Fail every outstanding reply waiter.
    pub async fn fail_all_pending(&self) {
        let waiters: Vec<ReplyWaiter> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in waiters {
            let _ = tx.send(Err(Error::Disposed));
        }
    }

    async fn resolve(&self, message_id: &str, outcome: Result<Value>) {
        let waiter = self.pending.lock().await.remove(message_id);
        if let Some(tx) = waiter {
            let _ = tx.send(outcome);
        }
    }

    /// Drain the queue until shutdown. Each message is processed to the end,
    /// including the replies it enqueues, before the next one is popped.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("Message router started");
        loop {
            while let Some(message) = self.queue.pop().await {
                self.dispatch(message).await;
                if !matches!(shutdown.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
                    info!("Message router shutting down");
                    return;
                }
            }
            if self.queue.is_closed().await {
                info!("Message queue closed, router stopping");
                return;
            }
            tokio::select! {
                _ = self.queue.wait(self.config.idle_poll()) => {}
                _ = shutdown.recv() => {
                    info!("Message router shutting down");
                    return;
                }
            }
        }
    }

    /// Process one message. Never panics and never returns an error: every
    /// failure is turned into state changes and reply messages.
    pub async fn dispatch(&self, message: CoordinationMessage) {
        debug!(
            id = %message.id,
            msg_type = %message.msg_type,
            from = %message.from,
            to = %message.to,
            retry = message.retry_count,
            "Dispatching message"
        );
        match message.msg_type {
            MessageType::Request => self.handle_request(message).await,
            MessageType::Heartbeat => self.handle_heartbeat(message).await,
            MessageType::Response | MessageType::Error => self.deliver_reply(message).await,
            MessageType::StatusUpdate => self.publish(message),
            MessageType::Unknown => {
                warn!(id = %message.id, to = %message.to, "Unknown message type, dropped");
            }
        }
    }

    async fn handle_heartbeat(&self, message: CoordinationMessage) {
        if !self.registry.contains(&message.to) || !self.health.record_heartbeat(&message.to).await {
            warn!(to = %message.to, "Heartbeat for unregistered worker dropped");
        }
    }

    async fn handle_request(&self, message: CoordinationMessage) {
        let Some(worker) = self.registry.get(&message.to) else {
            warn!(to = %message.to, id = %message.id, "Target worker not found, message dropped");
            self.resolve(&message.id, Err(Error::NotFound(format!("worker {}", message.to))))
                .await;
            return;
        };
        if self.health.status(&message.to).await == Some(AgentStatus::Offline) {
            warn!(to = %message.to, id = %message.id, "Target worker offline, message dropped");
            self.resolve(&message.id, Err(Error::NotFound(format!("worker {} is offline", message.to))))
                .await;
            return;
        }

        let task_type = message
            .payload
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let task = self.tasks.create_task(&message.to, task_type, &message.id).await;
        self.tasks.transition(&task.id, TaskTransition::Start).await;
        self.health.mark_busy(&message.to).await;

        let started = Instant::now();
        let outcome = match AssertUnwindSafe(worker.handler.handle(&message.payload))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(Error::Handler(panic_message(panic.as_ref()))),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(result) => {
                self.tasks
                    .transition(&task.id, TaskTransition::Complete(result.clone()))
                    .await;
                self.health.record_success(&message.to, elapsed).await;
                debug!(task_id = %task.id, agent_id = %message.to, elapsed_ms = elapsed.as_millis() as u64, "Task completed");
                let reply = CoordinationMessage::response_to(&message, &task.id, result);
                self.enqueue_reply(reply).await;
            }
            Err(e) => {
                let reason = e.reason();
                self.tasks
                    .transition(&task.id, TaskTransition::Fail(reason.clone()))
                    .await;
                self.health.handle_failure(&message.to, &reason).await;

                if message.has_retry_budget() {
                    self.schedule_retry(message);
                } else {
                    let reply = CoordinationMessage::error_to(&message, &task.id, &reason);
                    self.enqueue_reply(reply).await;
                }
            }
        }
    }

    async fn enqueue_reply(&self, reply: CoordinationMessage) {
        let reply_to = reply.reply_to.clone();
        if let Err(e) = self.queue.push(reply).await {
            debug!(error = %e, "Reply not enqueued");
            if let Some(id) = reply_to {
                self.resolve(&id, Err(e)).await;
            }
        }
    }

    /// Re-enqueue a failed request at the tail after an exponential backoff.
    fn schedule_retry(&self, message: CoordinationMessage) {
        let delay = self.config.backoff_delay(message.retry_count);
        let next = message.next_attempt();
        warn!(
            id = %message.id,
            to = %message.to,
            attempt = next.retry_count,
            max_retries = message.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Retrying request after failure"
        );
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.push(next).await {
                debug!(error = %e, "Retry dropped");
            }
        });
    }

    async fn deliver_reply(&self, message: CoordinationMessage) {
        if let Some(reply_to) = message.reply_to.as_deref() {
            let outcome = match message.msg_type {
                MessageType::Response => Ok(message
                    .payload
                    .get("result")
                    .cloned()
                    .unwrap_or(Value::Null)),
                _ => Err(Error::Handler(
                    message
                        .payload
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error")
                        .to_string(),
                )),
            };
            self.resolve(reply_to, outcome).await;
        }

        if message.msg_type == MessageType::Error {
            warn!(from = %message.from, to = %message.to, payload = %message.payload, "Error reply received");
        } else {
            debug!(from = %message.from, to = %message.to, "Response received");
        }
        self.publish(message);
    }

    fn publish(&self, message: CoordinationMessage) {
        if self.events.send(message).is_err() {
            debug!("No subscribers for coordination event");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, WorkerHandler};
    use crate::task_manager::TaskStatus;

    struct Fixture {
        queue: Arc<MessageQueue>,
        registry: Arc<AgentRegistry>,
        health: Arc<HealthMonitor>,
        tasks: TaskManager,
        router: Router,
    }

    fn fixture() -> Fixture {
        let config = CoordinatorConfig::default();
        let queue = Arc::new(MessageQueue::new());
        let registry = Arc::new(AgentRegistry::new());
        let (events, _) = broadcast::channel(64);
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            config.heartbeat_timeout(),
            events.clone(),
        ));
        let tasks = TaskManager::new();
        let router = Router::new(
            &config,
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&health),
            tasks.clone(),
            events,
        );
        Fixture { queue, registry, health, tasks, router }
    }

    async fn register(f: &Fixture, id: &str, handler: Arc<dyn WorkerHandler>) {
        f.registry.register(id, handler, Vec::<String>::new());
        f.health.ensure_record(id).await;
    }

    #[tokio::test]
    async fn test_queue_is_fifo_and_fills_identity() {
        let queue = MessageQueue::new();
        let mut first = CoordinationMessage::request("x", "A", Value::Null);
        first.id.clear();
        let id = queue.push(first).await.unwrap();
        assert!(!id.is_empty());
        queue.push(CoordinationMessage::heartbeat("A")).await.unwrap();

        assert_eq!(queue.pop().await.unwrap().id, id);
        assert_eq!(queue.pop().await.unwrap().msg_type, MessageType::Heartbeat);
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_pushes() {
        let queue = MessageQueue::new();
        queue.push(CoordinationMessage::heartbeat("A")).await.unwrap();
        queue.close().await;
        assert!(queue.is_empty().await);
        assert!(matches!(
            queue.push(CoordinationMessage::heartbeat("A")).await,
            Err(Error::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_request_to_unknown_worker_creates_no_task() {
        let f = fixture();
        let msg = CoordinationMessage::request("caller", "Z", Value::Null);
        let rx = f.router.await_reply(&msg.id).await;
        f.router.dispatch(msg).await;

        assert_eq!(f.tasks.len().await, 0);
        assert!(f.queue.is_empty().await);
        assert!(matches!(rx.await.unwrap(), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_successful_request_enqueues_response() {
        let f = fixture();
        register(
            &f,
            "A",
            Arc::new(handler_fn(|_| async { Ok::<_, Error>(serde_json::json!({"text": "ok"})) })),
        )
        .await;

        let msg = CoordinationMessage::request("caller", "A", serde_json::json!({"type": "chat"}));
        let msg_id = msg.id.clone();
        f.router.dispatch(msg).await;

        let tasks = f.tasks.for_message(&msg_id).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[0].task_type, "chat");

        let reply = f.queue.pop().await.unwrap();
        assert_eq!(reply.msg_type, MessageType::Response);
        assert_eq!(reply.to, "caller");
        assert_eq!(reply.payload["result"]["text"], "ok");
        assert_eq!(reply.payload["taskId"], tasks[0].id.as_str());
        assert!(f.queue.pop().await.is_none());

        let health = f.health.get("A").await.unwrap();
        assert_eq!(health.status, AgentStatus::Idle);
        assert_eq!(health.success_count, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let f = fixture();
        register(
            &f,
            "P",
            Arc::new(handler_fn(|_| async {
                if true {
                    panic!("kaboom");
                }
                Ok::<_, Error>(Value::Null)
            })),
        )
        .await;

        f.router
            .dispatch(CoordinationMessage::request("caller", "P", Value::Null))
            .await;

        let reply = f.queue.pop().await.unwrap();
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.payload["error"], "kaboom");
        assert_eq!(f.health.get("P").await.unwrap().error_count, 1);
    }

    #[tokio::test]
    async fn test_reply_resolves_waiter_and_reaches_subscribers() {
        let f = fixture();
        let mut events = f.router.events.subscribe();
        let request = CoordinationMessage::request("caller", "A", Value::Null);
        let rx = f.router.await_reply(&request.id).await;

        let reply = CoordinationMessage::response_to(&request, "task_1", serde_json::json!({"text": "ok"}));
        f.router.dispatch(reply).await;

        assert_eq!(rx.await.unwrap().unwrap()["text"], "ok");
        assert_eq!(events.recv().await.unwrap().msg_type, MessageType::Response);
        assert_eq!(f.router.pending_replies().await, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_for_unknown_worker_is_dropped() {
        let f = fixture();
        f.router.dispatch(CoordinationMessage::heartbeat("ghost")).await;
        assert!(f.health.get("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_offline_worker_is_not_dispatched() {
        let f = fixture();
        register(
            &f,
            "A",
            Arc::new(handler_fn(|_| async { Ok::<_, Error>(Value::Null) })),
        )
        .await;
        f.health.transition("A", AgentStatus::Offline).await;

        f.router
            .dispatch(CoordinationMessage::request("caller", "A", Value::Null))
            .await;
        assert_eq!(f.tasks.len().await, 0);
    }

    #[test]
    fn test_panic_message_variants() {
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "worker handler panicked");
    }
}
