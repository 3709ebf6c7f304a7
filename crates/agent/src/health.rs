use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use village_core::{CoordinationMessage, Error, MessageType, Result, COORDINATOR_ID};

use crate::handler::WorkerHandler;
use crate::registry::AgentRegistry;
use crate::router::MessageQueue;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Error,
    Offline,
    Recovering,
}

impl AgentStatus {
    /// Edges of the worker state machine.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        matches!(
            (self, next),
            (AgentStatus::Idle, AgentStatus::Busy)
                | (AgentStatus::Busy, AgentStatus::Idle)
                | (_, AgentStatus::Error)
                | (_, AgentStatus::Offline)
                | (AgentStatus::Error, AgentStatus::Recovering)
                | (AgentStatus::Offline, AgentStatus::Recovering)
                | (AgentStatus::Recovering, AgentStatus::Idle)
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Offline => write!(f, "offline"),
            AgentStatus::Recovering => write!(f, "recovering"),
        }
    }
}

/// Point-in-time health of one worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub agent_id: String,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(rename = "responseTime")]
    pub response_time_ms: u64,
    pub error_count: u64,
    pub success_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct HealthEntry {
    record: AgentHealth,
    /// Monotonic twin of `last_heartbeat`, used for timeout detection.
    last_seen: Instant,
}

impl HealthEntry {
    fn new(agent_id: &str) -> Self {
        Self {
            record: AgentHealth {
                agent_id: agent_id.to_string(),
                status: AgentStatus::Idle,
                last_heartbeat: Utc::now(),
                response_time_ms: 0,
                error_count: 0,
                success_count: 0,
                last_error: None,
            },
            last_seen: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.record.last_heartbeat = Utc::now();
        self.last_seen = Instant::now();
    }
}

/// Tracks liveness and the status state machine of every registered worker.
pub struct HealthMonitor {
    records: Mutex<HashMap<String, HealthEntry>>,
    registry: Arc<AgentRegistry>,
    heartbeat_timeout: Duration,
    events: broadcast::Sender<CoordinationMessage>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        heartbeat_timeout: Duration,
        events: broadcast::Sender<CoordinationMessage>,
    ) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            registry,
            heartbeat_timeout,
            events,
        }
    }

    /// Create an `idle` record unless one already exists.
    pub async fn ensure_record(&self, agent_id: &str) {
        let mut records = self.records.lock().await;
        records
            .entry(agent_id.to_string())
            .or_insert_with(|| HealthEntry::new(agent_id));
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentHealth> {
        let records = self.records.lock().await;
        records.get(agent_id).map(|e| e.record.clone())
    }

    pub async fn status(&self, agent_id: &str) -> Option<AgentStatus> {
        let records = self.records.lock().await;
        records.get(agent_id).map(|e| e.record.status)
    }

    pub async fn snapshot(&self) -> BTreeMap<String, AgentHealth> {
        let records = self.records.lock().await;
        records
            .iter()
            .map(|(id, e)| (id.clone(), e.record.clone()))
            .collect()
    }

    pub async fn clear(&self) {
        self.records.lock().await.clear();
    }

    /// Move a worker along the state machine. Illegal edges are logged and ignored.
    pub async fn transition(&self, agent_id: &str, next: AgentStatus) -> bool {
        let previous = {
            let mut records = self.records.lock().await;
            let Some(entry) = records.get_mut(agent_id) else {
                return false;
            };
            let current = entry.record.status;
            if current == next {
                return true;
            }
            if !current.can_transition_to(next) {
                warn!(agent_id, from = %current, to = %next, "Illegal status transition ignored");
                return false;
            }
            entry.record.status = next;
            current
        };
        debug!(agent_id, from = %previous, to = %next, "Worker status changed");
        self.publish_status(agent_id, previous, next);
        true
    }

    fn publish_status(&self, agent_id: &str, from: AgentStatus, to: AgentStatus) {
        let msg = CoordinationMessage::new(
            agent_id,
            COORDINATOR_ID,
            MessageType::StatusUpdate,
            serde_json::json!({
                "agentId": agent_id,
                "from": from,
                "to": to,
            }),
        );
        // No subscribers is fine.
        let _ = self.events.send(msg);
    }

    pub async fn mark_busy(&self, agent_id: &str) -> bool {
        self.transition(agent_id, AgentStatus::Busy).await
    }

    /// A heartbeat reached the worker.
    pub async fn record_heartbeat(&self, agent_id: &str) -> bool {
        let mut records = self.records.lock().await;
        match records.get_mut(agent_id) {
            Some(entry) => {
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// A request was delivered and handled successfully.
    pub async fn record_success(&self, agent_id: &str, elapsed: Duration) {
        {
            let mut records = self.records.lock().await;
            let Some(entry) = records.get_mut(agent_id) else {
                return;
            };
            entry.record.success_count += 1;
            entry.record.response_time_ms = elapsed.as_millis() as u64;
            entry.touch();
        }
        if self.status(agent_id).await == Some(AgentStatus::Busy) {
            self.transition(agent_id, AgentStatus::Idle).await;
        }
    }

    async fn record_error(&self, agent_id: &str, reason: &str) -> bool {
        let mut records = self.records.lock().await;
        match records.get_mut(agent_id) {
            Some(entry) => {
                entry.record.error_count += 1;
                entry.record.last_error = Some(reason.to_string());
                true
            }
            None => false,
        }
    }

    /// Failure path shared by handler errors, probe errors and heartbeat
    /// timeouts: `error`, counters, then recovery.
    pub async fn handle_failure(&self, agent_id: &str, reason: &str) -> AgentStatus {
        error!(agent_id, reason, "Worker failure");
        if !self.record_error(agent_id, reason).await {
            warn!(agent_id, "Failure reported for unknown worker");
            return AgentStatus::Offline;
        }
        self.transition(agent_id, AgentStatus::Error).await;
        self.recover(agent_id).await
    }

    /// Run the worker's recovery hook. Only valid from `error` or `offline`.
    pub async fn recover(&self, agent_id: &str) -> AgentStatus {
        if !self.transition(agent_id, AgentStatus::Recovering).await {
            return self.status(agent_id).await.unwrap_or(AgentStatus::Offline);
        }
        info!(agent_id, "Attempting worker recovery");

        let outcome = match self.registry.get(agent_id) {
            Some(worker) => worker.handler.recover().await,
            None => Err(Error::NotFound(format!("worker {}", agent_id))),
        };

        match outcome {
            Ok(()) => {
                {
                    let mut records = self.records.lock().await;
                    if let Some(entry) = records.get_mut(agent_id) {
                        entry.touch();
                    }
                }
                self.transition(agent_id, AgentStatus::Idle).await;
                info!(agent_id, "Worker recovered");
                AgentStatus::Idle
            }
            Err(e) => {
                let reason = Error::Recovery(e.reason()).to_string();
                error!(agent_id, error = %reason, "Worker recovery failed");
                {
                    let mut records = self.records.lock().await;
                    if let Some(entry) = records.get_mut(agent_id) {
                        entry.record.last_error = Some(reason);
                    }
                }
                self.transition(agent_id, AgentStatus::Error).await;
                AgentStatus::Error
            }
        }
    }

    /// Ids of workers silent for longer than the heartbeat timeout.
    pub async fn timed_out(&self) -> Vec<String> {
        let now = Instant::now();
        let records = self.records.lock().await;
        let mut ids: Vec<String> = records
            .iter()
            .filter(|(_, e)| e.record.status != AgentStatus::Offline)
            .filter(|(_, e)| now.duration_since(e.last_seen) > self.heartbeat_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// One heartbeat sweep. Timed-out workers fail before any new heartbeat
    /// is sent; the rest are probed and sent a low-priority heartbeat.
    pub async fn sweep(&self, queue: &MessageQueue) {
        let timed_out = self.timed_out().await;
        for agent_id in &timed_out {
            warn!(agent_id = %agent_id, "Heartbeat timeout");
            let reason = Error::HeartbeatTimeout(format!(
                "no heartbeat for more than {}ms",
                self.heartbeat_timeout.as_millis()
            ))
            .to_string();
            self.handle_failure(agent_id, &reason).await;
        }

        for worker in self.registry.all() {
            if timed_out.contains(&worker.id) {
                continue;
            }
            match self.status(&worker.id).await {
                None | Some(AgentStatus::Offline) => continue,
                Some(_) => {}
            }
            if let Err(e) = self.check_worker(&worker.id, worker.handler.as_ref(), queue).await {
                error!(agent_id = %worker.id, error = %e, "Health check failed");
                self.handle_failure(&worker.id, &e.reason()).await;
            }
        }
    }

    async fn check_worker(
        &self,
        agent_id: &str,
        handler: &dyn WorkerHandler,
        queue: &MessageQueue,
    ) -> Result<()> {
        handler.probe().await?;
        queue.push(CoordinationMessage::heartbeat(agent_id)).await?;
        Ok(())
    }
}
