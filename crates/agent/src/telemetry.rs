use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use village_core::Result;

use crate::health::{AgentHealth, AgentStatus};
use crate::task_manager::TaskCounts;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepths {
    pub messages: usize,
    pub tasks: usize,
}

/// Aggregated view of the whole coordinator at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub agents: BTreeMap<String, AgentHealth>,
    pub tasks: TaskCounts,
    pub queues: QueueDepths,
    pub timestamp: DateTime<Utc>,
}

impl SystemStatus {
    pub fn count_with_status(&self, status: AgentStatus) -> usize {
        self.agents.values().filter(|h| h.status == status).count()
    }

    pub fn healthy(&self) -> bool {
        self.agents
            .values()
            .all(|h| matches!(h.status, AgentStatus::Idle | AgentStatus::Busy))
    }
}

/// Destination for periodic performance samples.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    fn name(&self) -> &str;

    async fn record(&self, status: &SystemStatus) -> Result<()>;
}

/// Writes each sample as a structured `tracing` event.
pub struct LogSink;

#[async_trait]
impl TelemetrySink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn record(&self, status: &SystemStatus) -> Result<()> {
        info!(
            agents = status.agents.len(),
            idle = status.count_with_status(AgentStatus::Idle),
            busy = status.count_with_status(AgentStatus::Busy),
            error = status.count_with_status(AgentStatus::Error),
            offline = status.count_with_status(AgentStatus::Offline),
            tasks_total = status.tasks.total,
            tasks_processing = status.tasks.processing,
            tasks_failed = status.tasks.failed,
            queued_messages = status.queues.messages,
            "Performance sample"
        );
        Ok(())
    }
}
