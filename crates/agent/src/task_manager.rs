use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Lifecycle of one unit of work. Transitions only move forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet handed to the worker.
    Pending,
    /// The worker's handler is running.
    Processing,
    /// Handler returned a result.
    Completed,
    /// Handler returned an error.
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskTransition {
    Start,
    Complete(Value),
    Fail(String),
}

impl TaskTransition {
    fn target(&self) -> TaskStatus {
        match self {
            TaskTransition::Start => TaskStatus::Processing,
            TaskTransition::Complete(_) => TaskStatus::Completed,
            TaskTransition::Fail(_) => TaskStatus::Failed,
        }
    }
}

/// A unit of work dispatched to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
    pub id: String,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    /// Request message that produced this task.
    pub message_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Thread-safe task tracker shared by the router and the telemetry surface.
#[derive(Clone)]
pub struct TaskManager {
    tasks: Arc<Mutex<HashMap<String, AgentTask>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a new `pending` task and return it.
    pub async fn create_task(&self, agent_id: &str, task_type: &str, message_id: &str) -> AgentTask {
        let info = AgentTask {
            id: format!("task_{}", uuid::Uuid::new_v4().simple()),
            agent_id: agent_id.to_string(),
            task_type: task_type.to_string(),
            message_id: message_id.to_string(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        };
        let mut tasks = self.tasks.lock().await;
        tasks.insert(info.id.clone(), info.clone());
        info
    }

    /// Apply a forward transition. Returns `false` (and changes nothing) for
    /// unknown tasks, terminal tasks and backward moves.
    pub async fn transition(&self, task_id: &str, transition: TaskTransition) -> bool {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(task_id) else {
            warn!(task_id, "Transition for unknown task ignored");
            return false;
        };

        let target = transition.target();
        if task.status.is_terminal() {
            warn!(task_id, from = %task.status, to = %target, "Task already finished, transition ignored");
            return false;
        }
        if task.status == TaskStatus::Processing && target == TaskStatus::Processing {
            debug!(task_id, "Task already processing");
            return false;
        }

        let now = Utc::now();
        match transition {
            TaskTransition::Start => {
                task.started_at = Some(now);
            }
            TaskTransition::Complete(result) => {
                task.started_at.get_or_insert(now);
                task.completed_at = Some(now);
                task.result = Some(result);
            }
            TaskTransition::Fail(error) => {
                task.started_at.get_or_insert(now);
                task.completed_at = Some(now);
                task.error = Some(error);
            }
        }
        task.status = target;
        true
    }

    pub async fn get(&self, task_id: &str) -> Option<AgentTask> {
        let tasks = self.tasks.lock().await;
        tasks.get(task_id).cloned()
    }

    /// List all tasks, optionally filtered by status, newest first.
    pub async fn list(&self, status_filter: Option<&TaskStatus>) -> Vec<AgentTask> {
        let tasks = self.tasks.lock().await;
        let mut result: Vec<AgentTask> = tasks
            .values()
            .filter(|t| status_filter.map_or(true, |s| &t.status == s))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        result
    }

    pub async fn for_message(&self, message_id: &str) -> Vec<AgentTask> {
        let tasks = self.tasks.lock().await;
        let mut result: Vec<AgentTask> = tasks
            .values()
            .filter(|t| t.message_id == message_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        result
    }

    pub async fn counts_by_status(&self) -> TaskCounts {
        let tasks = self.tasks.lock().await;
        let mut counts = TaskCounts {
            total: tasks.len(),
            ..TaskCounts::default()
        };
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Remove completed/failed tasks older than the given duration.
    /// A `max_age` too large to subtract from now keeps everything.
    pub async fn cleanup_finished(&self, max_age: std::time::Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            debug!(max_age_secs = max_age.as_secs(), "Retention beyond clock range, nothing pruned");
            return 0;
        };
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, t| {
            if t.status.is_terminal() {
                t.completed_at.map_or(true, |c| c > cutoff)
            } else {
                true
            }
        });
        let removed = before - tasks.len();
        if removed > 0 {
            debug!(removed, "Cleaned up finished tasks");
        }
        removed
    }

    pub async fn clear(&self) {
        self.tasks.lock().await.clear();
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
