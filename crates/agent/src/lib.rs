pub mod coordinator;
pub mod handler;
pub mod health;
pub mod registry;
pub mod router;
pub mod task_manager;
pub mod telemetry;

pub use coordinator::{
    Coordinator, InputOutcome, InputType, PerformanceSample, UserInput, FALLBACK_REPLY,
    INPUT_SOURCE,
};
pub use handler::{handler_fn, FnHandler, WorkerHandler};
pub use health::{AgentHealth, AgentStatus, HealthMonitor};
pub use registry::{AgentRegistry, WorkerEntry};
pub use router::{MessageQueue, Router};
pub use task_manager::{AgentTask, TaskCounts, TaskManager, TaskStatus, TaskTransition};
pub use telemetry::{LogSink, QueueDepths, SystemStatus, TelemetrySink};
