pub mod config;
pub mod error;
pub mod message;
pub mod paths;

pub use config::{Config, CoordinatorConfig, WorkerSpec};
pub use error::{Error, Result};
pub use message::{CoordinationMessage, MessageType, Priority, COORDINATOR_ID};
pub use paths::Paths;
