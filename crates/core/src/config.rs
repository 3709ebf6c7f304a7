use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths::Paths;

/// Upper bound for `taskRetentionSecs` (ten years).
pub const MAX_TASK_RETENTION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// A worker silent for longer than this is declared failed.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_performance_interval_ms")]
    pub performance_interval_ms: u64,
    /// Retry `n` of a failed request waits `retry_base_delay_ms * 2^n`.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// How long the dispatch loop sleeps on an empty queue before re-checking.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Worker that receives `process_input` requests.
    #[serde(default = "default_worker")]
    pub default_worker: String,
    #[serde(default = "default_context_spot")]
    pub default_context_spot: String,
    /// Finished tasks older than this are pruned by the performance sampler.
    #[serde(default = "default_task_retention_secs")]
    pub task_retention_secs: u64,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    15_000
}

fn default_performance_interval_ms() -> u64 {
    10_000
}

fn default_retry_base_delay_ms() -> u64 {
    2_000
}

fn default_idle_poll_ms() -> u64 {
    100
}

fn default_worker() -> String {
    "A".to_string()
}

fn default_context_spot() -> String {
    "东里村".to_string()
}

fn default_task_retention_secs() -> u64 {
    300
}

fn default_subscriber_buffer() -> usize {
    256
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            performance_interval_ms: default_performance_interval_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            default_worker: default_worker(),
            default_context_spot: default_context_spot(),
            task_retention_secs: default_task_retention_secs(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl CoordinatorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn performance_interval(&self) -> Duration {
        Duration::from_millis(self.performance_interval_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Never below 1ms so an unvalidated config cannot make the router spin.
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }

    /// Delay before retry number `retry_count + 1` of a failed message.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u64 << retry_count.min(16);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::Config("heartbeatIntervalMs must be greater than zero".to_string()));
        }
        if self.performance_interval_ms == 0 {
            return Err(Error::Config("performanceIntervalMs must be greater than zero".to_string()));
        }
        if self.idle_poll_ms == 0 {
            return Err(Error::Config("idlePollMs must be greater than zero".to_string()));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(Error::Config(format!(
                "heartbeatTimeoutMs ({}) must exceed heartbeatIntervalMs ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.task_retention_secs > MAX_TASK_RETENTION_SECS {
            return Err(Error::Config(format!(
                "taskRetentionSecs ({}) must not exceed {}",
                self.task_retention_secs, MAX_TASK_RETENTION_SECS
            )));
        }
        if self.default_worker.trim().is_empty() {
            return Err(Error::Config("defaultWorker must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl WorkerSpec {
    pub fn new(id: &str, capabilities: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }
}

fn default_workers() -> Vec<WorkerSpec> {
    vec![
        WorkerSpec::new("A", &["user_input_processing", "intent_analysis", "tool_selection"]),
        WorkerSpec::new("B", &["api_calls", "data_access", "tool_execution"]),
        WorkerSpec::new("C", &["data_production", "caching", "search_indexing"]),
        WorkerSpec::new("D", &["logging", "monitoring", "statistics"]),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default = "default_workers")]
    pub workers: Vec<WorkerSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            workers: default_workers(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.coordinator.validate()?;
        let mut seen = HashSet::new();
        for worker in &self.workers {
            if worker.id.trim().is_empty() {
                return Err(Error::Config("worker id must not be empty".to_string()));
            }
            if !seen.insert(worker.id.as_str()) {
                return Err(Error::Config(format!("duplicate worker id: {}", worker.id)));
            }
        }
        Ok(())
    }

    pub fn worker(&self, id: &str) -> Option<&WorkerSpec> {
        self.workers.iter().find(|w| w.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.coordinator.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(cfg.coordinator.heartbeat_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.coordinator.performance_interval(), Duration::from_secs(10));
        assert_eq!(cfg.coordinator.retry_base_delay(), Duration::from_secs(2));
        assert_eq!(cfg.workers.len(), 4);
        assert!(cfg.worker("C").unwrap().capabilities.contains(&"caching".to_string()));
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let raw = r#"{ "coordinator": { "heartbeatIntervalMs": 1000, "heartbeatTimeoutMs": 3000 } }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.coordinator.heartbeat_interval_ms, 1000);
        assert_eq!(cfg.coordinator.retry_base_delay_ms, 2000);
        assert_eq!(cfg.coordinator.default_worker, "A");
        assert_eq!(cfg.workers.len(), 4);
    }

    #[test]
    fn test_backoff_doubles() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.backoff_delay(0), Duration::from_secs(2));
        assert_eq!(cfg.backoff_delay(1), Duration::from_secs(4));
        assert_eq!(cfg.backoff_delay(3), Duration::from_secs(16));
    }

    #[test]
    fn test_validate_rejects_timeout_below_interval() {
        let mut cfg = CoordinatorConfig::default();
        cfg.heartbeat_timeout_ms = cfg.heartbeat_interval_ms;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_bounds_task_retention() {
        let mut cfg = CoordinatorConfig::default();
        cfg.task_retention_secs = MAX_TASK_RETENTION_SECS;
        cfg.validate().unwrap();
        cfg.task_retention_secs = u64::MAX;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_idle_poll_never_zero() {
        let mut cfg = CoordinatorConfig::default();
        cfg.idle_poll_ms = 0;
        assert_eq!(cfg.idle_poll(), Duration::from_millis(1));
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_workers() {
        let mut cfg = Config::default();
        cfg.workers.push(WorkerSpec::new("A", &[]));
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load_roundtrip_through_paths() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().join("village"));
        let missing = Config::load_or_default(&paths).unwrap();
        assert_eq!(missing.workers.len(), 4);

        let mut cfg = Config::default();
        cfg.coordinator.default_worker = "B".to_string();
        cfg.save(&paths.config_file()).unwrap();

        let loaded = Config::load_or_default(&paths).unwrap();
        assert_eq!(loaded.coordinator.default_worker, "B");
    }
}
