use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::handler::WorkerHandler;

/// A registered worker. The handler is shared only with the router and the
/// health monitor.
#[derive(Clone)]
pub struct WorkerEntry {
    pub id: String,
    pub capabilities: BTreeSet<String>,
    pub handler: Arc<dyn WorkerHandler>,
    pub registered_at: DateTime<Utc>,
}

impl std::fmt::Debug for WorkerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerEntry")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .field("registered_at", &self.registered_at)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct AgentRegistry {
    workers: RwLock<HashMap<String, WorkerEntry>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a worker, replacing any previous entry with the same id.
    /// Returns `true` when an entry was replaced.
    pub fn register<I, S>(&self, id: &str, handler: Arc<dyn WorkerHandler>, capabilities: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = WorkerEntry {
            id: id.to_string(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            handler,
            registered_at: Utc::now(),
        };
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        let replaced = workers.insert(id.to_string(), entry).is_some();
        debug!(agent_id = %id, replaced, "Registered worker");
        replaced
    }

    pub fn get(&self, id: &str) -> Option<WorkerEntry> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        workers.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        workers.contains_key(id)
    }

    /// Snapshot of every worker, ordered by id. Iterate it as often as needed.
    pub fn all(&self) -> Vec<WorkerEntry> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<WorkerEntry> = workers.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn ids(&self) -> Vec<String> {
        self.all().into_iter().map(|w| w.id).collect()
    }

    pub fn find_by_capability(&self, capability: &str) -> Vec<WorkerEntry> {
        self.all()
            .into_iter()
            .filter(|w| w.capabilities.contains(capability))
            .collect()
    }

    pub fn len(&self) -> usize {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        workers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use serde_json::Value;

    fn noop() -> Arc<dyn WorkerHandler> {
        Arc::new(handler_fn(|_| async { Ok::<_, village_core::Error>(Value::Null) }))
    }

    #[test]
    fn test_register_and_get() {
        let registry = AgentRegistry::new();
        assert!(!registry.register("A", noop(), ["intent_analysis"]));
        let entry = registry.get("A").unwrap();
        assert!(entry.capabilities.contains("intent_analysis"));
        assert!(registry.get("Z").is_none());
    }

    #[test]
    fn test_reregistration_overwrites() {
        let registry = AgentRegistry::new();
        registry.register("A", noop(), ["old"]);
        assert!(registry.register("A", noop(), ["new"]));
        assert_eq!(registry.len(), 1);
        let entry = registry.get("A").unwrap();
        assert!(entry.capabilities.contains("new"));
        assert!(!entry.capabilities.contains("old"));
    }

    #[test]
    fn test_all_is_sorted_and_restartable() {
        let registry = AgentRegistry::new();
        for id in ["C", "A", "B"] {
            registry.register(id, noop(), Vec::<String>::new());
        }
        let all = registry.all();
        let first: Vec<&str> = all.iter().map(|w| w.id.as_str()).collect();
        let second: Vec<&str> = all.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(first, vec!["A", "B", "C"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_find_by_capability_and_clear() {
        let registry = AgentRegistry::new();
        registry.register("B", noop(), ["api_calls", "data_access"]);
        registry.register("C", noop(), ["caching"]);
        let found = registry.find_by_capability("caching");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "C");
        registry.clear();
        assert!(registry.is_empty());
    }
}
