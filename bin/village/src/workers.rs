use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use village_agent::{Coordinator, WorkerHandler};
use village_core::{Config, Error, Result};

/// Worker A: answers user input with a short guide reply, memoised per text.
#[derive(Default)]
pub struct GuideWorker {
    replies: Mutex<HashMap<String, String>>,
}

impl GuideWorker {
    fn compose(text: &str, spot: &str) -> String {
        format!("【{}导览】收到：{}", spot, text)
    }
}

#[async_trait]
impl WorkerHandler for GuideWorker {
    async fn handle(&self, payload: &Value) -> Result<Value> {
        let text = payload
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Handler("missing text".to_string()))?;
        let spot = payload
            .get("contextSpot")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let mut replies = self.replies.lock().unwrap_or_else(|e| e.into_inner());
        let cached = replies.contains_key(text);
        let reply = replies
            .entry(text.to_string())
            .or_insert_with(|| Self::compose(text, spot))
            .clone();

        Ok(json!({
            "text": reply,
            "uid": payload.get("uid").cloned().unwrap_or(Value::Null),
            "cached": cached,
        }))
    }

    async fn clear_cache(&self) -> Result<()> {
        let mut replies = self.replies.lock().unwrap_or_else(|e| e.into_inner());
        debug!(entries = replies.len(), "Guide replies cleared");
        replies.clear();
        Ok(())
    }
}

/// Workers B, C and D: acknowledge every request with a fixed result.
pub struct PlaceholderWorker {
    label: String,
}

impl PlaceholderWorker {
    pub fn new(id: &str) -> Self {
        Self {
            label: format!("Agent {} 处理结果", id),
        }
    }
}

#[async_trait]
impl WorkerHandler for PlaceholderWorker {
    async fn handle(&self, _payload: &Value) -> Result<Value> {
        Ok(json!({ "success": true, "data": self.label }))
    }
}

pub fn demo_handler(id: &str) -> Arc<dyn WorkerHandler> {
    match id {
        "A" => Arc::new(GuideWorker::default()),
        other => Arc::new(PlaceholderWorker::new(other)),
    }
}

/// Build a coordinator and register one demo worker per configured spec.
pub async fn build_coordinator(config: &Config) -> anyhow::Result<Arc<Coordinator>> {
    let coordinator = Arc::new(Coordinator::new(config.coordinator.clone()));
    for spec in &config.workers {
        coordinator
            .register_worker(&spec.id, demo_handler(&spec.id), spec.capabilities.iter().cloned())
            .await?;
    }
    Ok(coordinator)
}
