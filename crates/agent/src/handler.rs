use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use village_core::Result;

/// The capability a registered worker exposes to the router.
///
/// Only `handle` is required. The other hooks default to no-ops so simple
/// workers stay one function long.
#[async_trait]
pub trait WorkerHandler: Send + Sync {
    /// Process one request payload (`uid`, `text`, `contextSpot`, `inputType`, ...).
    async fn handle(&self, payload: &Value) -> Result<Value>;

    /// Liveness probe run by the heartbeat sweep before each heartbeat.
    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    /// Worker-specific recovery after a failure. Must be safe to call repeatedly.
    async fn recover(&self) -> Result<()> {
        Ok(())
    }

    /// Drop any internal caches. Best effort.
    async fn clear_cache(&self) -> Result<()> {
        Ok(())
    }
}

/// Adapts an async closure into a [`WorkerHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> WorkerHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn handle(&self, payload: &Value) -> Result<Value> {
        (self.f)(payload.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    FnHandler::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use village_core::Error;

    #[tokio::test]
    async fn test_fn_handler_passes_payload() {
        let h = handler_fn(|payload: Value| async move {
            Ok::<_, Error>(serde_json::json!({ "echo": payload["text"] }))
        });
        let out = h.handle(&serde_json::json!({"text": "hello"})).await.unwrap();
        assert_eq!(out["echo"], "hello");
        assert!(h.recover().await.is_ok());
        assert!(h.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_fn_handler_propagates_error() {
        let h = handler_fn(|_| async { Err::<Value, _>(Error::Handler("boom".to_string())) });
        let err = h.handle(&Value::Null).await.unwrap_err();
        assert_eq!(err.reason(), "boom");
    }
}
