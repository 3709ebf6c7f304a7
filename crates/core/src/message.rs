use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pseudo worker id used as `from` on system-originated messages.
pub const COORDINATOR_ID: &str = "coordinator";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Heartbeat,
    Error,
    StatusUpdate,
    /// Anything else arriving over JSON. Dropped by the router.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Request => write!(f, "request"),
            MessageType::Response => write!(f, "response"),
            MessageType::Heartbeat => write!(f, "heartbeat"),
            MessageType::Error => write!(f, "error"),
            MessageType::StatusUpdate => write!(f, "status_update"),
            MessageType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Advisory only: the router drains its queue in arrival order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationMessage {
    #[serde(default)]
    pub id: String,
    /// Creation time in milliseconds since the epoch. Zero means unset.
    #[serde(default)]
    pub timestamp: i64,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    /// Id of the request this message answers (responses and errors only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

pub fn new_message_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

impl CoordinationMessage {
    pub fn new(from: &str, to: &str, msg_type: MessageType, payload: Value) -> Self {
        Self {
            id: new_message_id("msg"),
            timestamp: Utc::now().timestamp_millis(),
            from: from.to_string(),
            to: to.to_string(),
            msg_type,
            priority: Priority::Normal,
            payload,
            retry_count: 0,
            max_retries: 0,
            reply_to: None,
        }
    }

    pub fn request(from: &str, to: &str, payload: Value) -> Self {
        Self::new(from, to, MessageType::Request, payload)
    }

    pub fn heartbeat(to: &str) -> Self {
        let now = Utc::now().timestamp_millis();
        let mut msg = Self::new(
            COORDINATOR_ID,
            to,
            MessageType::Heartbeat,
            serde_json::json!({ "timestamp": now }),
        );
        msg.id = new_message_id("heartbeat");
        msg.priority = Priority::Low;
        msg
    }

    /// Successful reply from `request.to` back to `request.from`.
    pub fn response_to(request: &CoordinationMessage, task_id: &str, result: Value) -> Self {
        let mut msg = Self::new(
            &request.to,
            &request.from,
            MessageType::Response,
            serde_json::json!({
                "taskId": task_id,
                "result": result,
                "success": true,
            }),
        );
        msg.id = new_message_id("resp");
        msg.reply_to = Some(request.id.clone());
        msg
    }

    /// Failure reply from `request.to` back to `request.from`.
    pub fn error_to(request: &CoordinationMessage, task_id: &str, error: &str) -> Self {
        let mut msg = Self::new(
            &request.to,
            &request.from,
            MessageType::Error,
            serde_json::json!({
                "taskId": task_id,
                "error": error,
                "success": false,
            }),
        );
        msg.id = new_message_id("error");
        msg.priority = Priority::High;
        msg.reply_to = Some(request.id.clone());
        msg
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Assign id and timestamp when the caller left them blank.
    pub fn ensure_identity(&mut self) {
        if self.id.is_empty() {
            self.id = new_message_id("msg");
        }
        if self.timestamp <= 0 {
            self.timestamp = Utc::now().timestamp_millis();
        }
    }

    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Copy scheduled for the next delivery attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_camel_case() {
        let msg = CoordinationMessage::request("caller", "A", serde_json::json!({"text": "hi"}))
            .with_max_retries(2);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "request");
        assert_eq!(v["maxRetries"], 2);
        assert_eq!(v["retryCount"], 0);
        assert_eq!(v["priority"], "normal");
        assert!(v.get("replyTo").is_none());
    }

    #[test]
    fn test_missing_identity_is_filled() {
        let raw = r#"{"from":"caller","to":"A","type":"status_update"}"#;
        let mut msg: CoordinationMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.id.is_empty());
        assert_eq!(msg.timestamp, 0);
        msg.ensure_identity();
        assert!(msg.id.starts_with("msg_"));
        assert!(msg.timestamp > 0);
        assert_eq!(msg.msg_type, MessageType::StatusUpdate);
    }

    #[test]
    fn test_unknown_type_deserializes() {
        let raw = r#"{"from":"x","to":"A","type":"gossip"}"#;
        let msg: CoordinationMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.msg_type, MessageType::Unknown);
    }

    #[test]
    fn test_replies_swap_direction() {
        let req = CoordinationMessage::request("caller", "A", Value::Null);
        let resp = CoordinationMessage::response_to(&req, "task_1", serde_json::json!({"text": "ok"}));
        assert_eq!(resp.from, "A");
        assert_eq!(resp.to, "caller");
        assert_eq!(resp.reply_to.as_deref(), Some(req.id.as_str()));
        assert_eq!(resp.payload["success"], true);

        let err = CoordinationMessage::error_to(&req, "task_1", "boom");
        assert_eq!(err.msg_type, MessageType::Error);
        assert_eq!(err.priority, Priority::High);
        assert_eq!(err.payload["error"], "boom");
    }

    #[test]
    fn test_next_attempt_increments_retry_count() {
        let msg = CoordinationMessage::request("caller", "A", Value::Null).with_max_retries(1);
        assert!(msg.has_retry_budget());
        let retry = msg.next_attempt();
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.id, msg.id);
        assert!(!retry.has_retry_budget());
    }
}
