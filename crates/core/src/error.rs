use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Heartbeat timeout: {0}")]
    HeartbeatTimeout(String),

    #[error("Recovery error: {0}")]
    Recovery(String),

    #[error("Coordinator disposed")]
    Disposed,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Short form used for `lastError` and error reply payloads. Handler
    /// failures keep the handler's own text so callers see e.g. `"boom"`.
    pub fn reason(&self) -> String {
        match self {
            Error::Handler(msg) | Error::Other(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
