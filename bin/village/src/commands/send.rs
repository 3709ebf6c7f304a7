use std::time::Duration;

use serde_json::json;
use tracing::info;
use village_core::{CoordinationMessage, Config, Paths};

use crate::workers::build_coordinator;

/// Submit one request and wait for the worker's reply.
pub async fn run(to: String, text: String, retries: u32, timeout_secs: u64) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let coordinator = build_coordinator(&config).await?;
    coordinator.start();

    let payload = json!({
        "uid": "user_cli",
        "text": text,
        "contextSpot": config.coordinator.default_context_spot,
        "inputType": "text",
    });
    let message = CoordinationMessage::request("cli", &to, payload).with_max_retries(retries);
    info!(to = %to, message_id = %message.id, "Sending request");

    let outcome = coordinator
        .request(message, Some(Duration::from_secs(timeout_secs)))
        .await;
    coordinator.dispose().await;

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
