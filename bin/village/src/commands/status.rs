use village_core::{Config, Paths};

use crate::workers::build_coordinator;

/// Build a coordinator from the config and print its status snapshot.
pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let coordinator = build_coordinator(&config).await?;

    let config_path = paths.config_file();
    println!(
        "Config: {} {}",
        config_path.display(),
        if config_path.exists() { "✓" } else { "✗ (defaults)" }
    );
    println!();

    let status = coordinator.system_status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);

    coordinator.dispose().await;
    Ok(())
}
