use village_core::{Config, Paths};

/// Show the effective configuration as pretty-printed JSON.
pub async fn show() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;

    println!();
    println!("📋 Current Configuration");
    println!("  File: {}", paths.config_file().display());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Write the default configuration unless one exists (or `force` is set).
pub async fn init(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let path = paths.config_file();
    if path.exists() && !force {
        println!("Config already exists at {}", path.display());
        println!("Use --force to overwrite.");
        return Ok(());
    }

    paths.ensure_dirs()?;
    Config::default().save(&path)?;
    println!("✓ Wrote default config to {}", path.display());
    Ok(())
}
