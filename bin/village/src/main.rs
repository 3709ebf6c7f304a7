mod commands;
mod workers;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "village")]
#[command(about = "Coordinate a pool of in-process workers", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the coordinator status as JSON
    Status,

    /// Send one request to a worker and print its reply
    Send {
        /// Target worker id
        #[arg(long, default_value = "A")]
        to: String,

        /// Text to put in the request payload
        #[arg(long)]
        text: String,

        /// Retries after a failed attempt
        #[arg(long, default_value_t = 0)]
        retries: u32,

        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },

    /// Run the coordinator with heartbeat and sampling until Ctrl-C
    Run {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Status => {
            commands::status::run().await?;
        }
        Commands::Send {
            to,
            text,
            retries,
            timeout,
        } => {
            commands::send::run(to, text, retries, timeout).await?;
        }
        Commands::Run { seconds } => {
            commands::run_cmd::run(seconds).await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                commands::config_cmd::show().await?;
            }
            ConfigCommands::Init { force } => {
                commands::config_cmd::init(force).await?;
            }
        },
    }

    Ok(())
}
