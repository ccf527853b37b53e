//! pibridge - Raspberry Pi hardware to MQTT bridge daemon.
//!
//! A standalone binary intended to be supervised by the host init
//! system: it runs until SIGINT/SIGTERM and performs the safe-shutdown
//! sequence on the way out.

use clap::{Parser, Subcommand};
use pibridge::{config::Config, daemon, DEFAULT_CONFIG_PATH};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "pibridge")]
#[command(about = "Raspberry Pi hardware to MQTT bridge daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge daemon (default)
    Run,

    /// Validate the configuration file and exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli)?;

    match cli.command.as_ref().unwrap_or(&Commands::Run) {
        Commands::Run => {
            let config = Config::load(&cli.config)?;
            daemon::run(config).await?;
        }
        Commands::Check => {
            let config = Config::load(&cli.config)?;
            info!(device = config.device_id(), "configuration is valid");
            println!("configuration ok: device '{}'", config.device_id());
        }
    }

    Ok(())
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["pibridge", "--config", "/etc/pibridge.toml"]).unwrap();
        assert_eq!(cli.config, "/etc/pibridge.toml");
    }

    #[test]
    fn test_default_values() {
        let cli = Cli::try_parse_from(["pibridge"]).unwrap();
        assert_eq!(cli.config, DEFAULT_CONFIG_PATH);
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
    }
}
