//! Main entry point for the dialer engine server.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use dialer_engine::config::ProviderKind;
use dialer_engine::logging::{setup_logging, LoggingConfig};
use dialer_engine::server::DialerServerBuilder;
use dialer_engine::EngineConfig;

/// Outbound campaign dialing engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP API bind address (overrides api.bind_address)
    #[arg(short, long)]
    bind: Option<String>,

    /// Database URL (overrides database.url)
    #[arg(short, long)]
    database_url: Option<String>,

    /// Log level (overrides logging.level)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,

    /// Use the simulated provider with scripted call progress
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = EngineConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.api.bind_address = bind;
    }
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.json_logs {
        config.logging.json = true;
    }
    if args.simulate {
        config.provider.kind = ProviderKind::Simulated;
        config.provider.simulation.auto_progress = true;
    }
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;

    setup_logging(LoggingConfig::from_settings(&config.logging)?)?;

    let mut server = DialerServerBuilder::new()
        .with_config(config)
        .build()
        .await
        .context("building dialer server")?;

    server.run_until_shutdown().await?;
    Ok(())
}
