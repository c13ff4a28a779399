use std::path::PathBuf;

use alpine_operator::config::EffectiveConfig;
use alpine_operator::controller;
use alpine_operator::logging::{init_logging, LogFormat};
use anyhow::Context;
use clap::Parser;
use kube::Client;
use tracing::info;

/// Keeps one worker pod running per Alpine resource.
#[derive(Parser, Debug)]
#[command(name = "alpine-operator", version, about)]
struct Cli {
    /// TOML config file (also read from ALPINE_OPERATOR_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,
    /// trace|debug|info|warn|error; RUST_LOG overrides
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;
    let config = EffectiveConfig::load(cli.config.as_deref()).context("load config")?;
    info!(?config, "operator starting");
    let client = Client::try_default().await.context("Failed to create Kubernetes client")?;
    controller::run(client, config).await
}
