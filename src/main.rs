//! containerwatch - keeps running containers synchronized with the latest
//! registry images.

use std::sync::Arc;

use clap::Parser;
use containerwatch::config::{Cli, Commands, Config};
use containerwatch::notify::{LogSink, Level, SinkLayer};
use tracing::error;
use tracing_subscriber::prelude::*;

mod cmd;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("containerwatch={log_level}").into());

    // The sink starts at Info and is retuned once the full config (and its
    // --notifications-level) is parsed; it has to be wired in now so no
    // session log line is missed before that point.
    let log_sink = Arc::new(LogSink::new(Level::Info));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(SinkLayer::new(log_sink.clone()))
        .init();

    if let Some(Commands::Diagnostics) = cli.command {
        return cmd::diagnostics::run().await;
    }

    let config = match Config::from_cli(&cli) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = match cmd::root::run(config, log_sink).await {
        Ok(code) => code,
        Err(e) => {
            error!("daemon error: {e}");
            1
        }
    };

    std::process::exit(exit_code);
}
