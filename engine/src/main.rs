use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use relay_core::Config;
use relay_observability::{init_process_logging, ProcessKind};
use relay_server::{serve, AppState};

#[derive(Parser, Debug)]
#[command(name = "relayd")]
#[command(about = "relaymesh controller: agent links, REST API, UI event fan-out")]
struct Cli {
    /// Interface to bind; the port comes from Config (PORT env var).
    #[arg(long, default_value = "0.0.0.0")]
    hostname: String,
    #[arg(long, default_value = "./logs")]
    logs_dir: PathBuf,
    #[arg(long, default_value_t = 14)]
    log_retention_days: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env();

    let (_guards, info, audit_write_failures) = init_process_logging(
        ProcessKind::Controller,
        &cli.logs_dir,
        cli.log_retention_days,
        &config.log_level,
    )
    .context("failed to initialize logging")?;
    tracing::info!(?info, "logging initialized");

    let addr: SocketAddr = format!("{}:{}", cli.hostname, config.port)
        .parse()
        .context("invalid hostname or port")?;

    let state = AppState::new(&config).with_audit_write_failures(audit_write_failures);
    tracing::info!(%addr, "starting relayd");
    serve(addr, state, config).await
}
