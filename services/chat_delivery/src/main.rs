use anyhow::Result;
use chat_delivery::{api, config};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();
    let cfg = config::Config::load(&cli)?;
    let level = if cfg.logging_enabled { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!(bind = %cfg.bind, data_dir = %cfg.data_dir.display(), "starting chat_delivery");
    api::run_http_server(cfg).await
}
