//! loghouse daemon: boots the storage engine and serves the HTTP API.

use clap::Parser;
use loghouse::{api, Config, Engine};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Persistent columnar log storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log filter, e.g. "info" or "loghouse=debug"
    #[arg(long, env = "DB_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level)?)
        .init();

    let config = Config::from_env()?;
    let engine = Arc::new(Engine::bootstrap(&config).await?);
    api::serve(engine, &config).await?;
    Ok(())
}
