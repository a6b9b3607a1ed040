use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info};
use worldgraph::{
    config::Config,
    mirror::{MirrorServer, MirrorState},
};

/// Shared mirror server for worldgraph peers.
#[derive(Parser, Debug)]
struct Cli {
    /// Path to config file
    #[clap(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Cli::parse();

    debug!(config = ?args.config, "loading config");
    let config = Config::load_or_default(args.config.as_deref())?;

    let server = MirrorServer::spawn(config.mirror.bind_addr, MirrorState::new()).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await?;
    Ok(())
}
