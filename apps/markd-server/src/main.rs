//! Bookmark relay server
//! Serves an in-memory collaborator to markd clients over WebSocket

use anyhow::Result;
use clap::Parser;
use markd::{MemoryBackend, Relay};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "markd-server")]
#[command(about = "Relay bookmark changes between markd clients")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: String,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_filter = if cli.verbose {
        "markd_server=debug,markd=debug"
    } else {
        "markd_server=info,markd=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let listener = TcpListener::bind(&cli.addr).await?;
    info!("markd relay listening on: {}", cli.addr);

    let relay = Relay::new(Arc::new(MemoryBackend::new()));

    tokio::select! {
        result = relay.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    Ok(())
}
