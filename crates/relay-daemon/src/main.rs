//! relay-daemon: Signaling relay for collaborative whiteboard sessions.
//!
//! Accepts peer WebSocket connections, groups them into sessions and relays
//! drawing updates and WebRTC signaling between them. A small HTTP API on a
//! second port reports health and session presence.

use anyhow::Result;
use clap::Parser;
use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relay_core::{Relay, SignalingHandler};
use relay_daemon::api;
use relay_daemon::config::Config;
use relay_daemon::server::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(about = "Whiteboard signaling relay")]
struct Args {
    /// Address to listen on for peer WebSocket connections
    #[arg(short, long, default_value = "0.0.0.0:8000", env = "RELAY_LISTEN")]
    listen: String,

    /// Address for the HTTP query API
    #[arg(long, default_value = "0.0.0.0:8001", env = "RELAY_HTTP_LISTEN")]
    http: String,

    /// Path to the JSON config file (created with defaults if missing)
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,relay_daemon=debug,relay_core=debug"
    } else {
        "info,relay_daemon=info,relay_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting relay-daemon");
    info!("WebSocket address: {}", args.listen);
    info!("HTTP address: {}", args.http);

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let relay = Arc::new(Relay::new());
    let mut handler = SignalingHandler::new(Arc::clone(&relay));
    if let Some(store) = config.whiteboard_store()? {
        info!("Drawing persistence enabled");
        handler = handler.with_store(store);
    }

    let server = Arc::new(RelayServer::new(
        Arc::new(handler),
        config.identity_provider(),
        config.relay.clone(),
    ));
    let ws_listener = RelayServer::bind(&args.listen).await?;

    let http_listener = tokio::net::TcpListener::bind(&args.http).await?;
    info!("HTTP API listening on {}", args.http);
    let app = api::router(Arc::clone(&relay));

    info!("Relay running. Press Ctrl+C to stop.");

    tokio::select! {
        _ = server.run(ws_listener) => {}
        result = axum::serve(http_listener, app).into_future() => {
            if let Err(e) = result {
                error!("HTTP server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!(
        peers = relay.peer_count(),
        sessions = relay.session_count(),
        "Shutting down"
    );
    Ok(())
}
