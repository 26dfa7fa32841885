//! Reference tagsync backend.
//!
//! Serves the tag-sync WebSocket endpoint and an in-memory project/version
//! store, enough to drive the client end to end:
//! - `sync_tags` requests are debounced per project, parsed from structured
//!   text and broadcast as `tags_updated` to that project's subscribers
//! - autosaves, saves and versions live in memory until the process exits
//!
//! Run:
//!   cargo run -p tagsync-demo-server -- --port 8080 --ws-port 8081 --token secret
//!
//! Then:
//!   curl -H 'Authorization: Bearer secret' localhost:8080/api/projects/p1/versions

mod parser;
mod rest;
mod ws;

use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tagsync-demo-server")]
struct Args {
    /// HTTP port for the project store.
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// WebSocket port for tag sync.
    #[arg(long, default_value_t = 8081)]
    ws_port: u16,
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    bind: IpAddr,
    /// Token clients must present. Unset accepts every client.
    #[arg(long, env = "TAGSYNC_TOKEN")]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tagsync_demo_server=info".parse()?))
        .init();

    let args = Args::parse();
    if args.token.is_none() {
        tracing::warn!("No token configured, accepting every client");
    }

    let hub = Arc::new(ws::Hub::new(args.token.clone()));
    tokio::try_join!(
        rest::run(SocketAddr::new(args.bind, args.port), args.token),
        ws::run(SocketAddr::new(args.bind, args.ws_port), hub),
    )?;
    Ok(())
}
