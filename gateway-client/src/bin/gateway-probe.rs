//! Gateway probe
//!
//! Connects to the agent gateway, completes the handshake, prints the
//! advertised methods and then logs push events until Ctrl-C.

use std::env;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use missiondesk_gateway::{load_file_config, GatewayClient, GatewayConfig};
use tokio::time::timeout;
use tracing::{info, warn};

const READY_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| {
        if env::var("GATEWAY_DEBUG").ok().as_deref() == Some("1") {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config_path = env::var("MISSIONDESK_CONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            let candidate = env::current_dir().ok()?.join("missiondesk.toml");
            candidate.is_file().then_some(candidate)
        });

    let mut config = load_file_config(config_path.as_deref())?.unwrap_or_default();
    config.apply_env();
    if config.token.is_none() {
        warn!("No gateway token configured - the gateway may refuse the connect request");
    }

    run(config).await
}

async fn run(config: GatewayConfig) -> Result<()> {
    let client = GatewayClient::websocket(config);
    let mut events = client
        .take_events()
        .context("push event receiver already taken")?;

    if !client.start() {
        let status = client.status();
        bail!(
            "gateway client not started: {}",
            status.last_error.unwrap_or_else(|| "unknown".into())
        );
    }

    timeout(READY_TIMEOUT, client.ready())
        .await
        .context("timed out waiting for gateway handshake")??;

    let status = client.status();
    info!(
        "Connected to gateway {} ({} methods)",
        status.server_version.as_deref().unwrap_or("unknown"),
        status.methods.len()
    );
    for method in &status.methods {
        println!("{method}");
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    info!(event = %event.event, seq = ?event.seq, "push: {}", event.payload)
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing gateway connection");
                break;
            }
        }
    }

    client.stop().await;
    Ok(())
}
