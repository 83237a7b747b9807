//! Rendezvous/relay server binary — a lightweight WebSocket relay that
//! never sees plaintext or even frame contents, only `PeerId`s and
//! opaque byte blobs.
//!
//! # Usage
//!
//! ```bash
//! mesh-relayd --bind 0.0.0.0:9000
//! ```

use clap::Parser;
use mesh_relay::config::{RelayCliArgs, RelayConfig};
use mesh_relay::server;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    tracing::info!(addr = %config.bind_addr, rate_per_sec = config.rate_per_sec, burst = config.burst, "starting mesh relay server");

    let state = std::sync::Arc::new(server::RelayState::with_rate_limit(config.rate_per_sec, config.burst));
    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
