//! Parley relay server.
//!
//! A TCP server that relays broadcast text, private text and files between
//! named participants.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:7500
//! cargo run --bin parley-relay
//!
//! # Run on a custom address
//! cargo run --bin parley-relay -- --host 127.0.0.1 --port 8080
//!
//! # Or via environment variables
//! PARLEY_HOST=127.0.0.1 PARLEY_PORT=8080 cargo run --bin parley-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use parley_relay::config::{RelayCliArgs, RelayConfig};
use parley_relay::relay::{self, RelayState};
use tokio::sync::broadcast;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let bind_addr = config.bind_addr();
    tracing::info!(
        addr = %bind_addr,
        duplicate_policy = ?config.duplicate_policy,
        max_frame_size = config.max_frame_size,
        "starting parley relay server"
    );

    let state = Arc::new(RelayState::with_config(&config));
    tokio::spawn(log_activity(state.subscribe()));

    match relay::start_server_with_state(&bind_addr, state).await {
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

/// Prints relay activity as it happens.
async fn log_activity(mut events: broadcast::Receiver<parley_relay::events::RelayEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => tracing::info!(target: "parley_relay::activity", "{event}"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "activity log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
