// src/bin/hub.rs
// The `clouddrop-hub` binary: parses `HubConfig`, wires up tracing, and
// serves the signaling hub's axum router.
//
// Grounded on the teacher's `SignalingServer::new(...).start()` entry point
// (signaling.rs), generalized from a raw UDP listener to an axum HTTP
// server bound on a configurable address.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use clouddrop::config::HubConfig;
use clouddrop::hub::{Hub, HubAppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("clouddrop=info".parse()?))
        .init();

    let config = HubConfig::parse();
    let bind_addr = config.bind_addr;

    let state = HubAppState {
        hub: Arc::new(Hub::new()),
        config: Arc::new(config),
    };

    let app = clouddrop::hub::router(state);

    tracing::info!(%bind_addr, "starting clouddrop-hub");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
