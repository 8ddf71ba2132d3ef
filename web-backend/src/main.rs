mod handlers;
mod routes;
mod security;
mod settings;
mod state;

use bloodlink_core::{SecuritySettings, SystemClock};
use settings::ServerSettings;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("BLOODLINK_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("bloodlink.toml"));

    let server = ServerSettings::load(Some(&config_path))?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&server.log_level))
        .with_target(false)
        .init();

    let security = SecuritySettings::load(Some(&config_path))?;
    let state = AppState::new(security, &server, Arc::new(SystemClock)).await?;
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(server.bind_address()).await?;
    info!(address = %listener.local_addr()?, "BloodLink API listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
