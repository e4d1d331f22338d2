use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use node_app::{config_path, load_config, CONFIG_ENV};
use node_mesh::Mesh;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = config_path(std::env::args().nth(1), std::env::var(CONFIG_ENV).ok());
    let config = load_config(&path)?;

    tracing::info!("hopmesh starting...");
    tracing::info!("label      = {}", config.label);
    tracing::info!("listen     = {}:{}", config.bind_addr, config.port);
    tracing::info!("heartbeat  = {}s", config.heartbeat_secs);
    tracing::info!("peers      = {}", config.peers.len());

    let mesh = Mesh::start(config.to_mesh_config()?)
        .await
        .context("start mesh node")?;
    tracing::info!(
        "node {} up on port {} (key {})",
        mesh.label(),
        mesh.port(),
        node_crypto::fingerprint(mesh.public_key().as_bytes())
    );

    mesh.add_data_listener(|from, payload| {
        tracing::info!(from, "data: {payload}");
    });

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    mesh.shutdown().await;
    Ok(())
}
