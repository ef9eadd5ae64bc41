//! Echo round-trip over the software fabric.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rclink_fabric::sim::SimFabric;
use rclink_transport::client;
use rclink_transport::config::{ClientConfig, ServerConfig};
use rclink_transport::server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let fabric = Arc::new(SimFabric::new());
    let config = ServerConfig {
        listen_addr: "10.0.0.1:20079".to_string(),
        ..ServerConfig::default()
    };
    let addr = config.listen_addr.clone();
    let handle = Server::new(Arc::clone(&fabric), config).spawn()?;

    let mut conn = client::connect(Arc::clone(&fabric), &addr, ClientConfig::default()).await?;
    for msg in ["hello", "fabric", "echo"] {
        let reply = conn.request(msg.as_bytes()).await?;
        info!(sent = msg, received = %String::from_utf8_lossy(&reply), "round trip");
    }
    conn.disconnect()?;

    handle.shutdown().await?;
    let stats = fabric.stats();
    info!(
        echoes = stats.recvs_completed,
        balanced = stats.balanced(),
        "done"
    );
    Ok(())
}
