use std::sync::Arc;

use lagrange::config::NodeConfig;
use lagrange::messaging::TcpTransport;
use lagrange::messaging::transport::scheme_of;
use lagrange::replication::{ExecutorFactory, RqliteExecutorFactory, SqliteExecutorFactory};
use lagrange::{Node, NodeOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lagrange=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match NodeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    // Bare host:port means a TCP peer.
    if let Some(existing) = &config.existing_node
        && scheme_of(existing).is_none()
    {
        config.existing_node = Some(format!("tcp://{existing}"));
    }
    tracing::info!(
        "Loaded configuration: listen_address={}, existing_node={:?}, replication_factor={}",
        config.listen_address,
        config.existing_node,
        config.replication_factor
    );

    let transport = TcpTransport::bind(&config.listen_address)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind: {e}");
            std::process::exit(1);
        });

    let executor_factory: Arc<dyn ExecutorFactory> = match &config.rqlite_url {
        Some(url) => {
            tracing::info!("Using rqlite at {url}");
            Arc::new(RqliteExecutorFactory::new(url.clone()))
        }
        None => Arc::new(SqliteExecutorFactory::in_memory()),
    };

    let node = Node::start(NodeOptions::from_config(&config, transport, executor_factory))
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to start node: {e}");
            std::process::exit(1);
        });
    tracing::info!("node {} listening on {}", node.id(), node.address());

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to wait for shutdown signal: {e}");
    }
    if let Err(e) = node.shutdown().await {
        tracing::error!("Shutdown failed: {e}");
        std::process::exit(1);
    }
}
