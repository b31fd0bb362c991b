//! Standalone transaction coordinator binary.
//!
//! Binds the TCP server on `LODESTAR_TC_ADDRESS`/`LODESTAR_TC_PORT`
//! (default 127.0.0.1:8091), starts the timeout scanner, and serves until
//! killed. Log filtering follows `RUST_LOG` (default `info`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lodestar_core::config::CoordinatorConfig;
use lodestar_core::model::BranchType;
use lodestar_datasource::DataSourceManager;
use lodestar_resource::{
    AtResourceManager, Dispatcher, ExternalServiceClient, ExternalServiceConfig, InMemoryMqBackend,
    MessageQueueManager, StaticResolver, TccResourceManager, XaResourceManager,
};
use lodestar_tc::store::MetadataStore;
use lodestar_tc::{MemoryStore, SqliteStore, TcServer, TimeoutScanner, TransactionCoordinator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = CoordinatorConfig::new();
    if let Ok(address) = std::env::var("LODESTAR_TC_ADDRESS") {
        config.server.address = address;
    }
    if let Ok(port) = std::env::var("LODESTAR_TC_PORT") {
        config.server.port = port.parse().context("LODESTAR_TC_PORT must be a port number")?;
    }

    let store: Arc<dyn MetadataStore> = match std::env::var("LODESTAR_TC_STORE") {
        Ok(path) if !path.is_empty() => {
            info!(path = %path, "using SQLite metadata store");
            Arc::new(SqliteStore::open(&path)?)
        }
        _ => {
            info!("using in-memory metadata store");
            Arc::new(MemoryStore::new())
        }
    };

    let datasources = Arc::new(DataSourceManager::new());
    let resolver = Arc::new(StaticResolver::new());

    let dispatcher = Arc::new(Dispatcher::new(config.retry.clone()));
    dispatcher.register_handler(BranchType::At, Arc::new(AtResourceManager::new(datasources)));
    dispatcher.register_handler(BranchType::Tcc, Arc::new(TccResourceManager::new()));
    dispatcher.register_handler(BranchType::Xa, Arc::new(XaResourceManager::new()));
    dispatcher.register_handler(
        BranchType::Mq,
        Arc::new(MessageQueueManager::new(Arc::new(InMemoryMqBackend::new()))),
    );
    dispatcher.register_handler(
        BranchType::Http,
        Arc::new(ExternalServiceClient::new(resolver, ExternalServiceConfig::default())),
    );

    let coordinator = Arc::new(TransactionCoordinator::new(store, dispatcher, config.clone()));

    let scanner = TimeoutScanner::new(
        Arc::clone(&coordinator),
        Duration::from_millis(config.scan.interval_ms),
    )
    .start();

    let server = TcServer::bind(&config.server, coordinator).await?;
    let result = server.run().await;

    scanner.shutdown().await;
    result.context("TC server terminated")
}
