//! Dargah proxy entry point.
//!
//! Order matters at startup: the audit store opens first so the log layer
//! can write into it, then telemetry, then the admin user bootstrap, then
//! the proxy itself (which dials every upstream), and finally the two
//! listeners.

use clap::Parser;
use dargah_common::{Config, Role};
use dargah_proxy::server::Proxy;
use dargah_proxy::{http_api, metrics, telemetry};
use dargah_store::{Store, StoreLayer};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let config = Config::parse();

    let store = Store::connect(&config.database_url).await?;
    store.migrate().await?;

    let store_layer = StoreLayer::spawn(store.logs());
    telemetry::init(&config.log_level, Some(store_layer))?;

    info!("Starting dargah v{}", env!("CARGO_PKG_VERSION"));
    info!("  listen address: {}", config.listen_address);
    info!("  upstreams: {:?}", config.servers);
    info!("  ping interval: {}s", config.ping_interval);
    info!("  pool size: {}", config.connection_pool_size);
    info!("  admin API: {}", config.http_listener);

    metrics::init_metrics();

    store
        .users()
        .upsert(&config.admin_user, &config.admin_password, Role::Admin)
        .await?;
    info!(username = %config.admin_user, "admin user bootstrapped");

    let proxy = Proxy::new(config.clone(), store).await?;

    let http_listener = tokio::net::TcpListener::bind(&config.http_listener).await?;
    let http_proxy = proxy.clone();
    tokio::spawn(async move {
        if let Err(err) = http_api::serve(http_proxy, http_listener).await {
            error!(error = %err, "admin API server error");
        }
    });

    let listener = proxy.bind().await?;

    let shutdown_proxy = proxy.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_proxy.shutdown().await;
        }
    });

    proxy.run(listener).await
}
