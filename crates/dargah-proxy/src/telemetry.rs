//! Tracing initialization.
//!
//! Structured logs go to stdout (pretty for development, JSON when
//! `JSON_LOGS=true`) and, when a store layer is supplied, into the audit
//! database for the admin surface to browse.

use anyhow::Result;
use dargah_store::StoreLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global subscriber. Call once, before any logging.
pub fn init(log_level: &str, store_layer: Option<StoreLayer>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let json_logs = std::env::var("JSON_LOGS")
        .map(|v| v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter).with(store_layer);

    if json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    Ok(())
}
