//! Minimal process entry point.
//!
//! CLI argument parsing and YAML-based app discovery are explicitly out of
//! scope (spec.md §1); this binary just installs the logger, builds a
//! registry with default config, and starts accepting connections. A host
//! program that needs app factories, custom config, or a new-client callback
//! should depend on the `linkhub_server` library instead of this binary.

use std::sync::Arc;

use linkhub_server::config::NetworkConfig;
use linkhub_server::connection::{ConnectionServer, HeaderAckIdExtractor};
use linkhub_server::registry::Registry;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let registry = Registry::new(NetworkConfig::default());
    let server = ConnectionServer::new(registry, Arc::new(HeaderAckIdExtractor));

    if let Err(e) = server.run().await {
        log::error!("server exited: {e}");
        std::process::exit(1);
    }
}
