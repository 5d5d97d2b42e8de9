#![allow(dead_code)]

use std::sync::Arc;

use rusd_client::{Client, ClientConfig, EmbeddedCluster};
use tracing_subscriber::filter::EnvFilter;

/// Installs a test-writer subscriber once per test binary. `RUST_LOG`
/// overrides the default `warn` level.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_test_writer()
        .try_init();
}

/// Starts an embedded cluster and connects a client with default settings.
pub fn start() -> (Arc<EmbeddedCluster>, Client) {
    start_with(ClientConfig::default())
}

pub fn start_with(config: ClientConfig) -> (Arc<EmbeddedCluster>, Client) {
    init_tracing();
    let cluster = EmbeddedCluster::start();
    let client = Client::from_backend(cluster.clone(), config).expect("valid client config");
    (cluster, client)
}

/// Additional client on the same cluster, with its own keepalive worker.
pub fn connect(cluster: &Arc<EmbeddedCluster>) -> Client {
    Client::from_backend(cluster.clone(), ClientConfig::default()).expect("valid client config")
}
