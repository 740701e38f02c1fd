//! Nodescope Daemon - error diagnostics for a node-graph host
//!
//! Follows the host log, classifies tracebacks, and watches the plugin tree.

use anyhow::Result;
use nodescoped::changes::PluginWatcher;
use nodescoped::{Config, DiagnosticsService};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Nodescope Daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::load();
    let service = match DiagnosticsService::new(config) {
        Ok(service) => service,
        Err(e) => {
            error!("Cannot start: {}", e);
            return Err(e);
        }
    };

    if let Err(e) = service.ensure_watching() {
        warn!("Log watcher not started: {}", e);
    }

    let _plugins = match &service.config().nodes.plugin_root {
        Some(root) => match PluginWatcher::new(root, service.state().clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Plugin watcher disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let status = service.status();
    info!(
        "Nodescope Daemon ready ({} patterns, {} node types)",
        status.pattern_count, status.registry_types
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down gracefully");
    service.shutdown().await;

    Ok(())
}
