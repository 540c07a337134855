//! KluctlDeployment Controller
//!
//! Continuously reconciles KluctlDeployment resources: renders the referenced
//! project through the deployment pipeline, applies it to the target cluster,
//! validates the result and detects drift. Every command outcome is kept in
//! the result store, and manual requests arrive as annotations.

mod backoff;
mod config;
mod controller;
mod error;
mod in_flight;
mod pipeline;
mod reconcile_helpers;
mod reconciler;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube uses rustls; pin the ring provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("rustls crypto provider already installed");
    }

    info!("Starting KluctlDeployment Controller");

    // Load configuration from environment variables
    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Results namespace: {}", config.results_namespace);
    info!("  Results retention: {:?}", config.retention);
    info!("  Pipeline command: {}", config.pipeline_command);
    info!("  Concurrency: {}", config.concurrency);
    info!("  Cluster retry interval: {:?}", config.cluster_retry_interval);

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
