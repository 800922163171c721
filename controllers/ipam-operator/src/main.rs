//! IPAM Operator
//!
//! Keeps the IP address pool of every cluster node between its watermarks.
//!
//! This controller watches `IPAMNode` resources, allocates addresses from a
//! cluster CIDR ahead of demand, releases the excess once the node agent
//! agrees and publishes the result back to the resource.

mod config;
mod controller;
mod error;
mod metrics;
mod pods;
mod server;
mod store;
mod watcher;

use crate::config::OperatorConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider already installed");
    }

    info!("Starting IPAM Operator");

    let config = OperatorConfig::from_env()?;

    info!("Configuration:");
    info!("  CIDR: {}", config.cidr);
    info!("  Interfaces per node: {}", config.max_interfaces);
    info!("  IPs per interface: {}", config.ips_per_interface);
    info!("  Release excess IPs: {}", config.release_excess_ips);
    info!("  Resync interval: {:?}", config.resync_interval);
    info!("  Metrics address: {}", config.metrics_addr);

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
