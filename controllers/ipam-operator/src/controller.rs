//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the IPAM engine to
//! the cluster and supervises its background tasks.

use crate::config::OperatorConfig;
use crate::error::ControllerError;
use crate::metrics::PrometheusMetrics;
use crate::pods::KubePendingPods;
use crate::server::{self, AppState};
use crate::store::KubeNodeStore;
use crate::watcher::Watcher;
use crds::IPAMNode;
use ipam::{CidrPoolProvider, MetricsApi, NodeManager};
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for per-node IP pools.
#[derive(Debug)]
pub struct Controller {
    manager: Arc<NodeManager>,
    node_watcher: JoinHandle<Result<(), ControllerError>>,
    resync: JoinHandle<()>,
    server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: OperatorConfig) -> Result<Self, ControllerError> {
        info!("Initializing IPAM Operator");

        let kube_client = Client::try_default().await?;

        let metrics = Arc::new(PrometheusMetrics::new()?);
        let provider = CidrPoolProvider::new(config.provider_config());
        let manager = NodeManager::new(
            config.ipam_config(),
            Arc::new(provider),
            Arc::new(KubeNodeStore::new(kube_client.clone())),
            Arc::clone(&metrics) as Arc<dyn MetricsApi>,
            Arc::new(KubePendingPods::new(kube_client.clone())),
        );

        let api: Api<IPAMNode> = Api::all(kube_client);
        let watcher = Watcher::new(Arc::clone(&manager), api);
        let node_watcher = tokio::spawn(async move { watcher.watch_ipam_nodes().await });

        let resync = manager.start(config.resync_interval);

        let state = AppState::new(metrics, Arc::clone(&manager));
        let addr = config.metrics_addr;
        let server = tokio::spawn(async move { server::serve(addr, state).await });

        Ok(Self {
            manager,
            node_watcher,
            resync,
            server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("IPAM Operator running");

        let result = tokio::select! {
            result = &mut self.node_watcher => {
                result
                    .map_err(|e| ControllerError::Watch(format!("IPAMNode watcher panicked: {}", e)))
                    .and_then(|r| r)
            }
            result = &mut self.resync => {
                result
                    .map_err(|e| ControllerError::Watch(format!("Resync loop panicked: {}", e)))
            }
            result = &mut self.server => {
                result
                    .map_err(|e| ControllerError::Server(format!("HTTP server panicked: {}", e)))
                    .and_then(|r| r)
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                Ok(())
            }
        };

        self.manager.shutdown();
        self.node_watcher.abort();
        self.server.abort();
        result
    }
}
