//! Pending pod lookup.

use ipam::{PendingPodCounter, PendingPodsError};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};

/// Counts `Pending` pods scheduled on a node through the Kubernetes API
#[derive(Clone)]
pub struct KubePendingPods {
    api: Api<Pod>,
}

impl std::fmt::Debug for KubePendingPods {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubePendingPods").finish_non_exhaustive()
    }
}

impl KubePendingPods {
    /// Creates a counter over pods in all namespaces
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

fn pending_pods_selector(node_name: &str) -> String {
    format!("spec.nodeName={node_name},status.phase=Pending")
}

#[async_trait::async_trait]
impl PendingPodCounter for KubePendingPods {
    async fn pending_pods(&self, node_name: &str) -> Result<usize, PendingPodsError> {
        let params = ListParams::default().fields(&pending_pods_selector(node_name));
        self.api
            .list_metadata(&params)
            .await
            .map(|pods| pods.items.len())
            .map_err(|e| PendingPodsError::List {
                node: node_name.to_string(),
                message: e.to_string(),
            })
    }
}
