//! Node manager.
//!
//! Owns every [`Node`], creates them on first sight of their resource and
//! wires each node's background jobs. The periodic resync refreshes the
//! provider, flips the API-ready flag and re-evaluates all nodes.

use crate::config::IpamConfig;
use crate::metrics::MetricsApi;
use crate::node::{Node, NodeContext, NodeTriggers};
use crate::ops::{IpamProvider, PendingPodCounter};
use crate::store::NodeStore;
use crate::trigger::{JobTrigger, Trigger};
use crds::IPAMNode;
use futures::StreamExt;
use kube::ResourceExt;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Nodes resynced concurrently
const RESYNC_CONCURRENCY: usize = 16;

/// Keeps track of all nodes with an `IPAMNode` resource
pub struct NodeManager {
    ctx: Arc<NodeContext>,
    provider: Arc<dyn IpamProvider>,
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeManager")
            .field("ctx", &self.ctx)
            .field("nodes", &self.node_names())
            .finish_non_exhaustive()
    }
}

impl NodeManager {
    /// Creates a manager. Nodes are created lazily by [`NodeManager::upsert`].
    pub fn new(
        config: IpamConfig,
        provider: Arc<dyn IpamProvider>,
        store: Arc<dyn NodeStore>,
        metrics: Arc<dyn MetricsApi>,
        pods: Arc<dyn PendingPodCounter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::new(NodeContext::new(config, store, metrics, pods)),
            provider,
            nodes: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Context shared by all nodes
    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// True when the last provider resync succeeded
    pub fn instances_api_is_ready(&self) -> bool {
        self.ctx.instances_api_is_ready()
    }

    /// Node by name
    pub fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Names of all managed nodes, sorted
    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn all_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Creates or updates the node for `resource`.
    ///
    /// A new node is synced to the store right away. Returns true if
    /// allocation is needed.
    pub async fn upsert(self: &Arc<Self>, resource: &IPAMNode) -> bool {
        let name = resource.name_any();
        let (node, created) = match self.get(&name) {
            Some(node) => (node, false),
            None => {
                let candidate = self.create_node(resource);
                let node = {
                    let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
                    Arc::clone(nodes.entry(name.clone()).or_insert_with(|| Arc::clone(&candidate)))
                };
                if Arc::ptr_eq(&node, &candidate) {
                    info!(node = %name, "Discovered new IPAMNode");
                    (node, true)
                } else {
                    // Lost a race with a concurrent upsert
                    candidate.shutdown();
                    (node, false)
                }
            }
        };

        let allocation_needed = node.updated_resource(resource).await;
        if created {
            node.triggers().k8s_sync.trigger();
        }
        allocation_needed
    }

    /// Stops and forgets the node `name`, returning its addresses to the
    /// provider and dropping its per-node metrics
    pub fn delete(&self, name: &str) {
        let removed = self
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if let Some(node) = removed {
            info!(node = %name, "Removing IPAMNode");
            node.shutdown();
            self.provider.delete_node(name);
            self.ctx.metrics.remove_node(name);
        }
    }

    fn create_node(self: &Arc<Self>, resource: &IPAMNode) -> Arc<Node> {
        let name = resource.name_any();
        let ops = self.provider.create_node(resource);
        let config = &self.ctx.config;
        let manager = Arc::downgrade(self);
        let provider = Arc::clone(&self.provider);

        Node::new(name.clone(), ops, Arc::clone(&self.ctx), &self.shutdown, |node, cancel| {
            build_triggers(&name, config, node, cancel, manager, provider)
        })
    }

    /// Re-evaluates every node against provider state as of `sync_time`.
    ///
    /// Nodes with the largest deficit go first.
    pub async fn resync(&self, sync_time: Instant) {
        let mut nodes = self.all_nodes();
        nodes.sort_by_key(|node| Reverse(node.get_needed_addresses()));

        futures::stream::iter(nodes)
            .for_each_concurrent(RESYNC_CONCURRENCY, |node| async move {
                self.resync_node(&node, sync_time).await;
            })
            .await;
    }

    async fn resync_node(&self, node: &Node, sync_time: Instant) {
        node.update_last_resync(sync_time);
        node.recalculate().await;

        if node.allocation_needed() || node.release_needed() {
            node.require_pool_maintenance();
            node.triggers().pool_maintainer.trigger();
        }

        self.ctx.metrics.update_node_stats(node.name(), &node.stats());
        node.triggers().k8s_sync.trigger();
    }

    /// Refreshes the provider and resyncs all nodes. Blocks mutating
    /// operations while the provider API is unstable.
    pub async fn resync_instances(&self) -> bool {
        match self.provider.resync().await {
            Some(sync_time) => {
                if !self.ctx.set_instances_api_ready(true) {
                    info!("Instances API is ready");
                }
                self.resync(sync_time).await;
                true
            }
            None => {
                self.ctx.set_instances_api_ready(false);
                warn!("Unable to synchronize instances API, blocking mutating operations");
                false
            }
        }
    }

    /// Spawns the periodic provider resync
    pub fn start(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;
                    () = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                manager.resync_instances().await;
            }
            debug!("Node manager resync stopped");
        })
    }

    /// Stops the periodic resync and every node's background jobs
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn build_triggers(
    name: &str,
    config: &IpamConfig,
    node: &Weak<Node>,
    cancel: &CancellationToken,
    manager: Weak<NodeManager>,
    provider: Arc<dyn IpamProvider>,
) -> NodeTriggers {
    let pool_maintainer = Trigger::new(
        format!("ipam-pool-maintainer-{name}"),
        config.maintenance_min_interval,
        cancel,
        {
            let node = node.clone();
            move || {
                let node = node.upgrade();
                async move {
                    let Some(node) = node else { return };
                    if let Err(err) = node.maintain_ip_pool().await {
                        warn!(node = %node.name(), error = %err, "Unable to maintain ip pool of node");
                    }
                }
            }
        },
    );

    let retry = Trigger::new(
        format!("ipam-pool-maintainer-{name}-retry"),
        config.retry_min_interval,
        cancel,
        {
            let pool_maintainer = pool_maintainer.clone();
            move || {
                let pool_maintainer = pool_maintainer.clone();
                async move {
                    pool_maintainer.trigger();
                }
            }
        },
    );

    let k8s_sync = Trigger::new(
        format!("ipam-node-k8s-sync-{name}"),
        config.sync_min_interval,
        cancel,
        {
            let node = node.clone();
            move || {
                let node = node.upgrade();
                async move {
                    let Some(node) = node else { return };
                    if let Err(err) = node.sync_to_api_server().await {
                        warn!(node = %node.name(), error = %err, "Unable to synchronize IPAMNode");
                    }
                }
            }
        },
    );

    let instance_sync = Trigger::new(
        format!("ipam-node-instance-sync-{name}"),
        config.sync_min_interval,
        cancel,
        {
            let node = node.clone();
            move || {
                let node = node.upgrade();
                let manager = manager.clone();
                let provider = Arc::clone(&provider);
                async move {
                    let Some(node) = node else { return };
                    let instance_id = node.instance_id().unwrap_or_else(|| node.name().to_string());
                    debug!(node = %node.name(), instance_id = %instance_id, "Synchronizing instance");
                    let Some(sync_time) = provider.instance_sync(&instance_id).await else {
                        warn!(node = %node.name(), "Unable to synchronize instance");
                        return;
                    };
                    if let Some(manager) = manager.upgrade() {
                        manager.resync(sync_time).await;
                    }
                }
            }
        },
    );

    NodeTriggers {
        pool_maintainer: Arc::new(pool_maintainer),
        k8s_sync: Arc::new(k8s_sync),
        instance_sync: Arc::new(instance_sync),
        retry: Some(Arc::new(retry)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{AllocationAction, IPAllocationAction};
    use crate::metrics::NoOpMetrics;
    use crate::mock::{MockNodeStore, MockPendingPods, MockProvider, RecordingMetrics, ipam_node};
    use crate::provider::{CidrPoolProvider, CidrProviderConfig};

    fn manager_with(provider: &MockProvider, store: &MockNodeStore) -> Arc<NodeManager> {
        NodeManager::new(
            IpamConfig::default(),
            Arc::new(provider.clone()),
            Arc::new(store.clone()),
            Arc::new(NoOpMetrics),
            Arc::new(MockPendingPods::default()),
        )
    }

    fn with_room(provider: &MockProvider, name: &str) {
        provider.ops(name).state().allocation = AllocationAction {
            interface_id: "eth0".to_string(),
            pool_id: "subnet-1".to_string(),
            empty_interface_slots: 0,
            ipv4: IPAllocationAction {
                available_for_allocation: 16,
                max_ips_to_allocate: 0,
                interface_candidates: 1,
            },
        };
    }

    async fn settle() {
        // Let trigger workers and their follow-up jobs run
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_creates_node_and_fills_pool() {
        let provider = MockProvider::new();
        let store = MockNodeStore::new();
        with_room(&provider, "node-a");
        let manager = manager_with(&provider, &store);
        manager.resync_instances().await;

        let resource = store.insert(ipam_node("node-a"));
        assert!(manager.upsert(&resource).await);
        settle().await;

        assert_eq!(manager.node_names(), vec!["node-a".to_string()]);
        assert_eq!(provider.ops("node-a").available_ips().len(), 4);
        assert!(provider.instance_syncs() >= 1);

        // The new node was published to the store
        let stored = store.stored("node-a").unwrap();
        assert_eq!(stored.spec.ipam.pool.len(), 4);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstable_provider_blocks_allocation() {
        let provider = MockProvider::new();
        provider.set_unstable(true);
        let store = MockNodeStore::new();
        with_room(&provider, "node-a");
        let manager = manager_with(&provider, &store);

        assert!(!manager.resync_instances().await);
        assert!(!manager.instances_api_is_ready());

        let resource = store.insert(ipam_node("node-a"));
        manager.upsert(&resource).await;
        settle().await;
        assert_eq!(provider.ops("node-a").call_count("allocate_ips"), 0);

        // API recovers, the retry re-arms maintenance
        provider.set_unstable(false);
        assert!(manager.resync_instances().await);
        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(provider.ops("node-a").call_count("allocate_ips"), 1);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_reports_node_stats() {
        let provider = MockProvider::new();
        let store = MockNodeStore::new();
        let metrics = Arc::new(RecordingMetrics::default());
        let manager = NodeManager::new(
            IpamConfig::default(),
            Arc::new(provider.clone()),
            Arc::new(store.clone()),
            metrics.clone(),
            Arc::new(MockPendingPods::default()),
        );

        for name in ["node-a", "node-b"] {
            manager.upsert(&store.insert(ipam_node(name))).await;
        }
        manager.resync(Instant::now()).await;

        let stats = metrics.node_stats.lock().unwrap().clone();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["node-a"].ipv4.needed_ips, 4);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_stops_node() {
        let provider = MockProvider::new();
        let store = MockNodeStore::new();
        let manager = manager_with(&provider, &store);

        manager.upsert(&store.insert(ipam_node("node-a"))).await;
        assert!(manager.get("node-a").is_some());
        manager.delete("node-a");

        assert!(manager.get("node-a").is_none());
        assert!(manager.node_names().is_empty());
        assert_eq!(provider.deleted(), vec!["node-a".to_string()]);

        // Deleting an unknown node does not reach the provider
        manager.delete("node-b");
        assert_eq!(provider.deleted().len(), 1);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_returns_cidr_addresses_and_drops_stats() {
        let provider = CidrPoolProvider::new(CidrProviderConfig {
            cidr: "10.1.0.0/24".parse().unwrap(),
            max_interfaces: 2,
            ips_per_interface: 4,
        });
        let store = MockNodeStore::new();
        let metrics = Arc::new(RecordingMetrics::default());
        let manager = NodeManager::new(
            IpamConfig::default(),
            Arc::new(provider.clone()),
            Arc::new(store.clone()),
            metrics.clone(),
            Arc::new(MockPendingPods::default()),
        );
        manager.resync_instances().await;

        manager.upsert(&store.insert(ipam_node("node-a"))).await;
        settle().await;
        assert_eq!(provider.allocated_count(), 4);
        assert!(metrics.node_stats.lock().unwrap().contains_key("node-a"));

        manager.delete("node-a");

        assert_eq!(provider.allocated_count(), 0);
        assert!(!metrics.node_stats.lock().unwrap().contains_key("node-a"));
        manager.shutdown();
    }
}
