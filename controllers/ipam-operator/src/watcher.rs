//! Kubernetes resource watcher.
//!
//! Feeds every observed `IPAMNode` version into the node manager.

use crate::error::ControllerError;
use crds::IPAMNode;
use futures::{Stream, StreamExt};
use ipam::NodeManager;
use kube::{Api, ResourceExt};
use kube_runtime::{WatchStreamExt, watcher};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Watches `IPAMNode` resources for changes.
pub struct Watcher {
    manager: Arc<NodeManager>,
    api: Api<IPAMNode>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").field("manager", &self.manager).finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(manager: Arc<NodeManager>, api: Api<IPAMNode>) -> Self {
        Self { manager, api }
    }

    /// Starts watching IPAMNode resources.
    ///
    /// Stream errors are logged and the watch is re-established with
    /// exponential backoff. Only returns if the stream itself ends.
    pub async fn watch_ipam_nodes(&self) -> Result<(), ControllerError> {
        info!("Starting IPAMNode watcher");

        let events = watcher(self.api.clone(), watcher::Config::default()).default_backoff();
        process_events(&self.manager, events).await;

        Err(ControllerError::Watch("IPAMNode watch stream ended".to_string()))
    }
}

/// Applies every event of `events` to `manager`, skipping over errors
async fn process_events<S, E>(manager: &Arc<NodeManager>, events: S)
where
    S: Stream<Item = Result<watcher::Event<IPAMNode>, E>>,
    E: Display,
{
    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => handle_event(manager, event).await,
            Err(err) => warn!(error = %err, "IPAMNode watch failed, retrying"),
        }
    }
}

async fn handle_event(manager: &Arc<NodeManager>, event: watcher::Event<IPAMNode>) {
    match event {
        watcher::Event::Apply(node) => {
            debug!("IPAMNode applied: {}", node.name_any());
            manager.upsert(&node).await;
        }
        watcher::Event::InitApply(node) => {
            debug!("IPAMNode init apply: {}", node.name_any());
            manager.upsert(&node).await;
        }
        watcher::Event::Delete(node) => {
            info!("IPAMNode deleted: {}", node.name_any());
            manager.delete(&node.name_any());
        }
        watcher::Event::Init => {
            info!("IPAMNode watcher initialized");
        }
        watcher::Event::InitDone => {
            info!("IPAMNode watcher initialization complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipam::mock::{MockNodeStore, MockPendingPods, MockProvider, ipam_node};
    use ipam::{IpamConfig, NoOpMetrics};

    fn manager(provider: &MockProvider) -> Arc<NodeManager> {
        NodeManager::new(
            IpamConfig::default(),
            Arc::new(provider.clone()),
            Arc::new(MockNodeStore::new()),
            Arc::new(NoOpMetrics),
            Arc::new(MockPendingPods::new(0)),
        )
    }

    #[tokio::test]
    async fn test_watch_errors_do_not_stop_processing() {
        let provider = MockProvider::new();
        let manager = manager(&provider);
        let events: Vec<Result<watcher::Event<IPAMNode>, String>> = vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(ipam_node("node-a"))),
            Ok(watcher::Event::InitDone),
            Err("connection reset by peer".to_string()),
            Ok(watcher::Event::Apply(ipam_node("node-b"))),
            Err("410 Gone".to_string()),
            Ok(watcher::Event::Apply(ipam_node("node-c"))),
        ];

        process_events(&manager, futures::stream::iter(events)).await;

        assert_eq!(
            manager.node_names(),
            vec!["node-a".to_string(), "node-b".to_string(), "node-c".to_string()]
        );
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_delete_event_removes_node() {
        let provider = MockProvider::new();
        let manager = manager(&provider);
        let events: Vec<Result<watcher::Event<IPAMNode>, String>> = vec![
            Ok(watcher::Event::Apply(ipam_node("node-a"))),
            Ok(watcher::Event::Apply(ipam_node("node-b"))),
            Ok(watcher::Event::Delete(ipam_node("node-a"))),
        ];

        process_events(&manager, futures::stream::iter(events)).await;

        assert_eq!(manager.node_names(), vec!["node-b".to_string()]);
        assert_eq!(provider.deleted(), vec!["node-a".to_string()]);
        manager.shutdown();
    }
}
