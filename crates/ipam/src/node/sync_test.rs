use crate::config::IpamConfig;
use crate::error::{IpamError, StoreError};
use crate::mock::{MockNodeOperations, NodeHarness, WriteKind, ipam_node, set_used};

const NODE: &str = "node-a";

fn harness() -> NodeHarness {
    let ops = MockNodeOperations::with_available(3);
    ops.state().min_allocatable = 6;
    NodeHarness::new(IpamConfig::default(), NODE, ops)
}

fn unseeded_resource() -> crds::IPAMNode {
    let mut resource = ipam_node(NODE);
    resource.spec.ipam.pre_allocate = 0;
    resource
}

#[tokio::test]
async fn test_status_is_written_before_spec() {
    let h = harness();
    h.attach(unseeded_resource()).await;

    h.node.sync_to_api_server().await.unwrap();

    let writes = h.store.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].kind, WriteKind::Status);
    assert_eq!(writes[1].kind, WriteKind::Spec);
    assert!(writes[0].resource_version < writes[1].resource_version);

    let status = writes[0].node.ipam_status().unwrap();
    assert_eq!(status.interfaces["eth0"].addresses.len(), 3);

    let spec = &writes[1].node.spec.ipam;
    assert_eq!(spec.pool.len(), 3);
    assert_eq!(spec.pre_allocate, 6);
}

#[tokio::test]
async fn test_unchanged_node_is_not_rewritten() {
    let h = harness();
    h.attach(unseeded_resource()).await;
    h.node.sync_to_api_server().await.unwrap();

    h.refresh().await;
    h.node.sync_to_api_server().await.unwrap();

    assert_eq!(h.store.writes().len(), 2);
}

#[tokio::test]
async fn test_status_conflict_refetches_and_retries() {
    let h = harness();
    h.attach(unseeded_resource()).await;
    h.store.inject_conflicts(WriteKind::Status, 1);

    h.node.sync_to_api_server().await.unwrap();

    let writes = h.store.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].kind, WriteKind::Status);
}

#[tokio::test]
async fn test_stale_base_version_keeps_concurrent_agent_write() {
    let h = harness();
    h.attach(unseeded_resource()).await;

    // The agent reports usage before the node saw the new version
    h.store
        .modify(NODE, |node| set_used(node, &["10.0.0.1"]))
        .unwrap();

    h.node.sync_to_api_server().await.unwrap();

    let stored = h.store.stored(NODE).unwrap();
    assert!(stored.ipam_status().unwrap().used.contains_key("10.0.0.1"));
    assert_eq!(stored.spec.ipam.pool.len(), 3);
}

#[tokio::test]
async fn test_persistent_status_conflict_surfaces_error() {
    let h = harness();
    h.attach(unseeded_resource()).await;
    h.store.inject_conflicts(WriteKind::Status, 2);

    let err = h.node.sync_to_api_server().await.unwrap_err();

    assert!(matches!(err, IpamError::Store(StoreError::Conflict(_))));
    assert!(h.store.writes().is_empty());
}

#[tokio::test]
async fn test_persistent_spec_conflict_surfaces_error() {
    let h = harness();
    h.attach(unseeded_resource()).await;
    h.store.inject_conflicts(WriteKind::Spec, 2);

    let err = h.node.sync_to_api_server().await.unwrap_err();

    assert!(matches!(err, IpamError::Store(StoreError::Conflict(_))));
    let writes = h.store.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].kind, WriteKind::Status);
}

#[tokio::test]
async fn test_sync_without_resource_is_noop() {
    let h = harness();

    h.node.sync_to_api_server().await.unwrap();

    assert!(h.store.writes().is_empty());
}

#[tokio::test]
async fn test_assigned_static_ip_is_published() {
    let h = harness();
    h.ops.state().static_ip = Some("192.0.2.10".to_string());
    let mut resource = unseeded_resource();
    resource.spec.ipam.static_ip_tags = Some([("pool".to_string(), "egress".to_string())].into());
    h.attach(resource).await;
    h.node.maintain_ip_pool().await.unwrap();

    h.node.sync_to_api_server().await.unwrap();

    let stored = h.store.stored(NODE).unwrap();
    assert_eq!(
        stored.ipam_status().unwrap().assigned_static_ip.as_deref(),
        Some("192.0.2.10")
    );
}
