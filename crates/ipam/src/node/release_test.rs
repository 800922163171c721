use crate::config::IpamConfig;
use crate::error::{IpamError, ProviderError};
use crate::metrics;
use crate::mock::{MockNodeOperations, NodeHarness, ipam_node, set_used};
use crds::{AllocationIP, IPAMNode, IPReleaseStatus};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

const NODE: &str = "node-a";
const IP9: &str = "10.0.0.9";
const IP10: &str = "10.0.0.10";

fn excess_harness() -> NodeHarness {
    let config = IpamConfig {
        release_excess_ips: true,
        ..IpamConfig::default()
    };
    let ops = MockNodeOperations::with_available(10);
    ops.state().release_candidates = vec![IP9.to_string(), IP10.to_string()];
    NodeHarness::new(config, NODE, ops)
}

/// 10 available, 2 used, pre-allocate 4 and 2 above watermark: 2 excess
fn excess_resource() -> IPAMNode {
    let mut resource = ipam_node(NODE);
    resource.spec.ipam.max_above_watermark = 2;
    set_used(&mut resource, &["10.0.0.1", "10.0.0.2"]);
    resource
}

fn used(h: &NodeHarness, ips: &[&str]) {
    h.store.modify(NODE, |node| set_used(node, ips)).unwrap();
}

fn agent_answers(h: &NodeHarness, answers: &[(&str, IPReleaseStatus)]) {
    h.store
        .modify(NODE, |node| {
            let release_ips = &mut node.ipam_status_mut().release_ips;
            for (ip, answer) in answers {
                release_ips.insert(ip.to_string(), *answer);
            }
        })
        .unwrap();
}

async fn wait_out_release_delay() {
    tokio::time::advance(Duration::from_secs(181)).await;
}

/// Attach, observe the excess and let it age past the release delay
async fn mark_excess(h: &NodeHarness) {
    h.attach(excess_resource()).await;
    h.node.maintain_ip_pool().await.unwrap();
    wait_out_release_delay().await;
    h.node.maintain_ip_pool().await.unwrap();
}

fn released_only(h: &NodeHarness) -> BTreeMap<String, IPReleaseStatus> {
    h.node
        .release_handshake()
        .into_iter()
        .filter(|(_, status)| *status == IPReleaseStatus::Released)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_excess_is_marked_only_after_delay() {
    let h = excess_harness();
    h.attach(excess_resource()).await;
    assert_eq!(h.node.stats().ipv4.excess_ips, 2);

    h.node.maintain_ip_pool().await.unwrap();
    assert!(h.node.release_handshake().is_empty());

    wait_out_release_delay().await;
    h.node.maintain_ip_pool().await.unwrap();

    let handshake = h.node.release_handshake();
    assert_eq!(handshake.len(), 2);
    assert_eq!(handshake[IP9], IPReleaseStatus::MarkedForRelease);
    assert_eq!(handshake[IP10], IPReleaseStatus::MarkedForRelease);
    assert_eq!(h.ops.call_count("release_ips"), 0);

    h.node.sync_to_api_server().await.unwrap();
    let stored = h.store.stored(NODE).unwrap();
    assert_eq!(stored.release_status(IP9), Some(IPReleaseStatus::MarkedForRelease));

    // Published handshake keeps maintenance armed
    h.refresh().await;
    assert!(h.node.release_needed());
}

#[tokio::test(start_paused = true)]
async fn test_ready_for_release_is_released_and_acknowledged() {
    let h = excess_harness();
    mark_excess(&h).await;
    h.node.sync_to_api_server().await.unwrap();

    agent_answers(&h, &[(IP9, IPReleaseStatus::ReadyForRelease), (IP10, IPReleaseStatus::ReadyForRelease)]);
    h.refresh().await;
    h.node.maintain_ip_pool().await.unwrap();

    assert_eq!(h.ops.state().released, vec![IP10.to_string(), IP9.to_string()]);
    assert_eq!(released_only(&h).len(), 2);
    assert_eq!(h.metrics.released.load(Ordering::SeqCst), 2);
    assert_eq!(h.metrics.release_attempts.lock().unwrap()[0].status, metrics::SUCCESS);
    assert_eq!(h.triggers.instance_sync.count(), 1);
    assert_eq!(h.node.stats().ipv4.excess_ips, 0);

    h.node.sync_to_api_server().await.unwrap();
    let stored = h.store.stored(NODE).unwrap();
    assert_eq!(stored.release_status(IP9), Some(IPReleaseStatus::Released));
    assert!(!stored.spec.ipam.pool.contains_key(IP9));

    // The agent drops acknowledged entries, local bookkeeping follows
    h.store
        .modify(NODE, |node| node.ipam_status_mut().release_ips.clear())
        .unwrap();
    h.refresh().await;
    h.node.sync_to_api_server().await.unwrap();
    assert!(h.node.release_handshake().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ip_no_longer_excess_before_delay_is_unmarked() {
    let h = excess_harness();
    h.attach(excess_resource()).await;
    h.node.maintain_ip_pool().await.unwrap();

    // Usage grows, nothing is excess any more
    used(&h, &["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);
    h.refresh().await;
    wait_out_release_delay().await;
    h.node.maintain_ip_pool().await.unwrap();
    assert!(h.node.release_handshake().is_empty());

    // Excess again: the delay starts over
    used(&h, &["10.0.0.1", "10.0.0.2"]);
    h.refresh().await;
    h.node.maintain_ip_pool().await.unwrap();
    assert!(h.node.release_handshake().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_do_not_release_is_purged_and_never_released() {
    let h = excess_harness();
    mark_excess(&h).await;
    h.node.sync_to_api_server().await.unwrap();

    agent_answers(&h, &[(IP9, IPReleaseStatus::DoNotRelease), (IP10, IPReleaseStatus::ReadyForRelease)]);
    h.refresh().await;
    h.node.maintain_ip_pool().await.unwrap();

    assert_eq!(h.ops.state().released, vec![IP10.to_string()]);
    let handshake = h.node.release_handshake();
    assert!(!handshake.contains_key(IP9));
    assert_eq!(handshake[IP10], IPReleaseStatus::Released);

    h.node.sync_to_api_server().await.unwrap();
    let stored = h.store.stored(NODE).unwrap();
    assert_eq!(stored.release_status(IP9), None);
    assert_eq!(stored.release_status(IP10), Some(IPReleaseStatus::Released));
}

#[tokio::test(start_paused = true)]
async fn test_released_ip_back_in_pool_is_forgotten() {
    let h = excess_harness();
    mark_excess(&h).await;
    h.node.sync_to_api_server().await.unwrap();
    agent_answers(&h, &[(IP9, IPReleaseStatus::ReadyForRelease), (IP10, IPReleaseStatus::ReadyForRelease)]);
    h.refresh().await;
    h.node.maintain_ip_pool().await.unwrap();
    h.node.sync_to_api_server().await.unwrap();

    // The address was handed out again before the agent acknowledged
    h.store
        .modify(NODE, |node| {
            node.spec.ipam.pool.insert(IP10.to_string(), AllocationIP::default());
        })
        .unwrap();
    h.refresh().await;
    h.node.maintain_ip_pool().await.unwrap();

    let handshake = h.node.release_handshake();
    assert!(!handshake.contains_key(IP10));
    assert_eq!(handshake[IP9], IPReleaseStatus::Released);
}

#[tokio::test(start_paused = true)]
async fn test_agent_answer_wins_over_local_mark() {
    let h = excess_harness();
    mark_excess(&h).await;
    h.node.sync_to_api_server().await.unwrap();
    agent_answers(&h, &[(IP9, IPReleaseStatus::ReadyForRelease)]);

    let mut node = h.store.stored(NODE).unwrap();
    h.node.populate_ip_release_status(&mut node);

    assert_eq!(node.release_status(IP9), Some(IPReleaseStatus::ReadyForRelease));
    assert_eq!(node.release_status(IP10), Some(IPReleaseStatus::MarkedForRelease));
}

#[tokio::test(start_paused = true)]
async fn test_release_failure_keeps_mark() {
    let h = excess_harness();
    mark_excess(&h).await;
    h.node.sync_to_api_server().await.unwrap();
    agent_answers(&h, &[(IP9, IPReleaseStatus::ReadyForRelease)]);
    h.ops.state().release_error = Some(ProviderError::call("release-failed", "interface busy"));
    h.refresh().await;

    let err = h.node.maintain_ip_pool().await.unwrap_err();

    assert!(matches!(err, IpamError::Provider(_)));
    assert!(h.ops.state().released.is_empty());
    assert_eq!(h.node.release_handshake()[IP9], IPReleaseStatus::MarkedForRelease);
    assert_eq!(h.metrics.release_attempts.lock().unwrap()[0].status, metrics::FAILED);
    assert_eq!(h.triggers.instance_sync.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_prefixes_are_released_before_ips() {
    let h = excess_harness();
    h.ops.state().release_prefixes = vec!["10.0.1.0/28".to_string()];
    mark_excess(&h).await;
    h.node.sync_to_api_server().await.unwrap();
    agent_answers(&h, &[(IP9, IPReleaseStatus::ReadyForRelease)]);
    h.refresh().await;

    h.node.maintain_ip_pool().await.unwrap();

    let calls = h.ops.calls();
    let prefixes = calls.iter().position(|c| c == "release_ip_prefixes").unwrap();
    let ips = calls.iter().position(|c| c == "release_ips").unwrap();
    assert!(prefixes < ips);
}
