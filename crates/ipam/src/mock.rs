//! Mock collaborators for unit testing
//!
//! In-memory implementations of the provider, store, pending-pod and
//! metrics capabilities, plus recording triggers. Every mock is cheaply
//! clonable and clones share state, so a test can keep a handle while the
//! node owns another.

use crate::action::{AllocationAction, ReleaseAction};
use crate::config::IpamConfig;
use crate::error::{PendingPodsError, ProviderError, StoreError};
use crate::metrics::MetricsApi;
use crate::node::{Node, NodeContext, NodeTriggers};
use crate::ops::{InterfaceStats, IpamProvider, NodeOperations, PendingPodCounter};
use crate::stats::Statistics;
use crate::store::NodeStore;
use crate::trigger::JobTrigger;
use crds::{AllocationIP, AllocationMap, IPAMNode, IPAMNodeSpec, IPAMSpec, InterfaceStatus, Tags};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Builds an `IPAMNode` with a pre-allocation of 4 and no status
pub fn ipam_node(name: &str) -> IPAMNode {
    IPAMNode {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: IPAMNodeSpec {
            instance_id: Some(format!("i-{name}")),
            ipam: IPAMSpec {
                pre_allocate: 4,
                ..Default::default()
            },
        },
        status: None,
    }
}

/// Marks `ips` as used in the status of `node`
pub fn set_used(node: &mut IPAMNode, ips: &[&str]) {
    node.ipam_status_mut().used = ips
        .iter()
        .map(|ip| (ip.to_string(), AllocationIP::default()))
        .collect();
}

/// Configurable state behind [`MockNodeOperations`]
#[derive(Debug, Default)]
pub struct MockOpsState {
    /// Addresses returned by resync; allocations add to it, releases remove from it
    pub available: AllocationMap,
    /// Capacity returned by resync
    pub interface_stats: InterfaceStats,
    /// Error returned by resync
    pub resync_error: Option<ProviderError>,

    /// Action returned by `prepare_ip_allocation`
    pub allocation: AllocationAction,
    /// Error returned by `prepare_ip_allocation`
    pub prepare_allocation_error: Option<ProviderError>,
    /// Error returned by `allocate_ips`
    pub allocate_error: Option<ProviderError>,
    /// `allocate_ips` never completes
    pub block_allocations: bool,
    /// Error returned by `create_interface`
    pub create_interface_error: Option<ProviderError>,

    /// Addresses offered by `prepare_ip_release`, truncated to the excess
    pub release_candidates: Vec<String>,
    /// Prefixes offered by `prepare_ip_release`
    pub release_prefixes: Vec<String>,
    /// Error returned by `release_ips`
    pub release_error: Option<ProviderError>,

    /// Address returned by `allocate_static_ip`
    pub static_ip: Option<String>,

    /// Returned by `get_maximum_allocatable_ipv4` (0 = unlimited)
    pub max_allocatable: usize,
    /// Returned by `get_minimum_allocatable_ipv4`
    pub min_allocatable: usize,

    /// Names of the operations called, in order
    pub calls: Vec<String>,
    /// Last action passed to `allocate_ips` or `create_interface`
    pub last_allocation: Option<AllocationAction>,
    /// Addresses released so far
    pub released: Vec<String>,

    next_ip: u32,
}

impl MockOpsState {
    fn allocate(&mut self, count: usize, interface: &str) {
        for _ in 0..count {
            self.next_ip += 1;
            let ip = format!("10.0.{}.{}", self.next_ip / 256, self.next_ip % 256);
            self.available.insert(
                ip,
                AllocationIP {
                    owner: None,
                    resource: Some(interface.to_string()),
                },
            );
        }
    }

    fn record(&mut self, call: &str) {
        self.calls.push(call.to_string());
    }
}

/// Mock per-node provider operations
#[derive(Debug, Clone, Default)]
pub struct MockNodeOperations {
    state: Arc<Mutex<MockOpsState>>,
}

impl MockNodeOperations {
    /// Create a mock with an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock holding `count` generated addresses on `eth0`
    pub fn with_available(count: usize) -> Self {
        let ops = Self::new();
        ops.state().allocate(count, "eth0");
        ops
    }

    /// Lock the mock state for inspection or setup
    pub fn state(&self) -> MutexGuard<'_, MockOpsState> {
        self.state.lock().unwrap()
    }

    /// Addresses currently held by the mock
    pub fn available_ips(&self) -> Vec<String> {
        self.state().available.keys().cloned().collect()
    }

    /// Names of the operations called, in order
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Number of times `call` was made
    pub fn call_count(&self, call: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == call).count()
    }
}

#[async_trait::async_trait]
impl NodeOperations for MockNodeOperations {
    fn updated_node(&self, _resource: &IPAMNode) {
        self.state().record("updated_node");
    }

    fn populate_status_fields(&self, resource: &mut IPAMNode) {
        let interfaces = {
            let mut state = self.state();
            state.record("populate_status_fields");
            let mut interfaces: BTreeMap<String, InterfaceStatus> = BTreeMap::new();
            for (ip, alloc) in &state.available {
                let id = alloc.resource.clone().unwrap_or_default();
                interfaces.entry(id).or_default().addresses.push(ip.clone());
            }
            interfaces
        };
        resource.ipam_status_mut().interfaces = interfaces;
    }

    async fn resync_interfaces_and_ips(&self) -> Result<(AllocationMap, InterfaceStats), ProviderError> {
        let mut state = self.state();
        state.record("resync_interfaces_and_ips");
        if let Some(err) = state.resync_error.clone() {
            return Err(err);
        }
        Ok((state.available.clone(), state.interface_stats.clone()))
    }

    async fn prepare_ip_allocation(&self) -> Result<AllocationAction, ProviderError> {
        let mut state = self.state();
        state.record("prepare_ip_allocation");
        if let Some(err) = state.prepare_allocation_error.clone() {
            return Err(err);
        }
        Ok(state.allocation.clone())
    }

    async fn allocate_ips(&self, action: &AllocationAction) -> Result<(), ProviderError> {
        let block = {
            let mut state = self.state();
            state.record("allocate_ips");
            state.last_allocation = Some(action.clone());
            if let Some(err) = state.allocate_error.clone() {
                return Err(err);
            }
            if !state.block_allocations {
                state.allocate(action.ipv4.available_for_allocation, &action.interface_id);
            }
            state.block_allocations
        };
        if block {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn create_interface(&self, action: &AllocationAction) -> Result<usize, ProviderError> {
        let mut state = self.state();
        state.record("create_interface");
        state.last_allocation = Some(action.clone());
        if let Some(err) = state.create_interface_error.clone() {
            return Err(err);
        }
        let count = action.ipv4.max_ips_to_allocate;
        state.allocate(count, "eth-new");
        Ok(count)
    }

    fn prepare_ip_release(&self, excess: usize) -> ReleaseAction {
        let mut state = self.state();
        state.record("prepare_ip_release");
        ReleaseAction {
            interface_id: "eth0".to_string(),
            pool_id: "mock-pool".to_string(),
            ips_to_release: state.release_candidates.iter().take(excess).cloned().collect(),
            ip_prefixes_to_release: state.release_prefixes.clone(),
        }
    }

    async fn release_ips(&self, action: &ReleaseAction) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.record("release_ips");
        if let Some(err) = state.release_error.clone() {
            return Err(err);
        }
        for ip in &action.ips_to_release {
            state.available.remove(ip);
            state.released.push(ip.clone());
        }
        Ok(())
    }

    async fn release_ip_prefixes(&self, _action: &ReleaseAction) -> Result<(), ProviderError> {
        self.state().record("release_ip_prefixes");
        Ok(())
    }

    async fn allocate_static_ip(&self, _tags: &Tags) -> Result<String, ProviderError> {
        let mut state = self.state();
        state.record("allocate_static_ip");
        state
            .static_ip
            .clone()
            .ok_or_else(|| ProviderError::Unsupported("static IP".to_string()))
    }

    fn get_maximum_allocatable_ipv4(&self) -> usize {
        self.state().max_allocatable
    }

    fn get_minimum_allocatable_ipv4(&self) -> usize {
        self.state().min_allocatable
    }
}

/// Kind of write recorded by [`MockNodeStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    /// Status subresource write
    Status,
    /// Spec write
    Spec,
}

/// A write accepted by [`MockNodeStore`]
#[derive(Debug, Clone)]
pub struct StoreWrite {
    /// What was written
    pub kind: WriteKind,
    /// Resource version after the write
    pub resource_version: u64,
    /// Stored object after the write
    pub node: IPAMNode,
}

/// In-memory resource store with optimistic concurrency
#[derive(Debug, Clone, Default)]
pub struct MockNodeStore {
    nodes: Arc<Mutex<HashMap<String, IPAMNode>>>,
    writes: Arc<Mutex<Vec<StoreWrite>>>,
    conflicts: Arc<Mutex<HashMap<WriteKind, usize>>>,
}

fn resource_version(node: &IPAMNode) -> u64 {
    node.metadata
        .resource_version
        .as_deref()
        .and_then(|rv| rv.parse().ok())
        .unwrap_or(0)
}

impl MockNodeStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `node` at resource version 1 and return the stored copy
    pub fn insert(&self, node: IPAMNode) -> IPAMNode {
        let mut node = node;
        node.metadata.resource_version = Some("1".to_string());
        self.nodes.lock().unwrap().insert(node.name_any(), node.clone());
        node
    }

    /// Simulate a write by another client (e.g. the agent), bumping the version
    pub fn modify(&self, name: &str, f: impl FnOnce(&mut IPAMNode)) -> Option<IPAMNode> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(name)?;
        f(node);
        node.metadata.resource_version = Some((resource_version(node) + 1).to_string());
        Some(node.clone())
    }

    /// Latest stored version of `name`
    pub fn stored(&self, name: &str) -> Option<IPAMNode> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    /// Accepted writes, in order
    pub fn writes(&self) -> Vec<StoreWrite> {
        self.writes.lock().unwrap().clone()
    }

    /// Fail the next `count` writes of `kind` with a conflict
    pub fn inject_conflicts(&self, kind: WriteKind, count: usize) {
        self.conflicts.lock().unwrap().insert(kind, count);
    }

    fn write(&self, kind: WriteKind, node: &IPAMNode, apply: impl FnOnce(&mut IPAMNode)) -> Result<Option<IPAMNode>, StoreError> {
        let name = node.name_any();
        {
            let mut conflicts = self.conflicts.lock().unwrap();
            if let Some(remaining) = conflicts.get_mut(&kind) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Conflict(name));
                }
            }
        }

        let mut nodes = self.nodes.lock().unwrap();
        let current = nodes.get_mut(&name).ok_or_else(|| StoreError::NotFound(name.clone()))?;
        if current.metadata.resource_version != node.metadata.resource_version {
            return Err(StoreError::Conflict(name));
        }
        apply(current);
        let version = resource_version(current) + 1;
        current.metadata.resource_version = Some(version.to_string());
        self.writes.lock().unwrap().push(StoreWrite {
            kind,
            resource_version: version,
            node: current.clone(),
        });
        Ok(Some(current.clone()))
    }
}

#[async_trait::async_trait]
impl NodeStore for MockNodeStore {
    async fn get(&self, name: &str) -> Result<IPAMNode, StoreError> {
        self.stored(name).ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn update(&self, orig: &IPAMNode, node: &IPAMNode) -> Result<Option<IPAMNode>, StoreError> {
        if orig.spec == node.spec {
            return Ok(None);
        }
        self.write(WriteKind::Spec, node, |current| current.spec = node.spec.clone())
    }

    async fn update_status(&self, orig: &IPAMNode, node: &IPAMNode) -> Result<Option<IPAMNode>, StoreError> {
        if orig.status == node.status {
            return Ok(None);
        }
        self.write(WriteKind::Status, node, |current| current.status = node.status.clone())
    }
}

/// Pending pod counter returning a configured answer
#[derive(Debug, Clone)]
pub struct MockPendingPods {
    answer: Arc<Mutex<Result<usize, String>>>,
}

impl Default for MockPendingPods {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MockPendingPods {
    /// Report `count` pending pods
    pub fn new(count: usize) -> Self {
        Self {
            answer: Arc::new(Mutex::new(Ok(count))),
        }
    }

    /// Change the reported count
    pub fn set_count(&self, count: usize) {
        *self.answer.lock().unwrap() = Ok(count);
    }

    /// Fail every lookup with the API message `error`
    pub fn set_error(&self, error: impl Into<String>) {
        *self.answer.lock().unwrap() = Err(error.into());
    }
}

#[async_trait::async_trait]
impl PendingPodCounter for MockPendingPods {
    async fn pending_pods(&self, node_name: &str) -> Result<usize, PendingPodsError> {
        self.answer
            .lock()
            .unwrap()
            .clone()
            .map_err(|message| PendingPodsError::List {
                node: node_name.to_string(),
                message,
            })
    }
}

/// An allocation or release attempt recorded by [`RecordingMetrics`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// Operation type label
    pub typ: String,
    /// Status label
    pub status: String,
    /// Pool label
    pub pool: String,
}

/// Metrics sink that records everything
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    /// Allocation attempts, in order
    pub allocation_attempts: Mutex<Vec<Attempt>>,
    /// Release attempts, in order
    pub release_attempts: Mutex<Vec<Attempt>>,
    /// Total addresses allocated
    pub allocated: AtomicUsize,
    /// Total addresses released
    pub released: AtomicUsize,
    /// Interfaces created
    pub interfaces: AtomicUsize,
    /// Latest statistics per node
    pub node_stats: Mutex<HashMap<String, Statistics>>,
}

fn attempt(typ: &str, status: &str, pool: &str) -> Attempt {
    Attempt {
        typ: typ.to_string(),
        status: status.to_string(),
        pool: pool.to_string(),
    }
}

impl MetricsApi for RecordingMetrics {
    fn allocation_attempt(&self, typ: &str, status: &str, pool: &str, _duration: Duration) {
        self.allocation_attempts.lock().unwrap().push(attempt(typ, status, pool));
    }

    fn release_attempt(&self, typ: &str, status: &str, pool: &str, _duration: Duration) {
        self.release_attempts.lock().unwrap().push(attempt(typ, status, pool));
    }

    fn add_ip_allocation(&self, _pool: &str, count: usize) {
        self.allocated.fetch_add(count, Ordering::SeqCst);
    }

    fn add_ip_release(&self, _pool: &str, count: usize) {
        self.released.fetch_add(count, Ordering::SeqCst);
    }

    fn inc_interface_allocation(&self, _pool: &str) {
        self.interfaces.fetch_add(1, Ordering::SeqCst);
    }

    fn update_node_stats(&self, node: &str, stats: &Statistics) {
        self.node_stats.lock().unwrap().insert(node.to_string(), stats.clone());
    }

    fn remove_node(&self, node: &str) {
        self.node_stats.lock().unwrap().remove(node);
    }
}

/// Trigger that only counts signals
#[derive(Debug, Default)]
pub struct RecordingTrigger {
    count: AtomicUsize,
    shut: AtomicBool,
}

impl RecordingTrigger {
    /// Number of signals received before shutdown
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// True once `shutdown()` was called
    pub fn is_shutdown(&self) -> bool {
        self.shut.load(Ordering::SeqCst)
    }
}

impl JobTrigger for RecordingTrigger {
    fn trigger(&self) {
        if !self.is_shutdown() {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn shutdown(&self) {
        self.shut.store(true, Ordering::SeqCst);
    }
}

/// Recording triggers for a node under test
#[derive(Debug, Clone, Default)]
pub struct TestTriggers {
    /// Pool maintainer
    pub pool_maintainer: Arc<RecordingTrigger>,
    /// Store sync
    pub k8s_sync: Arc<RecordingTrigger>,
    /// Instance sync
    pub instance_sync: Arc<RecordingTrigger>,
    /// Retry while the provider API is unstable
    pub retry: Arc<RecordingTrigger>,
}

impl TestTriggers {
    /// Triggers to hand to [`Node::new`]
    pub fn node_triggers(&self) -> NodeTriggers {
        NodeTriggers {
            pool_maintainer: self.pool_maintainer.clone(),
            k8s_sync: self.k8s_sync.clone(),
            instance_sync: self.instance_sync.clone(),
            retry: Some(self.retry.clone()),
        }
    }
}

/// A node wired to mocks, with handles on every collaborator
pub struct NodeHarness {
    /// Node under test
    pub node: Arc<Node>,
    /// Provider operations of the node
    pub ops: MockNodeOperations,
    /// Resource store
    pub store: MockNodeStore,
    /// Pending pod counter
    pub pods: MockPendingPods,
    /// Metrics sink
    pub metrics: Arc<RecordingMetrics>,
    /// Node triggers
    pub triggers: TestTriggers,
    /// Shared context, the provider API starts out ready
    pub ctx: Arc<NodeContext>,
    /// Parent cancellation token of the node
    pub cancel: CancellationToken,
}

impl NodeHarness {
    /// Node named `name` using `ops`, with a ready provider API
    pub fn new(config: IpamConfig, name: &str, ops: MockNodeOperations) -> Self {
        let store = MockNodeStore::new();
        let pods = MockPendingPods::default();
        let metrics = Arc::new(RecordingMetrics::default());
        let ctx = Arc::new(NodeContext::new(
            config,
            Arc::new(store.clone()),
            metrics.clone(),
            Arc::new(pods.clone()),
        ));
        ctx.set_instances_api_ready(true);
        let triggers = TestTriggers::default();
        let cancel = CancellationToken::new();
        let node_triggers = triggers.node_triggers();
        let node = Node::new(name, Arc::new(ops.clone()), ctx.clone(), &cancel, |_, _| node_triggers);
        Self {
            node,
            ops,
            store,
            pods,
            metrics,
            triggers,
            ctx,
            cancel,
        }
    }

    /// Store `resource` and feed the stored copy to the node
    pub async fn attach(&self, resource: IPAMNode) -> bool {
        let stored = self.store.insert(resource);
        self.node.updated_resource(&stored).await
    }

    /// Feed the latest stored copy of the node resource to the node
    pub async fn refresh(&self) -> bool {
        match self.store.stored(self.node.name()) {
            Some(stored) => self.node.updated_resource(&stored).await,
            None => false,
        }
    }
}

/// Provider handing out [`MockNodeOperations`] per node
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    nodes: Arc<Mutex<HashMap<String, MockNodeOperations>>>,
    unstable: Arc<AtomicBool>,
    instance_syncs: Arc<AtomicUsize>,
    deleted: Arc<Mutex<Vec<String>>>,
}

impl MockProvider {
    /// Create a provider whose API is stable
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations for `name`, shared with the node created for it
    pub fn ops(&self, name: &str) -> MockNodeOperations {
        self.nodes.lock().unwrap().entry(name.to_string()).or_default().clone()
    }

    /// Make `resync` and `instance_sync` fail
    pub fn set_unstable(&self, unstable: bool) {
        self.unstable.store(unstable, Ordering::SeqCst);
    }

    /// Number of `instance_sync` calls
    pub fn instance_syncs(&self) -> usize {
        self.instance_syncs.load(Ordering::SeqCst)
    }

    /// Nodes passed to `delete_node`, in order
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    fn sync_time(&self) -> Option<Instant> {
        (!self.unstable.load(Ordering::SeqCst)).then(Instant::now)
    }
}

#[async_trait::async_trait]
impl IpamProvider for MockProvider {
    fn create_node(&self, resource: &IPAMNode) -> Arc<dyn NodeOperations> {
        Arc::new(self.ops(&resource.name_any()))
    }

    async fn resync(&self) -> Option<Instant> {
        self.sync_time()
    }

    async fn instance_sync(&self, _instance_id: &str) -> Option<Instant> {
        self.instance_syncs.fetch_add(1, Ordering::SeqCst);
        self.sync_time()
    }

    fn delete_node(&self, name: &str) {
        self.deleted.lock().unwrap().push(name.to_string());
    }
}
