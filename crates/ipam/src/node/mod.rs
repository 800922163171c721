//! Per-node IPAM state machine.
//!
//! A `Node` owns the allocation pool of one cluster node, its release
//! handshake bookkeeping and its liveness state. All mutable state lives in
//! a single `NodeState` behind one lock; the lock is never held across an
//! await point. Provider and store calls race the node's cancellation token
//! and never mutate local bookkeeping unless they completed.
//!
//! Entry points:
//! - [`Node::updated_resource`]: a new version of the `IPAMNode` resource was observed
//! - [`Node::maintain_ip_pool`]: run by the pool-maintenance trigger
//! - [`Node::sync_to_api_server`]: run by the store-sync trigger

mod release;
mod sync;

#[cfg(test)]
mod release_test;
#[cfg(test)]
mod sync_test;

use crate::action::{AllocationAction, MaintenanceAction};
use crate::config::IpamConfig;
use crate::error::{IpamError, ProviderError};
use crate::metrics::{self, MetricsApi};
use crate::ops::{NodeOperations, PendingPodCounter};
use crate::stats::{Statistics, calculate_excess_ips, calculate_needed_ips};
use crate::store::NodeStore;
use crate::trigger::JobTrigger;
use arc_swap::ArcSwap;
use crds::{AllocationMap, IPAMNode, IPReleaseStatus, Tags};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, info_span, warn};

/// Collaborators shared by all nodes of a manager
pub struct NodeContext {
    /// Cluster-wide IPAM policy
    pub config: IpamConfig,
    /// Declarative resource store
    pub store: Arc<dyn NodeStore>,
    /// Metrics sink
    pub metrics: Arc<dyn MetricsApi>,
    /// Pending pod lookup used for surge allocation
    pub pods: Arc<dyn PendingPodCounter>,
    instances_api_ready: AtomicBool,
}

impl NodeContext {
    /// Creates the shared context. The provider API starts out as not ready.
    pub fn new(
        config: IpamConfig,
        store: Arc<dyn NodeStore>,
        metrics: Arc<dyn MetricsApi>,
        pods: Arc<dyn PendingPodCounter>,
    ) -> Self {
        Self {
            config,
            store,
            metrics,
            pods,
            instances_api_ready: AtomicBool::new(false),
        }
    }

    /// True when the provider API is considered stable
    pub fn instances_api_is_ready(&self) -> bool {
        self.instances_api_ready.load(Ordering::SeqCst)
    }

    /// Marks the provider API as stable or unstable, returning the previous value
    pub fn set_instances_api_ready(&self, ready: bool) -> bool {
        self.instances_api_ready.swap(ready, Ordering::SeqCst)
    }
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("config", &self.config)
            .field("instances_api_ready", &self.instances_api_is_ready())
            .finish_non_exhaustive()
    }
}

/// Background jobs of a node
#[derive(Debug, Clone)]
pub struct NodeTriggers {
    /// Assigns/unassigns addresses; batches requests while maintenance is ongoing
    pub pool_maintainer: Arc<dyn JobTrigger>,
    /// Pushes the node resource to the store
    pub k8s_sync: Arc<dyn JobTrigger>,
    /// Refreshes provider information for the instance
    pub instance_sync: Arc<dyn JobTrigger>,
    /// Re-arms pool maintenance while the provider API is unstable
    pub retry: Option<Arc<dyn JobTrigger>>,
}

impl NodeTriggers {
    fn shutdown(&self) {
        self.pool_maintainer.shutdown();
        self.k8s_sync.shutdown();
        self.instance_sync.shutdown();
        if let Some(retry) = &self.retry {
            retry.shutdown();
        }
    }
}

/// IPv4 allocation attributes
#[derive(Debug, Default)]
struct IpAllocAttrs {
    /// An allocation or release must complete before another can be attempted
    waiting_for_pool_maintenance: bool,

    /// Addresses allocated to this node
    available: AllocationMap,

    /// Excess addresses and the time they were first seen excess
    ips_marked_for_release: HashMap<String, Instant>,

    /// Release handshake state per address
    ip_release_status: HashMap<String, IPReleaseStatus>,
}

#[derive(Debug, Default)]
struct NodeState {
    resource: Option<IPAMNode>,
    stats: Statistics,

    /// Last "out of interfaces" warning
    last_max_adapter_warning: Option<Instant>,

    instance_running: bool,
    instance_stopped_running: Option<Instant>,

    ipv4_alloc: IpAllocAttrs,

    /// Set when a resync with the provider is required. Only cleared by a
    /// resync that started after this instant, since resyncs and
    /// allocations run in parallel.
    resync_needed: Option<Instant>,
}

impl NodeState {
    fn pre_allocate(&self, default: usize) -> usize {
        match self.resource.as_ref().map(|r| r.spec.ipam.pre_allocate) {
            Some(pre) if pre != 0 => pre,
            _ => default,
        }
    }

    fn min_allocate(&self) -> usize {
        self.resource.as_ref().map_or(0, |r| r.spec.ipam.min_allocate)
    }

    fn max_above_watermark(&self) -> usize {
        self.resource.as_ref().map_or(0, |r| r.spec.ipam.max_above_watermark)
    }

    fn static_ip_tags(&self) -> Tags {
        self.resource
            .as_ref()
            .and_then(|r| r.spec.ipam.static_ip_tags.clone())
            .unwrap_or_default()
    }
}

/// Rate limiter for warnings that may repeat every cycle
#[derive(Debug)]
struct LogLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    fn allow(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if last.is_none_or(|t| now.duration_since(t) >= self.interval) {
            *last = Some(now);
            return true;
        }
        false
    }
}

/// A cluster node with an associated `IPAMNode` resource
pub struct Node {
    name: String,
    logger: ArcSwap<Span>,
    state: RwLock<NodeState>,
    ops: Arc<dyn NodeOperations>,
    ctx: Arc<NodeContext>,
    triggers: NodeTriggers,
    cancel: CancellationToken,
    log_limiter: LogLimiter,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Creates a node.
    ///
    /// `build_triggers` receives a weak reference to the node under
    /// construction and the node's cancellation token (a child of `parent`),
    /// so trigger jobs can call back into the node without keeping it alive.
    pub fn new<F>(
        name: impl Into<String>,
        ops: Arc<dyn NodeOperations>,
        ctx: Arc<NodeContext>,
        parent: &CancellationToken,
        build_triggers: F,
    ) -> Arc<Self>
    where
        F: FnOnce(&Weak<Node>, &CancellationToken) -> NodeTriggers,
    {
        let name = name.into();
        let cancel = parent.child_token();
        let log_limiter = LogLimiter::new(ctx.config.log_limit_interval);
        Arc::new_cyclic(|weak| Self {
            logger: ArcSwap::from_pointee(info_span!("ipam_node", node = %name)),
            name,
            state: RwLock::new(NodeState::default()),
            ops,
            ctx,
            triggers: build_triggers(weak, &cancel),
            cancel,
            log_limiter,
        })
    }

    /// Name of the node
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provider operations of the node
    pub fn ops(&self) -> &Arc<dyn NodeOperations> {
        &self.ops
    }

    pub(crate) fn triggers(&self) -> &NodeTriggers {
        &self.triggers
    }

    /// Stops all background jobs and cancels in-flight provider/store calls
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.triggers.shutdown();
    }

    fn read(&self) -> RwLockReadGuard<'_, NodeState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, NodeState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn logger(&self) -> Arc<Span> {
        self.logger.load_full()
    }

    fn update_logger(&self) {
        let instance_id = self.instance_id();
        if let Some(instance_id) = instance_id {
            self.logger.store(Arc::new(info_span!(
                "ipam_node",
                node = %self.name,
                instance_id = %instance_id,
            )));
        }
    }

    /// Awaits `fut` unless the node is cancelled first
    async fn guarded<T, E, Fut>(&self, fut: Fut) -> Result<T, IpamError>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Into<IpamError>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(IpamError::Cancelled),
            result = fut => result.map_err(Into::into),
        }
    }

    /// True if the instance backing the node is considered running
    pub fn is_running(&self) -> bool {
        self.read().instance_running
    }

    /// Records whether the instance is running
    pub fn set_running(&self, running: bool) {
        let mut state = self.write();
        info!(parent: &*self.logger(), "Set running {}", running);
        state.instance_running = running;
        if !running {
            state.instance_stopped_running = Some(Instant::now());
        }
    }

    /// Snapshot of the node statistics
    pub fn stats(&self) -> Statistics {
        self.read().stats.clone()
    }

    /// Copy of the allocation pool of the node
    pub fn pool(&self) -> AllocationMap {
        self.read().ipv4_alloc.available.clone()
    }

    /// Copy of the `IPAMNode` resource last seen
    pub fn resource_copy(&self) -> Option<IPAMNode> {
        self.read().resource.clone()
    }

    /// Instance ID of the node, once the resource is attached
    pub fn instance_id(&self) -> Option<String> {
        self.read().resource.as_ref().map(IPAMNode::instance_id)
    }

    fn resource_attached(&self) -> bool {
        self.read().resource.is_some()
    }

    /// Number of addresses to allocate (positive) or release (negative)
    pub fn get_needed_addresses(&self) -> i64 {
        let stats = self.stats();
        if stats.ipv4.needed_ips > 0 {
            return stats.ipv4.needed_ips as i64;
        }
        if self.ctx.config.release_excess_ips && stats.ipv4.excess_ips > 0 {
            // Deficits sort ahead of excess
            return -(stats.ipv4.excess_ips as i64);
        }
        0
    }

    /// max-allocate of the resource if set, otherwise the instance limit.
    ///
    /// The state lock must be held by the caller.
    fn max_allocate(&self, state: &NodeState) -> usize {
        let instance_max = self.ops.get_maximum_allocatable_ipv4();
        let max_allocate = state.resource.as_ref().map_or(0, |r| r.spec.ipam.max_allocate);
        if max_allocate > 0 {
            if max_allocate > instance_max {
                warn!(
                    parent: &*self.logger(),
                    "max-allocate ({}) is higher than the instance type limits ({})",
                    max_allocate,
                    instance_max
                );
            }
            return max_allocate;
        }
        instance_max
    }

    /// Called with every new version of the `IPAMNode` resource.
    ///
    /// Recalculates the statistics and arms the pool maintainer when a
    /// deficit exists. Returns true if allocation is needed.
    pub async fn updated_resource(&self, resource: &IPAMNode) -> bool {
        let resource = resource.clone();
        {
            let mut state = self.write();
            // Any modification to the resource is a sign of life
            state.instance_running = true;
            state.resource = Some(resource.clone());
        }
        self.update_logger();

        self.ops.updated_node(&resource);

        self.recalculate().await;
        let allocation_needed = self.allocation_needed();
        if allocation_needed {
            self.require_pool_maintenance();
            self.triggers.pool_maintainer.trigger();
        }
        allocation_needed
    }

    /// Refreshes the provider view and recomputes the statistics
    pub(crate) async fn recalculate(&self) {
        if !self.resource_attached() {
            return;
        }
        let log = self.logger();

        let result = self.guarded(self.ops.resync_interfaces_and_ips()).await;

        let mut state = self.write();
        let (available, interface_stats) = match result {
            Ok(resynced) => resynced,
            Err(IpamError::Cancelled) => {
                debug!(parent: &*log, "Recalculation cancelled");
                return;
            }
            Err(err) => {
                if matches!(err, IpamError::Provider(ProviderError::LimitsNotFound(_))) {
                    warn!(parent: &*log, error = %err, "Instance limits not found.");
                } else {
                    warn!(
                        parent: &*log,
                        error = %err,
                        "Instance not found! Please delete corresponding IPAMNode if instance has already been deleted."
                    );
                }
                // Avoid any further action
                state.stats.ipv4.needed_ips = 0;
                state.stats.ipv4.excess_ips = 0;
                return;
            }
        };

        let pre_allocate = state.pre_allocate(self.ctx.config.default_pre_allocate);
        let min_allocate = state.min_allocate();
        let max_above_watermark = state.max_above_watermark();
        let max_allocate = self.max_allocate(&state);
        let used_ips = state.resource.as_ref().map_or(0, IPAMNode::used_count);

        let state = &mut *state;
        state.ipv4_alloc.available = available;
        let available_ips = state.ipv4_alloc.available.len();

        let stats = &mut state.stats.ipv4;
        stats.used_ips = used_ips;
        if interface_stats.assigned_static_ip.is_some() {
            stats.assigned_static_ip = interface_stats.assigned_static_ip;
        }
        stats.available_ips = available_ips;
        stats.needed_ips = calculate_needed_ips(available_ips, used_ips, pre_allocate, min_allocate, max_allocate);
        stats.excess_ips = calculate_excess_ips(available_ips, used_ips, pre_allocate, min_allocate, max_above_watermark);
        stats.remaining_interfaces = interface_stats.remaining_available_interface_count;
        stats.capacity = interface_stats.node_capacity;

        debug!(
            parent: &*log,
            available = stats.available_ips,
            capacity = stats.capacity,
            used = stats.used_ips,
            to_allocate = stats.needed_ips,
            to_release = stats.excess_ips,
            waiting_for_pool_maintenance = state.ipv4_alloc.waiting_for_pool_maintenance,
            resync_needed = state.resync_needed.is_some(),
            remaining_interfaces = interface_stats.remaining_available_interface_count,
            "Recalculated needed addresses"
        );
    }

    /// True if this node requires addresses to be allocated
    pub(crate) fn allocation_needed(&self) -> bool {
        let state = self.read();
        !state.ipv4_alloc.waiting_for_pool_maintenance
            && state.resync_needed.is_none()
            && state.stats.ipv4.needed_ips > 0
    }

    /// True if this node requires addresses to be released or a release
    /// handshake is in progress
    pub(crate) fn release_needed(&self) -> bool {
        let state = self.read();
        let needed = self.ctx.config.release_excess_ips
            && !state.ipv4_alloc.waiting_for_pool_maintenance
            && state.resync_needed.is_none()
            && state.stats.ipv4.excess_ips > 0;
        needed || state.resource.as_ref().is_some_and(IPAMNode::release_in_progress)
    }

    pub(crate) fn require_pool_maintenance(&self) {
        self.write().ipv4_alloc.waiting_for_pool_maintenance = true;
    }

    fn pool_maintenance_complete(&self) {
        self.write().ipv4_alloc.waiting_for_pool_maintenance = false;
    }

    fn require_resync(&self) {
        self.write().resync_needed = Some(Instant::now());
    }

    /// Clears the pending resync if `sync_time` is after it was requested
    pub(crate) fn update_last_resync(&self, sync_time: Instant) {
        let mut state = self.write();
        if let Some(needed) = state.resync_needed {
            if sync_time > needed {
                debug!(parent: &*self.logger(), "Resetting resyncNeeded");
                state.resync_needed = None;
            }
        }
    }

    fn stopped_recently(&self) -> bool {
        let state = self.read();
        !state.instance_running
            && state
                .instance_stopped_running
                .is_some_and(|stopped| stopped + self.ctx.config.instance_stopped_grace > Instant::now())
    }

    /// Allocates or releases addresses to close the gap to the watermarks,
    /// creating interfaces when needed.
    pub async fn maintain_ip_pool(&self) -> Result<(), IpamError> {
        // As long as the instances API is unstable, don't perform any
        // operation that can mutate state
        if !self.ctx.instances_api_is_ready() {
            if let Some(retry) = &self.triggers.retry {
                retry.trigger();
            }
            return Err(IpamError::ApiUnstable);
        }

        // Stopped less than a grace period ago: wait for the resource to be
        // updated as a sign of life
        if self.stopped_recently() {
            self.pool_maintenance_complete();
            return Ok(());
        }

        let result = self.maintain_ip_pool_inner().await;
        if result.is_ok() {
            debug!(parent: &*self.logger(), "Setting resync needed");
            self.require_resync();
        }
        self.pool_maintenance_complete();
        self.recalculate().await;

        let instance_mutated = matches!(result, Ok(true));
        if instance_mutated || result.is_err() {
            self.triggers.instance_sync.trigger();
        }
        result.map(|_| ())
    }

    /// Returns whether provider state was mutated
    async fn maintain_ip_pool_inner(&self) -> Result<bool, IpamError> {
        if self.ctx.config.release_excess_ips {
            self.remove_stale_release_ips();
        }

        let (tags, assigned) = {
            let state = self.read();
            (state.static_ip_tags(), state.stats.ipv4.assigned_static_ip.is_some())
        };
        if !tags.is_empty() && !assigned {
            let ip = self.guarded(self.ops.allocate_static_ip(&tags)).await?;
            info!(parent: &*self.logger(), ip = %ip, "Assigned static IP to node");
            self.write().stats.ipv4.assigned_static_ip = Some(ip);
        }

        let mut action = match self.determine_maintenance_action().await {
            Ok(Some(action)) => action,
            Ok(None) => {
                // Maintenance request has already been fulfilled
                self.unmark_no_longer_excess_ips(None);
                return Ok(false);
            }
            Err(err) => {
                self.unmark_no_longer_excess_ips(None);
                return Err(err);
            }
        };

        let released = self.handle_ip_release(&mut action).await?;
        if released {
            return Ok(true);
        }

        self.handle_ip_allocation(&mut action).await
    }

    async fn determine_maintenance_action(&self) -> Result<Option<MaintenanceAction>, IpamError> {
        let log = self.logger();
        let mut action = MaintenanceAction::default();
        let stats = self.stats();

        // The request may have been resolved since the trigger fired
        if self.ctx.config.release_excess_ips && stats.ipv4.excess_ips > 0 {
            let release = self.ops.prepare_ip_release(stats.ipv4.excess_ips);
            if !release.ips_to_release.is_empty() {
                action.release = Some(release);
                return Ok(Some(action));
            }
        }

        if stats.ipv4.needed_ips == 0 {
            return Ok(None);
        }

        let mut allocation = self.guarded(self.ops.prepare_ip_allocation()).await?;

        let pending = self.guarded(self.ctx.pods.pending_pods(&self.name)).await;
        let surge_allocate = match pending {
            Ok(pending_pods) => pending_pods.saturating_sub(stats.ipv4.needed_ips),
            Err(IpamError::Cancelled) => return Err(IpamError::Cancelled),
            Err(err) => {
                if self.log_limiter.allow() {
                    warn!(parent: &*log, error = %err, "Unable to compute pending pods, will not surge-allocate");
                }
                0
            }
        };

        let stats = {
            let mut state = self.write();
            let mut ceiling = stats.ipv4.needed_ips + state.max_above_watermark() + surge_allocate;
            let max_allocate = self.max_allocate(&state);
            if max_allocate > 0 {
                let headroom = max_allocate.saturating_sub(state.stats.ipv4.available_ips);
                ceiling = ceiling.min(headroom.max(stats.ipv4.needed_ips));
            }
            allocation.ipv4.max_ips_to_allocate = ceiling;

            state.stats.ipv4.remaining_interfaces =
                allocation.ipv4.interface_candidates + allocation.empty_interface_slots;
            state.stats.ipv4.interface_candidates = allocation.ipv4.interface_candidates;
            state.stats.empty_interface_slots = allocation.empty_interface_slots;
            state.stats.clone()
        };

        info!(
            parent: &*log,
            selected_interface = %allocation.interface_id,
            selected_pool_id = %allocation.pool_id,
            max_ips_to_allocate = allocation.ipv4.max_ips_to_allocate,
            available_for_allocation = allocation.ipv4.available_for_allocation,
            empty_interface_slots = allocation.empty_interface_slots,
            available = stats.ipv4.available_ips,
            used = stats.ipv4.used_ips,
            needed_ips = stats.ipv4.needed_ips,
            remaining_interfaces = stats.ipv4.remaining_interfaces,
            "Resolving IP deficit of node"
        );

        action.allocation = Some(allocation);
        Ok(Some(action))
    }

    /// Allocates the addresses needed to resolve the deficit, creating a new
    /// interface when the selected one has no capacity left
    async fn handle_ip_allocation(&self, action: &mut MaintenanceAction) -> Result<bool, IpamError> {
        let log = self.logger();
        let Some(allocation) = action.allocation.as_mut() else {
            debug!(parent: &*log, "No allocation action required");
            return Ok(false);
        };

        if allocation.ipv4.available_for_allocation > 0 {
            allocation.ipv4.available_for_allocation = allocation
                .ipv4
                .available_for_allocation
                .min(allocation.ipv4.max_ips_to_allocate);

            let start = Instant::now();
            match self.guarded(self.ops.allocate_ips(allocation)).await {
                Ok(()) => {
                    self.ctx.metrics.allocation_attempt(
                        metrics::ALLOCATE_IP,
                        metrics::SUCCESS,
                        &allocation.pool_id,
                        start.elapsed(),
                    );
                    self.ctx
                        .metrics
                        .add_ip_allocation(&allocation.pool_id, allocation.ipv4.available_for_allocation);
                    return Ok(true);
                }
                Err(IpamError::Cancelled) => return Err(IpamError::Cancelled),
                Err(err) => {
                    self.ctx.metrics.allocation_attempt(
                        metrics::ALLOCATE_IP,
                        metrics::FAILED,
                        &allocation.pool_id,
                        start.elapsed(),
                    );
                    warn!(
                        parent: &*log,
                        error = %err,
                        selected_interface = %allocation.interface_id,
                        ips_to_allocate = allocation.ipv4.available_for_allocation,
                        "Unable to assign additional IPs to interface, will create new interface"
                    );
                }
            }
        }

        self.create_interface(allocation).await
    }

    /// Creates and attaches an additional interface
    async fn create_interface(&self, allocation: &AllocationAction) -> Result<bool, IpamError> {
        if allocation.empty_interface_slots == 0 {
            // Not a failure: warn once per interval, nodes at capacity are tracked elsewhere
            let mut state = self.write();
            let now = Instant::now();
            let interval = self.ctx.config.warning_interval;
            if state
                .last_max_adapter_warning
                .is_none_or(|last| now.duration_since(last) > interval)
            {
                warn!(parent: &*self.logger(), "Instance is out of interfaces");
                state.last_max_adapter_warning = Some(now);
            }
            return Ok(false);
        }

        let start = Instant::now();
        match self.guarded(self.ops.create_interface(allocation)).await {
            Ok(allocated) => {
                let sink = &self.ctx.metrics;
                sink.allocation_attempt(
                    metrics::CREATE_INTERFACE_AND_ALLOCATE_IP,
                    metrics::SUCCESS,
                    &allocation.pool_id,
                    start.elapsed(),
                );
                sink.add_ip_allocation(&allocation.pool_id, allocated);
                sink.inc_interface_allocation(&allocation.pool_id);
                Ok(true)
            }
            Err(err) => {
                let condition = match &err {
                    IpamError::Provider(provider) => provider.condition().to_string(),
                    other => other.to_string(),
                };
                self.ctx.metrics.allocation_attempt(
                    metrics::CREATE_INTERFACE_AND_ALLOCATE_IP,
                    &condition,
                    &allocation.pool_id,
                    start.elapsed(),
                );
                warn!(parent: &*self.logger(), error = %err, "Unable to create interface on instance");
                Err(err)
            }
        }
    }
}
