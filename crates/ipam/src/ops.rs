//! Pool provider capabilities.
//!
//! A provider is selected at construction. `IpamProvider` is the
//! provider-wide handle owned by the node manager; it creates one
//! `NodeOperations` per node. All methods must be `Send` to work with Tokio's
//! work-stealing runtime.

use crate::action::{AllocationAction, ReleaseAction};
use crate::error::{PendingPodsError, ProviderError};
use crds::{AllocationMap, IPAMNode, Tags};
use tokio::time::Instant;

/// Capacity information returned by a provider resync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    /// Maximum number of addresses the node can hold
    pub node_capacity: usize,

    /// Interfaces that can be created or still have address headroom
    pub remaining_available_interface_count: usize,

    /// Static IP currently attached to the node
    pub assigned_static_ip: Option<String>,
}

/// Per-node provider operations
#[async_trait::async_trait]
pub trait NodeOperations: Send + Sync {
    /// Called with every new version of the node resource
    fn updated_node(&self, resource: &IPAMNode);

    /// Fill provider-specific status fields before the status is written
    fn populate_status_fields(&self, resource: &mut IPAMNode);

    /// Refresh the provider view of the node's addresses and capacity
    async fn resync_interfaces_and_ips(&self) -> Result<(AllocationMap, InterfaceStats), ProviderError>;

    /// Select where the next addresses should be allocated
    async fn prepare_ip_allocation(&self) -> Result<AllocationAction, ProviderError>;

    /// Allocate `ipv4.available_for_allocation` addresses on the selected interface
    async fn allocate_ips(&self, action: &AllocationAction) -> Result<(), ProviderError>;

    /// Create and attach a new interface, returning the number of addresses allocated on it
    async fn create_interface(&self, action: &AllocationAction) -> Result<usize, ProviderError>;

    /// Select up to `excess` addresses to release
    fn prepare_ip_release(&self, excess: usize) -> ReleaseAction;

    /// Release `ips_to_release`
    async fn release_ips(&self, action: &ReleaseAction) -> Result<(), ProviderError>;

    /// Release `ip_prefixes_to_release`
    async fn release_ip_prefixes(&self, action: &ReleaseAction) -> Result<(), ProviderError>;

    /// Attach a static IP selected by `tags`
    async fn allocate_static_ip(&self, tags: &Tags) -> Result<String, ProviderError>;

    /// Maximum number of addresses the instance can hold
    fn get_maximum_allocatable_ipv4(&self) -> usize;

    /// Minimum number of addresses worth allocating, used to seed pre-allocate
    fn get_minimum_allocatable_ipv4(&self) -> usize;
}

/// Provider-wide operations
#[async_trait::async_trait]
pub trait IpamProvider: Send + Sync {
    /// Build the per-node operations for a newly observed node
    fn create_node(&self, resource: &IPAMNode) -> std::sync::Arc<dyn NodeOperations>;

    /// Refresh provider state for all nodes. `None` means the provider API is
    /// unstable and mutating operations must be blocked.
    async fn resync(&self) -> Option<Instant>;

    /// Refresh provider state for one instance. `None` on failure.
    async fn instance_sync(&self, instance_id: &str) -> Option<Instant>;

    /// Forget the node `name` and return its addresses to the provider
    fn delete_node(&self, _name: &str) {}
}

/// Source of the number of pods waiting for an address on a node
#[async_trait::async_trait]
pub trait PendingPodCounter: Send + Sync {
    /// Number of pods scheduled on `node_name` in the `Pending` phase
    async fn pending_pods(&self, node_name: &str) -> Result<usize, PendingPodsError>;
}
