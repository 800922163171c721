//! Allocation and release action descriptors.
//!
//! Produced by the provider (`prepare_ip_allocation` / `prepare_ip_release`),
//! adjusted by the node's sizing logic and handed back to the provider to
//! execute.

/// Action to resolve an allocation deficit on a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationAction {
    /// Interface on which the addresses must be allocated. Empty when no
    /// interface context is needed or a new interface must be created.
    pub interface_id: String,

    /// Pool to allocate from (subnet ID, CIDR, or a single global pool)
    pub pool_id: String,

    /// Number of empty interface slots available for new interfaces
    pub empty_interface_slots: usize,

    /// IPv4 specifics
    pub ipv4: IPAllocationAction,
}

/// IP-specific part of an [`AllocationAction`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IPAllocationAction {
    /// Addresses available for allocation on `interface_id`. May be lower
    /// than the deficit.
    pub available_for_allocation: usize,

    /// Ceiling set by the node before execution: deficit plus
    /// max-above-watermark plus surge.
    pub max_ips_to_allocate: usize,

    /// Attached interfaces with addresses available for allocation
    pub interface_candidates: usize,
}

/// Action to resolve an allocation excess on a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseAction {
    /// Interface the addresses are released from
    pub interface_id: String,

    /// Pool the addresses are returned to
    pub pool_id: String,

    /// Addresses to release
    pub ips_to_release: Vec<String>,

    /// Prefixes to release
    pub ip_prefixes_to_release: Vec<String>,
}

/// What a single pool-maintenance cycle will do
#[derive(Debug, Clone, Default)]
pub(crate) struct MaintenanceAction {
    pub(crate) allocation: Option<AllocationAction>,
    pub(crate) release: Option<ReleaseAction>,
}
