//! Metrics sink used by the IPAM engine.
//!
//! The engine only records; exposition is up to the implementation.

use crate::stats::Statistics;
use std::time::Duration;

/// Operation type: new interface created together with its addresses
pub const CREATE_INTERFACE_AND_ALLOCATE_IP: &str = "createInterfaceAndAllocateIP";
/// Operation type: addresses added to an existing interface
pub const ALLOCATE_IP: &str = "allocateIP";
/// Operation type: addresses returned to the provider
pub const RELEASE_IP: &str = "releaseIP";
/// Operation type: delegated prefixes returned to the provider
pub const RELEASE_IP_PREFIXES: &str = "releaseIPPrefixes";

/// Operation status: the provider call succeeded
pub const SUCCESS: &str = "success";
/// Operation status: the provider call returned an error
pub const FAILED: &str = "failed";

/// Recorder for allocation/release operations and node statistics
pub trait MetricsApi: Send + Sync {
    /// An allocation attempt of `typ` finished with `status` after `duration`
    fn allocation_attempt(&self, typ: &str, status: &str, pool: &str, duration: Duration);

    /// A release attempt of `typ` finished with `status` after `duration`
    fn release_attempt(&self, typ: &str, status: &str, pool: &str, duration: Duration);

    /// `count` addresses were allocated from `pool`
    fn add_ip_allocation(&self, pool: &str, count: usize);

    /// `count` addresses were released to `pool`
    fn add_ip_release(&self, pool: &str, count: usize);

    /// An interface was created in `pool`
    fn inc_interface_allocation(&self, pool: &str);

    /// Latest statistics of `node`
    fn update_node_stats(&self, _node: &str, _stats: &Statistics) {}

    /// `node` is gone, drop everything recorded for it
    fn remove_node(&self, _node: &str) {}
}

/// Metrics sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl MetricsApi for NoOpMetrics {
    fn allocation_attempt(&self, _typ: &str, _status: &str, _pool: &str, _duration: Duration) {}
    fn release_attempt(&self, _typ: &str, _status: &str, _pool: &str, _duration: Duration) {}
    fn add_ip_allocation(&self, _pool: &str, _count: usize) {}
    fn add_ip_release(&self, _pool: &str, _count: usize) {}
    fn inc_interface_allocation(&self, _pool: &str) {}
}
