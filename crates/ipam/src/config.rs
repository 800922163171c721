//! IPAM engine configuration.

use std::time::Duration;

/// Pre-allocation used when a node resource does not set one
pub const DEFAULT_PRE_ALLOCATE: usize = 8;

/// Cluster-wide IPAM policy shared by all nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamConfig {
    /// Release addresses above the retention watermark
    pub release_excess_ips: bool,

    /// How long an address must stay excess before the release handshake starts
    pub excess_ip_release_delay: Duration,

    /// Pre-allocation used when the resource leaves it at 0
    pub default_pre_allocate: usize,

    /// Interval for warnings that should not repeat on every cycle
    pub warning_interval: Duration,

    /// After an instance stops running, maintenance waits this long for a sign of life
    pub instance_stopped_grace: Duration,

    /// Attempts per phase when writing the resource
    pub max_update_attempts: usize,

    /// Minimum spacing between pool-maintenance runs
    pub maintenance_min_interval: Duration,

    /// Minimum spacing between resource-store syncs
    pub sync_min_interval: Duration,

    /// Minimum spacing between retries while the provider API is unstable
    pub retry_min_interval: Duration,

    /// Minimum spacing between rate-limited warnings
    pub log_limit_interval: Duration,
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            release_excess_ips: false,
            excess_ip_release_delay: Duration::from_secs(180),
            default_pre_allocate: DEFAULT_PRE_ALLOCATE,
            warning_interval: Duration::from_secs(60 * 60),
            instance_stopped_grace: Duration::from_secs(60),
            max_update_attempts: 2,
            maintenance_min_interval: Duration::from_millis(10),
            sync_min_interval: Duration::from_millis(10),
            retry_min_interval: Duration::from_secs(60),
            log_limit_interval: Duration::from_secs(10),
        }
    }
}
