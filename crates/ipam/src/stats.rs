//! Per-node allocation statistics and the pool sizing algorithm.
//!
//! Statistics are derived values: `Node::recalculate` rebuilds them from the
//! provider view and the declared resource, nothing else writes them.

/// IP allocation statistics of a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    /// IPv4 statistics
    pub ipv4: IPStatistics,

    /// Number of empty interface slots available for interfaces to be attached
    pub empty_interface_slots: usize,
}

/// IP-specific allocation statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IPStatistics {
    /// Number of IPs currently in use
    pub used_ips: usize,

    /// Number of IPs allocated to the node and available for assignment
    pub available_ips: usize,

    /// Maximum inferred IP capacity of the node
    pub capacity: usize,

    /// Number of IPs needed to reach the pre-allocation watermark
    pub needed_ips: usize,

    /// Number of free IPs exceeding the max-above-watermark retention
    pub excess_ips: usize,

    /// Interfaces that can still be created or still have address headroom
    pub remaining_interfaces: usize,

    /// Attached interfaces with addresses available for allocation
    pub interface_candidates: usize,

    /// Static IP assigned to the node
    pub assigned_static_ip: Option<String>,
}

/// Number of addresses to allocate so that `pre_allocate` spare addresses are
/// available, honouring `min_allocate` and capped at `max_allocate` (0 = no cap).
pub fn calculate_needed_ips(
    available_ips: usize,
    used_ips: usize,
    pre_allocate: usize,
    min_allocate: usize,
    max_allocate: usize,
) -> usize {
    let available = available_ips as i64;
    let mut needed = pre_allocate as i64 - (available - used_ips as i64);

    if min_allocate > 0 {
        needed = needed.max(min_allocate as i64 - available);
    }

    if max_allocate > 0 && available + needed > max_allocate as i64 {
        needed = max_allocate as i64 - available;
    }

    usize::try_from(needed).unwrap_or(0)
}

/// Number of allocated addresses that may be released.
///
/// Addresses from the initial `min_allocate + max_above_watermark` reservation
/// are kept until usage grows past it, so freshly allocated addresses are
/// never released straight away.
pub fn calculate_excess_ips(
    available_ips: usize,
    used_ips: usize,
    pre_allocate: usize,
    min_allocate: usize,
    max_above_watermark: usize,
) -> usize {
    let reserved = min_allocate + max_above_watermark;
    if used_ips <= reserved {
        if available_ips <= reserved {
            return 0;
        }
        if used_ips + pre_allocate <= reserved {
            return available_ips - reserved;
        }
    }

    available_ips.saturating_sub(used_ips + pre_allocate + max_above_watermark)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_needed_ips_pre_allocate() {
        assert_eq!(calculate_needed_ips(5, 5, 4, 0, 0), 4);
        assert_eq!(calculate_needed_ips(15, 1, 16, 0, 0), 2);
        assert_eq!(calculate_needed_ips(16, 0, 16, 0, 0), 0);
    }

    #[test]
    fn test_needed_ips_min_allocate() {
        // min-allocate dominates an empty node
        assert_eq!(calculate_needed_ips(0, 0, 4, 10, 0), 10);
        // pre-allocate dominates once min-allocate is reached
        assert_eq!(calculate_needed_ips(10, 9, 4, 10, 0), 3);
    }

    #[test]
    fn test_needed_ips_max_allocate() {
        assert_eq!(calculate_needed_ips(10, 10, 8, 0, 14), 4);
        assert_eq!(calculate_needed_ips(14, 14, 8, 0, 14), 0);
        // already above the cap never goes negative
        assert_eq!(calculate_needed_ips(20, 20, 8, 0, 14), 0);
    }

    #[test]
    fn test_excess_ips() {
        assert_eq!(calculate_excess_ips(10, 2, 4, 0, 2), 2);
        assert_eq!(calculate_excess_ips(10, 2, 4, 0, 4), 0);
        assert_eq!(calculate_excess_ips(18, 11, 4, 0, 0), 3);
    }

    #[test]
    fn test_excess_ips_keeps_bootstrap_reservation() {
        // nothing allocated beyond min-allocate + max-above-watermark
        assert_eq!(calculate_excess_ips(12, 0, 4, 10, 2), 0);
        // usage plus pre-allocation fits inside the reservation
        assert_eq!(calculate_excess_ips(20, 2, 4, 10, 2), 8);
        // usage inside the reservation but pre-allocation pushes past it
        assert_eq!(calculate_excess_ips(20, 10, 4, 10, 2), 4);
    }

    proptest! {
        #[test]
        fn test_needed_ips_respects_max_allocate(
            available in 0usize..512,
            used in 0usize..512,
            pre in 0usize..64,
            min in 0usize..128,
            max in 0usize..512,
        ) {
            let needed = calculate_needed_ips(available, used, pre, min, max);
            if max > 0 && available <= max {
                prop_assert!(available + needed <= max);
            }
            if max > 0 && available > max {
                prop_assert_eq!(needed, 0);
            }
            prop_assert_eq!(needed, calculate_needed_ips(available, used, pre, min, max));
        }

        #[test]
        fn test_excess_ips_bounded_by_available(
            available in 0usize..512,
            used in 0usize..512,
            pre in 0usize..64,
            min in 0usize..128,
            watermark in 0usize..64,
        ) {
            let excess = calculate_excess_ips(available, used, pre, min, watermark);
            prop_assert!(excess <= available);
            prop_assert_eq!(excess, calculate_excess_ips(available, used, pre, min, watermark));
        }
    }
}
