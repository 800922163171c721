//! CIDR pool provider.
//!
//! Hands out IPv4 addresses from a single cluster CIDR. Every node gets up
//! to `max_interfaces` synthetic interfaces (`eth0`, `eth1`, ...), each
//! holding up to `ips_per_interface` addresses. The allocator is shared by
//! all nodes so an address is never handed out twice.

use crate::action::{AllocationAction, IPAllocationAction, ReleaseAction};
use crate::error::ProviderError;
use crate::ops::{InterfaceStats, IpamProvider, NodeOperations};
use crds::{AllocationIP, AllocationMap, IPAMNode, InterfaceStatus, Tags};
use ipnet::Ipv4Net;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{debug, info};

/// Sizing of the CIDR provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrProviderConfig {
    /// Cluster CIDR addresses are allocated from
    pub cidr: Ipv4Net,
    /// Interfaces per node
    pub max_interfaces: usize,
    /// Addresses per interface
    pub ips_per_interface: usize,
}

#[derive(Debug, Default)]
struct NodeAddresses {
    interfaces: BTreeMap<String, BTreeSet<Ipv4Addr>>,
    static_ip: Option<Ipv4Addr>,
    used: HashSet<String>,
}

#[derive(Debug, Default)]
struct Allocator {
    allocated: HashSet<Ipv4Addr>,
    nodes: HashMap<String, NodeAddresses>,
}

impl Allocator {
    /// Reserves `count` free addresses, all or nothing
    fn take(&mut self, cidr: &Ipv4Net, count: usize) -> Result<Vec<Ipv4Addr>, ProviderError> {
        let free: Vec<Ipv4Addr> = cidr
            .hosts()
            .filter(|ip| !self.allocated.contains(ip))
            .take(count)
            .collect();
        if free.len() < count {
            return Err(ProviderError::call(
                "pool-exhausted",
                format!("{cidr} has {} free addresses, {count} requested", free.len()),
            ));
        }
        self.allocated.extend(free.iter().copied());
        Ok(free)
    }

    fn node(&mut self, name: &str) -> Result<&mut NodeAddresses, ProviderError> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| ProviderError::InstanceNotFound(name.to_string()))
    }
}

/// Provider backed by a single IPv4 CIDR
#[derive(Debug, Clone)]
pub struct CidrPoolProvider {
    config: Arc<CidrProviderConfig>,
    allocator: Arc<Mutex<Allocator>>,
}

impl CidrPoolProvider {
    /// Creates a provider with nothing allocated
    pub fn new(config: CidrProviderConfig) -> Self {
        Self {
            config: Arc::new(config),
            allocator: Arc::new(Mutex::new(Allocator::default())),
        }
    }

    /// Number of addresses currently handed out across all nodes
    pub fn allocated_count(&self) -> usize {
        lock(&self.allocator).allocated.len()
    }
}

fn lock(allocator: &Mutex<Allocator>) -> MutexGuard<'_, Allocator> {
    allocator.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait::async_trait]
impl IpamProvider for CidrPoolProvider {
    fn create_node(&self, resource: &IPAMNode) -> Arc<dyn NodeOperations> {
        let name = resource.name_any();
        let mut allocator = lock(&self.allocator);
        if !allocator.nodes.contains_key(&name) {
            // Adopt addresses a previous run already published
            let mut addresses = NodeAddresses::default();
            for (ip, alloc) in &resource.spec.ipam.pool {
                let Ok(ip) = ip.parse::<Ipv4Addr>() else {
                    continue;
                };
                if !self.config.cidr.contains(&ip) || !allocator.allocated.insert(ip) {
                    continue;
                }
                let interface = alloc.resource.clone().unwrap_or_else(|| "eth0".to_string());
                addresses.interfaces.entry(interface).or_default().insert(ip);
            }
            let static_ip = resource
                .ipam_status()
                .and_then(|status| status.assigned_static_ip.as_deref())
                .and_then(|ip| ip.parse::<Ipv4Addr>().ok())
                .filter(|ip| self.config.cidr.contains(ip));
            if let Some(ip) = static_ip {
                allocator.allocated.insert(ip);
                addresses.static_ip = Some(ip);
            }
            let adopted: usize = addresses.interfaces.values().map(BTreeSet::len).sum();
            allocator.nodes.insert(name.clone(), addresses);
            debug!(node = %name, allocated = adopted, static_ip = ?static_ip, "Registered node with CIDR provider");
        }

        Arc::new(CidrNodeOps {
            node: name,
            config: Arc::clone(&self.config),
            allocator: Arc::clone(&self.allocator),
        })
    }

    async fn resync(&self) -> Option<Instant> {
        Some(Instant::now())
    }

    async fn instance_sync(&self, _instance_id: &str) -> Option<Instant> {
        Some(Instant::now())
    }

    fn delete_node(&self, name: &str) {
        let mut allocator = lock(&self.allocator);
        let Some(addresses) = allocator.nodes.remove(name) else {
            return;
        };
        let released: Vec<Ipv4Addr> = addresses
            .interfaces
            .into_values()
            .flatten()
            .chain(addresses.static_ip)
            .collect();
        for ip in &released {
            allocator.allocated.remove(ip);
        }
        info!(node = %name, released = released.len(), "Returned node addresses to CIDR pool");
    }
}

/// Per-node operations of the [`CidrPoolProvider`]
#[derive(Debug)]
pub struct CidrNodeOps {
    node: String,
    config: Arc<CidrProviderConfig>,
    allocator: Arc<Mutex<Allocator>>,
}

impl CidrNodeOps {
    fn pool_id(&self) -> String {
        self.config.cidr.to_string()
    }

    fn headroom(&self, addresses: &BTreeSet<Ipv4Addr>) -> usize {
        self.config.ips_per_interface.saturating_sub(addresses.len())
    }
}

#[async_trait::async_trait]
impl NodeOperations for CidrNodeOps {
    fn updated_node(&self, resource: &IPAMNode) {
        let used: HashSet<String> = resource
            .ipam_status()
            .map(|status| status.used.keys().cloned().collect())
            .unwrap_or_default();
        if let Ok(node) = lock(&self.allocator).node(&self.node) {
            node.used = used;
        }
    }

    fn populate_status_fields(&self, resource: &mut IPAMNode) {
        let pool_id = self.pool_id();
        let interfaces: BTreeMap<String, InterfaceStatus> = match lock(&self.allocator).node(&self.node) {
            Ok(node) => node
                .interfaces
                .iter()
                .map(|(id, addresses)| {
                    let status = InterfaceStatus {
                        pool_id: pool_id.clone(),
                        addresses: addresses.iter().map(Ipv4Addr::to_string).collect(),
                    };
                    (id.clone(), status)
                })
                .collect(),
            Err(_) => return,
        };
        resource.ipam_status_mut().interfaces = interfaces;
    }

    async fn resync_interfaces_and_ips(&self) -> Result<(AllocationMap, InterfaceStats), ProviderError> {
        let mut allocator = lock(&self.allocator);
        let node = allocator.node(&self.node)?;

        let mut available = AllocationMap::new();
        for (id, addresses) in &node.interfaces {
            for ip in addresses {
                available.insert(
                    ip.to_string(),
                    AllocationIP {
                        owner: None,
                        resource: Some(id.clone()),
                    },
                );
            }
        }

        let with_headroom = node
            .interfaces
            .values()
            .filter(|addresses| self.headroom(addresses) > 0)
            .count();
        let stats = InterfaceStats {
            node_capacity: self.config.max_interfaces * self.config.ips_per_interface,
            remaining_available_interface_count: self
                .config
                .max_interfaces
                .saturating_sub(node.interfaces.len())
                + with_headroom,
            assigned_static_ip: node.static_ip.map(|ip| ip.to_string()),
        };
        Ok((available, stats))
    }

    async fn prepare_ip_allocation(&self) -> Result<AllocationAction, ProviderError> {
        let mut allocator = lock(&self.allocator);
        let node = allocator.node(&self.node)?;

        let mut action = AllocationAction {
            pool_id: self.pool_id(),
            empty_interface_slots: self.config.max_interfaces.saturating_sub(node.interfaces.len()),
            ..Default::default()
        };
        let candidates: Vec<(&String, usize)> = node
            .interfaces
            .iter()
            .map(|(id, addresses)| (id, self.headroom(addresses)))
            .filter(|(_, headroom)| *headroom > 0)
            .collect();
        if let Some((id, headroom)) = candidates.first() {
            action.interface_id = (*id).clone();
            action.ipv4 = IPAllocationAction {
                available_for_allocation: *headroom,
                max_ips_to_allocate: 0,
                interface_candidates: candidates.len(),
            };
        }
        Ok(action)
    }

    async fn allocate_ips(&self, action: &AllocationAction) -> Result<(), ProviderError> {
        let mut allocator = lock(&self.allocator);
        let headroom = {
            let node = allocator.node(&self.node)?;
            let addresses = node.interfaces.get(&action.interface_id).ok_or_else(|| {
                ProviderError::call("interface-not-found", format!("no interface {}", action.interface_id))
            })?;
            self.headroom(addresses)
        };
        let count = action.ipv4.available_for_allocation;
        if count > headroom {
            return Err(ProviderError::call(
                "interface-full",
                format!("{} has room for {headroom} addresses, {count} requested", action.interface_id),
            ));
        }

        let ips = allocator.take(&self.config.cidr, count)?;
        let node = allocator.node(&self.node)?;
        node.interfaces
            .entry(action.interface_id.clone())
            .or_default()
            .extend(ips);
        debug!(node = %self.node, interface = %action.interface_id, count, "Allocated addresses");
        Ok(())
    }

    async fn create_interface(&self, action: &AllocationAction) -> Result<usize, ProviderError> {
        let mut allocator = lock(&self.allocator);
        let id = {
            let node = allocator.node(&self.node)?;
            if node.interfaces.len() >= self.config.max_interfaces {
                return Err(ProviderError::call(
                    "interface-limit",
                    format!("{} interfaces already attached", node.interfaces.len()),
                ));
            }
            (0..)
                .map(|index| format!("eth{index}"))
                .find(|id| !node.interfaces.contains_key(id))
                .unwrap_or_default()
        };

        let count = action.ipv4.max_ips_to_allocate.min(self.config.ips_per_interface);
        let ips = allocator.take(&self.config.cidr, count)?;
        let node = allocator.node(&self.node)?;
        node.interfaces.insert(id.clone(), ips.into_iter().collect());
        info!(node = %self.node, interface = %id, count, "Created interface");
        Ok(count)
    }

    fn prepare_ip_release(&self, excess: usize) -> ReleaseAction {
        let mut allocator = lock(&self.allocator);
        let mut action = ReleaseAction {
            pool_id: self.pool_id(),
            ..Default::default()
        };
        let Ok(node) = allocator.node(&self.node) else {
            return action;
        };

        let static_ip = node.static_ip;
        let unused = |addresses: &BTreeSet<Ipv4Addr>| -> Vec<Ipv4Addr> {
            addresses
                .iter()
                .filter(|ip| Some(**ip) != static_ip && !node.used.contains(&ip.to_string()))
                .copied()
                .collect()
        };
        // Interface with the most unused addresses, first by name on ties
        let best = node
            .interfaces
            .iter()
            .map(|(id, addresses)| (id, unused(addresses)))
            .filter(|(_, unused)| !unused.is_empty())
            .fold(None::<(&String, Vec<Ipv4Addr>)>, |best, candidate| match best {
                Some(best) if best.1.len() >= candidate.1.len() => Some(best),
                _ => Some(candidate),
            });
        if let Some((id, unused)) = best {
            action.interface_id = id.clone();
            action.ips_to_release = unused
                .iter()
                .rev()
                .take(excess)
                .map(Ipv4Addr::to_string)
                .collect();
        }
        action
    }

    async fn release_ips(&self, action: &ReleaseAction) -> Result<(), ProviderError> {
        let mut allocator = lock(&self.allocator);
        let mut released = Vec::with_capacity(action.ips_to_release.len());
        {
            let node = allocator.node(&self.node)?;
            let addresses = node.interfaces.get_mut(&action.interface_id).ok_or_else(|| {
                ProviderError::call("interface-not-found", format!("no interface {}", action.interface_id))
            })?;
            for ip in &action.ips_to_release {
                let Ok(ip) = ip.parse::<Ipv4Addr>() else {
                    continue;
                };
                if addresses.remove(&ip) {
                    released.push(ip);
                }
            }
        }
        for ip in &released {
            allocator.allocated.remove(ip);
        }
        debug!(node = %self.node, interface = %action.interface_id, count = released.len(), "Released addresses");
        Ok(())
    }

    async fn release_ip_prefixes(&self, action: &ReleaseAction) -> Result<(), ProviderError> {
        if action.ip_prefixes_to_release.is_empty() {
            return Ok(());
        }
        Err(ProviderError::Unsupported("prefix delegation".to_string()))
    }

    async fn allocate_static_ip(&self, tags: &Tags) -> Result<String, ProviderError> {
        let mut allocator = lock(&self.allocator);
        if let Some(ip) = allocator.node(&self.node)?.static_ip {
            return Ok(ip.to_string());
        }
        let ip = allocator
            .take(&self.config.cidr, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::call("pool-exhausted", "no static address left"))?;
        allocator.node(&self.node)?.static_ip = Some(ip);
        info!(node = %self.node, ip = %ip, tags = ?tags, "Assigned static IP");
        Ok(ip.to_string())
    }

    fn get_maximum_allocatable_ipv4(&self) -> usize {
        self.config.max_interfaces * self.config.ips_per_interface
    }

    fn get_minimum_allocatable_ipv4(&self) -> usize {
        self.config.ips_per_interface
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ipam_node, set_used};

    fn provider(cidr: &str, max_interfaces: usize, ips_per_interface: usize) -> CidrPoolProvider {
        CidrPoolProvider::new(CidrProviderConfig {
            cidr: cidr.parse().unwrap(),
            max_interfaces,
            ips_per_interface,
        })
    }

    fn allocation(max_ips_to_allocate: usize) -> AllocationAction {
        AllocationAction {
            ipv4: IPAllocationAction {
                max_ips_to_allocate,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_new_node_starts_with_empty_interface_slots() {
        let provider = provider("10.1.0.0/24", 2, 4);
        let ops = provider.create_node(&ipam_node("node-a"));

        let (available, stats) = ops.resync_interfaces_and_ips().await.unwrap();
        assert!(available.is_empty());
        assert_eq!(stats.node_capacity, 8);
        assert_eq!(stats.remaining_available_interface_count, 2);

        let action = ops.prepare_ip_allocation().await.unwrap();
        assert_eq!(action.empty_interface_slots, 2);
        assert_eq!(action.ipv4.available_for_allocation, 0);
        assert_eq!(action.pool_id, "10.1.0.0/24");
    }

    #[tokio::test]
    async fn test_interface_creation_then_allocation_on_headroom() {
        let provider = provider("10.1.0.0/24", 2, 4);
        let ops = provider.create_node(&ipam_node("node-a"));

        assert_eq!(ops.create_interface(&allocation(10)).await.unwrap(), 4);
        assert_eq!(ops.create_interface(&allocation(2)).await.unwrap(), 2);

        let action = ops.prepare_ip_allocation().await.unwrap();
        assert_eq!(action.interface_id, "eth1");
        assert_eq!(action.ipv4.available_for_allocation, 2);
        assert_eq!(action.ipv4.interface_candidates, 1);
        assert_eq!(action.empty_interface_slots, 0);

        ops.allocate_ips(&action).await.unwrap();
        let (available, _) = ops.resync_interfaces_and_ips().await.unwrap();
        assert_eq!(available.len(), 8);
        assert_eq!(available["10.1.0.1"].resource.as_deref(), Some("eth0"));

        let err = ops.create_interface(&allocation(1)).await.unwrap_err();
        assert_eq!(err.condition(), "interface-limit");
    }

    #[tokio::test]
    async fn test_addresses_are_unique_across_nodes() {
        let provider = provider("10.1.0.0/29", 1, 4);
        let a = provider.create_node(&ipam_node("node-a"));
        let b = provider.create_node(&ipam_node("node-b"));

        a.create_interface(&allocation(4)).await.unwrap();
        b.create_interface(&allocation(2)).await.unwrap();

        let (pool_a, _) = a.resync_interfaces_and_ips().await.unwrap();
        let (pool_b, _) = b.resync_interfaces_and_ips().await.unwrap();
        assert!(pool_a.keys().all(|ip| !pool_b.contains_key(ip)));
        assert_eq!(provider.allocated_count(), 6);
    }

    #[tokio::test]
    async fn test_exhausted_pool_reports_condition() {
        // A /30 has two usable hosts
        let provider = provider("10.1.0.0/30", 1, 4);
        let ops = provider.create_node(&ipam_node("node-a"));

        let err = ops.create_interface(&allocation(4)).await.unwrap_err();

        assert_eq!(err.condition(), "pool-exhausted");
        assert_eq!(provider.allocated_count(), 0);
    }

    #[tokio::test]
    async fn test_release_prefers_interface_with_most_unused() {
        let provider = provider("10.1.0.0/24", 2, 4);
        let ops = provider.create_node(&ipam_node("node-a"));
        ops.create_interface(&allocation(4)).await.unwrap();
        ops.create_interface(&allocation(4)).await.unwrap();

        // eth0 holds .1-.4, eth1 holds .5-.8
        let mut resource = ipam_node("node-a");
        set_used(&mut resource, &["10.1.0.5", "10.1.0.6", "10.1.0.1"]);
        ops.updated_node(&resource);

        let release = ops.prepare_ip_release(2);
        assert_eq!(release.interface_id, "eth0");
        assert_eq!(release.ips_to_release, vec!["10.1.0.4".to_string(), "10.1.0.3".to_string()]);

        ops.release_ips(&release).await.unwrap();
        assert_eq!(provider.allocated_count(), 6);
        let (available, _) = ops.resync_interfaces_and_ips().await.unwrap();
        assert!(!available.contains_key("10.1.0.4"));
    }

    #[tokio::test]
    async fn test_declared_pool_is_adopted() {
        let provider = provider("10.1.0.0/24", 2, 4);
        let mut resource = ipam_node("node-a");
        for ip in ["10.1.0.1", "10.1.0.2"] {
            resource.spec.ipam.pool.insert(
                ip.to_string(),
                AllocationIP {
                    owner: None,
                    resource: Some("eth1".to_string()),
                },
            );
        }
        // Outside the CIDR, ignored
        resource
            .spec
            .ipam
            .pool
            .insert("192.168.0.1".to_string(), AllocationIP::default());

        let ops = provider.create_node(&resource);
        let (available, _) = ops.resync_interfaces_and_ips().await.unwrap();

        assert_eq!(available.len(), 2);
        assert_eq!(provider.allocated_count(), 2);
        let action = ops.prepare_ip_allocation().await.unwrap();
        assert_eq!(action.interface_id, "eth1");
        assert_eq!(ops.create_interface(&allocation(1)).await.unwrap(), 1);
        let (available, _) = ops.resync_interfaces_and_ips().await.unwrap();
        assert_eq!(available["10.1.0.3"].resource.as_deref(), Some("eth0"));
    }

    #[tokio::test]
    async fn test_published_static_ip_is_adopted() {
        // A /29 has six usable hosts
        let provider = provider("10.1.0.0/29", 1, 4);
        let mut resource = ipam_node("node-a");
        resource.ipam_status_mut().assigned_static_ip = Some("10.1.0.1".to_string());

        let a = provider.create_node(&resource);
        let (_, stats) = a.resync_interfaces_and_ips().await.unwrap();
        assert_eq!(stats.assigned_static_ip.as_deref(), Some("10.1.0.1"));
        assert_eq!(a.allocate_static_ip(&Tags::new()).await.unwrap(), "10.1.0.1");
        assert_eq!(provider.allocated_count(), 1);

        let b = provider.create_node(&ipam_node("node-b"));
        assert_eq!(b.allocate_static_ip(&Tags::new()).await.unwrap(), "10.1.0.2");
    }

    #[tokio::test]
    async fn test_static_ip_outside_cidr_is_not_adopted() {
        let provider = provider("10.1.0.0/29", 1, 4);
        let mut resource = ipam_node("node-a");
        resource.ipam_status_mut().assigned_static_ip = Some("192.168.0.1".to_string());

        let ops = provider.create_node(&resource);
        let (_, stats) = ops.resync_interfaces_and_ips().await.unwrap();

        assert_eq!(stats.assigned_static_ip, None);
        assert_eq!(provider.allocated_count(), 0);
    }

    #[tokio::test]
    async fn test_deleted_node_returns_addresses() {
        let provider = provider("10.1.0.0/29", 1, 4);
        let a = provider.create_node(&ipam_node("node-a"));
        a.create_interface(&allocation(4)).await.unwrap();
        a.allocate_static_ip(&Tags::new()).await.unwrap();
        assert_eq!(provider.allocated_count(), 5);

        provider.delete_node("node-a");
        assert_eq!(provider.allocated_count(), 0);
        let err = a.resync_interfaces_and_ips().await.unwrap_err();
        assert_eq!(err.condition(), "instance-not-found");

        // The freed addresses are handed out again
        let b = provider.create_node(&ipam_node("node-b"));
        assert_eq!(b.create_interface(&allocation(4)).await.unwrap(), 4);
        let (available, _) = b.resync_interfaces_and_ips().await.unwrap();
        assert!(available.contains_key("10.1.0.1"));

        // Unknown nodes are ignored
        provider.delete_node("node-c");
        assert_eq!(provider.allocated_count(), 4);
    }

    #[tokio::test]
    async fn test_static_ip_is_stable_and_never_released() {
        let provider = provider("10.1.0.0/24", 1, 4);
        let ops = provider.create_node(&ipam_node("node-a"));

        let ip = ops.allocate_static_ip(&Tags::new()).await.unwrap();
        assert_eq!(ops.allocate_static_ip(&Tags::new()).await.unwrap(), ip);
        let (_, stats) = ops.resync_interfaces_and_ips().await.unwrap();
        assert_eq!(stats.assigned_static_ip.as_deref(), Some(ip.as_str()));

        ops.create_interface(&allocation(2)).await.unwrap();
        let release = ops.prepare_ip_release(4);
        assert_eq!(release.ips_to_release.len(), 2);
        assert!(!release.ips_to_release.contains(&ip));
    }

    #[test]
    fn test_populate_status_fields_lists_interfaces() {
        let provider = provider("10.1.0.0/24", 1, 4);
        let ops = provider.create_node(&ipam_node("node-a"));
        let mut resource = ipam_node("node-a");

        ops.populate_status_fields(&mut resource);

        assert!(resource.ipam_status().unwrap().interfaces.is_empty());
        assert_eq!(ops.get_maximum_allocatable_ipv4(), 4);
        assert_eq!(ops.get_minimum_allocatable_ipv4(), 4);
    }
}
