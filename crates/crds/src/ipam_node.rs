//! IPAMNode CRD
//!
//! Per-node IP address management resource. The spec carries the declared
//! address pool and the watermarks the operator sizes it against; the status
//! carries the addresses in use (written by the node agent) and the release
//! handshake shared between the operator and the agent.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Map of IP address to its allocation metadata
pub type AllocationMap = BTreeMap<String, AllocationIP>;

/// Free-form key/value tags (e.g. static IP selection tags)
pub type Tags = BTreeMap<String, String>;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "dcops.microscaler.io",
    version = "v1alpha1",
    kind = "IPAMNode",
    shortname = "ipn",
    status = "IPAMNodeStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct IPAMNodeSpec {
    /// Provider instance backing this node (defaults to the resource name)
    #[serde(default, rename = "instanceID", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// IPAM configuration and declared pool
    #[serde(default)]
    pub ipam: IPAMSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IPAMSpec {
    /// Addresses allocated to this node and available for assignment
    #[serde(default)]
    pub pool: AllocationMap,

    /// Number of spare addresses to keep allocated ahead of demand.
    /// 0 means the operator default.
    #[serde(default)]
    pub pre_allocate: usize,

    /// Minimum number of addresses to allocate once the node comes up
    #[serde(default)]
    pub min_allocate: usize,

    /// Upper bound on addresses allocated to the node (0 = provider limit)
    #[serde(default)]
    pub max_allocate: usize,

    /// Addresses to allocate on top of the pre-allocation watermark
    #[serde(default)]
    pub max_above_watermark: usize,

    /// Tags selecting a static IP to attach to the node
    #[serde(default, rename = "staticIPTags", skip_serializing_if = "Option::is_none")]
    pub static_ip_tags: Option<Tags>,
}

/// Allocation metadata of a single address
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationIP {
    /// Owner of the address (e.g. the pod using it)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Provider resource the address lives on (e.g. interface ID)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IPAMNodeStatus {
    /// IPAM status
    #[serde(default)]
    pub ipam: IPAMStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IPAMStatus {
    /// Addresses currently in use on the node (written by the agent)
    #[serde(default)]
    pub used: AllocationMap,

    /// Release handshake state per address
    #[serde(default, rename = "releaseIPs")]
    pub release_ips: BTreeMap<String, IPReleaseStatus>,

    /// Static IP attached to the node
    #[serde(default, rename = "assignedStaticIP", skip_serializing_if = "Option::is_none")]
    pub assigned_static_ip: Option<String>,

    /// Provider view of the node's interfaces
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub interfaces: BTreeMap<String, InterfaceStatus>,
}

/// Provider-populated interface status
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceStatus {
    /// Pool the interface draws addresses from
    #[serde(default, rename = "poolID")]
    pub pool_id: String,

    /// Addresses attached to the interface
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Release handshake state of an address
///
/// The operator marks, the agent answers ready/do-not-release, the operator
/// finally sets released. The agent drops the entry once it has seen the
/// address leave the pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum IPReleaseStatus {
    /// Candidate for release, waiting for the agent
    MarkedForRelease,

    /// Agent acknowledged the address is unused
    ReadyForRelease,

    /// Agent vetoed the release
    DoNotRelease,

    /// Address released by the operator
    Released,
}

impl IPReleaseStatus {
    /// Wire representation of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            IPReleaseStatus::MarkedForRelease => "marked-for-release",
            IPReleaseStatus::ReadyForRelease => "ready-for-release",
            IPReleaseStatus::DoNotRelease => "do-not-release",
            IPReleaseStatus::Released => "released",
        }
    }
}

impl std::fmt::Display for IPReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl IPAMNode {
    /// Instance ID of the node, falling back to the resource name
    pub fn instance_id(&self) -> String {
        self.spec
            .instance_id
            .clone()
            .unwrap_or_else(|| self.name_any())
    }

    /// IPAM status, if the status subresource has been written
    pub fn ipam_status(&self) -> Option<&IPAMStatus> {
        self.status.as_ref().map(|s| &s.ipam)
    }

    /// Mutable IPAM status, creating an empty status when absent
    pub fn ipam_status_mut(&mut self) -> &mut IPAMStatus {
        &mut self.status.get_or_insert_with(IPAMNodeStatus::default).ipam
    }

    /// Number of addresses the agent reports in use
    pub fn used_count(&self) -> usize {
        self.ipam_status().map_or(0, |s| s.used.len())
    }

    /// Release handshake status the agent last saw for `ip`
    pub fn release_status(&self, ip: &str) -> Option<IPReleaseStatus> {
        self.ipam_status().and_then(|s| s.release_ips.get(ip).copied())
    }

    /// True while any address is part of a release handshake
    pub fn release_in_progress(&self) -> bool {
        self.ipam_status().is_some_and(|s| !s.release_ips.is_empty())
    }
}
