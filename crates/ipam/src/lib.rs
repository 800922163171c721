//! Per-node IPAM reconciliation engine
//!
//! Keeps each cluster node's pool of pre-allocated IP addresses between a
//! low watermark (pre-allocate / min-allocate) and a high watermark
//! (max-above-watermark / max-allocate), releases excess addresses through a
//! handshake with the node agent and publishes the result to the
//! declarative `IPAMNode` resource.
//!
//! # Example
//!
//! ```no_run
//! use ipam::{CidrPoolProvider, CidrProviderConfig, IpamConfig, NoOpMetrics, NodeManager};
//! use ipam::{NodeStore, PendingPodCounter};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(
//! #     store: Arc<dyn NodeStore>,
//! #     pods: Arc<dyn PendingPodCounter>,
//! #     resource: crds::IPAMNode,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let provider = CidrPoolProvider::new(CidrProviderConfig {
//!     cidr: "10.128.0.0/16".parse()?,
//!     max_interfaces: 4,
//!     ips_per_interface: 16,
//! });
//! let manager = NodeManager::new(
//!     IpamConfig::default(),
//!     Arc::new(provider),
//!     store,
//!     Arc::new(NoOpMetrics),
//!     pods,
//! );
//! manager.start(Duration::from_secs(60));
//!
//! // Feed every observed IPAMNode version
//! manager.upsert(&resource).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Pool sizing**: deficit/excess from the resource watermarks
//! - **Release handshake**: excess addresses are only released once the agent agrees
//! - **Debounced triggers**: bursts of updates collapse into one maintenance run
//! - **Two-phase sync**: status is written before spec, with conflict retries
//! - **Mocks**: in-memory collaborators behind the `test-util` feature

pub mod action;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod node;
pub mod ops;
pub mod provider;
pub mod stats;
pub mod store;
pub mod trigger;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use action::{AllocationAction, IPAllocationAction, ReleaseAction};
pub use config::{DEFAULT_PRE_ALLOCATE, IpamConfig};
pub use error::{IpamError, PendingPodsError, ProviderError, StoreError};
pub use manager::NodeManager;
pub use metrics::{MetricsApi, NoOpMetrics};
pub use node::{Node, NodeContext, NodeTriggers};
pub use ops::{InterfaceStats, IpamProvider, NodeOperations, PendingPodCounter};
pub use provider::{CidrPoolProvider, CidrProviderConfig};
pub use stats::{IPStatistics, Statistics};
pub use store::NodeStore;
pub use trigger::{JobTrigger, Trigger, TriggerStats};
