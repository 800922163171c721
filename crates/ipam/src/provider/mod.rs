//! Pool providers.
//!
//! A provider implements [`crate::ops::IpamProvider`] and hands out one
//! [`crate::ops::NodeOperations`] per node.

pub mod cidr;

pub use cidr::{CidrPoolProvider, CidrProviderConfig};
