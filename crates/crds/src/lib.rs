//! IPAM CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the IPAM Operator.

pub mod ipam_node;

pub use ipam_node::*;
