//! IPAM errors
//!
//! Every error is scoped to a single node and a single cycle. None of them is
//! fatal to the process; the next trigger fire retries.

use thiserror::Error;

/// Errors returned by a pool provider (`NodeOperations`)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Provider cannot describe the node's capacity
    #[error("instance limits not found: {0}")]
    LimitsNotFound(String),

    /// Provider does not know the instance (possibly deleted)
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Allocation, release or interface creation failed
    #[error("provider call failed ({condition}): {message}")]
    Call {
        /// Short label recorded with the metric (e.g. "pool-exhausted")
        condition: String,
        /// Human readable error
        message: String,
    },

    /// Operation not supported by this provider
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl ProviderError {
    /// Convenience constructor for call failures
    pub fn call(condition: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Call {
            condition: condition.into(),
            message: message.into(),
        }
    }

    /// Metric condition label for this error
    pub fn condition(&self) -> &str {
        match self {
            ProviderError::LimitsNotFound(_) => "limits-not-found",
            ProviderError::InstanceNotFound(_) => "instance-not-found",
            ProviderError::Call { condition, .. } => condition,
            ProviderError::Unsupported(_) => "unsupported",
        }
    }
}

/// Errors returned by the declarative resource store (`NodeStore`)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The base version passed to an update is no longer current
    #[error("conflict updating {0}: resource version is outdated")]
    Conflict(String),

    /// Resource does not exist
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Any other API failure
    #[error("store API error: {0}")]
    Api(String),
}

/// Errors returned by the pending pod lookup (`PendingPodCounter`)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PendingPodsError {
    /// Listing the pods of a node failed
    #[error("unable to list pods on {node}: {message}")]
    List {
        /// Node whose pods were listed
        node: String,
        /// Error returned by the pod API
        message: String,
    },
}

/// Errors surfaced by node operations
#[derive(Debug, Error)]
pub enum IpamError {
    /// Provider API is unstable, mutating operations are blocked
    #[error("instances API is unstable, blocking mutating operations")]
    ApiUnstable,

    /// Pool provider error
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Resource store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Pending pod lookup failed
    #[error("unable to compute pending pods: {0}")]
    PendingPods(#[from] PendingPodsError),

    /// The cycle was cancelled before the call completed
    #[error("operation cancelled")]
    Cancelled,
}
