//! Controller-specific error types.
//!
//! Errors scoped to a single node live in the `ipam` crate and never reach
//! this level; everything here stops the operator.

use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the IPAM Operator.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metric registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Metrics/probes HTTP server failed
    #[error("HTTP server error: {0}")]
    Server(String),
}
