//! Declarative resource store capability.
//!
//! Updates use optimistic concurrency: callers pass the version they last
//! observed (`orig`) and the desired object (`node`). A stale base version
//! yields [`StoreError::Conflict`] and the caller re-fetches with `get`.

use crate::error::StoreError;
use crds::IPAMNode;

/// Get/update access to `IPAMNode` resources
#[async_trait::async_trait]
pub trait NodeStore: Send + Sync {
    /// Fetch the latest version of the resource
    async fn get(&self, name: &str) -> Result<IPAMNode, StoreError>;

    /// Write the spec of `node`. Returns `Ok(None)` when the spec is
    /// unchanged relative to `orig` and nothing was written.
    async fn update(&self, orig: &IPAMNode, node: &IPAMNode) -> Result<Option<IPAMNode>, StoreError>;

    /// Write the status of `node`. Returns `Ok(None)` when the status is
    /// unchanged relative to `orig` and nothing was written.
    async fn update_status(&self, orig: &IPAMNode, node: &IPAMNode) -> Result<Option<IPAMNode>, StoreError>;
}
