//! Writes the node view back to the resource store.
//!
//! Status is written before spec: the status carries the release handshake
//! and must never lag the pool published in the spec.

use super::Node;
use crate::error::IpamError;
use crds::IPAMNode;
use kube::ResourceExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateKind {
    Status,
    Spec,
}

impl Node {
    /// Pushes the pool, statistics and release handshake of the node to the
    /// store, retrying each phase on failure
    pub async fn sync_to_api_server(&self) -> Result<(), IpamError> {
        let log = self.logger();
        debug!(parent: &*log, "Refreshing node");

        let Some(mut node) = self.resource_copy() else {
            return Ok(());
        };
        let mut orig = node.clone();

        // Snapshot the pool before the status is populated so the status
        // never claims more than the spec publishes
        let pool = self.pool();
        let attempts = self.ctx.config.max_update_attempts.max(1);

        for attempt in 1..=attempts {
            self.ops.populate_status_fields(&mut node);
            self.populate_ip_release_status(&mut node);
            self.populate_static_ip_status(&mut node);

            match self.update(&mut orig, &mut node, UpdateKind::Status).await {
                Ok(()) => break,
                Err(err) if attempt < attempts && !matches!(err, IpamError::Cancelled) => {
                    info!(parent: &*log, error = %err, attempt, "Failed to update IPAMNode status, retrying");
                }
                Err(err) => {
                    warn!(parent: &*log, error = %err, "Failed to update IPAMNode status");
                    return Err(err);
                }
            }
        }

        for attempt in 1..=attempts {
            node.spec.ipam.pool = pool.clone();
            debug!(parent: &*log, pool_size = node.spec.ipam.pool.len(), "Updating node in apiserver");

            // pre-allocate is seeded once, the resource owns it afterwards
            if node.spec.ipam.pre_allocate == 0 {
                node.spec.ipam.pre_allocate = self.ops.get_minimum_allocatable_ipv4();
            }

            match self.update(&mut orig, &mut node, UpdateKind::Spec).await {
                Ok(()) => break,
                Err(err) if attempt < attempts && !matches!(err, IpamError::Cancelled) => {
                    info!(parent: &*log, error = %err, attempt, "Failed to update IPAMNode spec, retrying");
                }
                Err(err) => {
                    warn!(parent: &*log, error = %err, "Failed to update IPAMNode spec");
                    return Err(err);
                }
            }
        }

        debug!(parent: &*log, "Node refreshed");
        Ok(())
    }

    /// Writes one phase. On failure both `orig` and `node` are reset to the
    /// latest stored version so the next attempt starts from a fresh base.
    async fn update(&self, orig: &mut IPAMNode, node: &mut IPAMNode, kind: UpdateKind) -> Result<(), IpamError> {
        let store = &self.ctx.store;
        let result = match kind {
            UpdateKind::Status => self.guarded(store.update_status(orig, node)).await,
            UpdateKind::Spec => self.guarded(store.update(orig, node)).await,
        };

        match result {
            Ok(Some(updated)) => {
                *node = updated;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(IpamError::Cancelled) => Err(IpamError::Cancelled),
            Err(update_err) => {
                let latest = self.guarded(store.get(&node.name_any())).await?;
                *orig = latest.clone();
                *node = latest;
                Err(update_err)
            }
        }
    }

    fn populate_static_ip_status(&self, node: &mut IPAMNode) {
        let assigned = self.read().stats.ipv4.assigned_static_ip.clone();
        if let Some(ip) = assigned {
            node.ipam_status_mut().assigned_static_ip = Some(ip);
        }
    }
}
