//! Release handshake.
//!
//! An excess address goes through:
//! excess for `excess_ip_release_delay` -> marked-for-release (published in
//! the status) -> the node agent answers ready-for-release or
//! do-not-release -> released. Addresses that stop being excess at any point
//! are unmarked and their bookkeeping is purged.

use super::{Node, NodeState};
use crate::action::MaintenanceAction;
use crate::error::IpamError;
use crate::metrics;
use crds::{IPAMNode, IPReleaseStatus};
use std::collections::{BTreeMap, HashSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

impl Node {
    /// Drops released entries the agent has already acknowledged by removing
    /// them from the resource status
    pub(crate) fn remove_stale_release_ips(&self) {
        let mut state = self.write();
        let NodeState { resource, ipv4_alloc, .. } = &mut *state;
        ipv4_alloc.ip_release_status.retain(|ip, status| {
            *status != IPReleaseStatus::Released
                || resource.as_ref().and_then(|r| r.release_status(ip)).is_some()
        });
    }

    /// Forgets every release candidate that is not in `excess` and aborts
    /// handshakes the resource shows for addresses that are no longer excess
    pub(crate) fn unmark_no_longer_excess_ips(&self, excess: Option<&HashSet<String>>) {
        let is_excess = |ip: &String| excess.is_some_and(|excess| excess.contains(ip));
        {
            let mut state = self.write();
            let alloc = &mut state.ipv4_alloc;
            let stale: Vec<String> = alloc
                .ips_marked_for_release
                .keys()
                .chain(
                    alloc
                        .ip_release_status
                        .iter()
                        .filter(|(_, status)| **status != IPReleaseStatus::Released)
                        .map(|(ip, _)| ip),
                )
                .filter(|ip| !is_excess(*ip))
                .cloned()
                .collect();
            for ip in stale {
                alloc.ips_marked_for_release.remove(&ip);
                alloc.ip_release_status.remove(&ip);
            }
        }
        self.abort_no_longer_excess_ips(excess);
    }

    /// Handles the resource view of the handshake:
    /// - released addresses that came back into the pool are forgotten
    /// - non-released entries for addresses no longer excess are purged
    fn abort_no_longer_excess_ips(&self, excess: Option<&HashSet<String>>) {
        let mut state = self.write();
        let NodeState { resource, ipv4_alloc, .. } = &mut *state;
        let Some(resource) = resource.as_mut() else {
            return;
        };
        let pool = &resource.spec.ipam.pool;
        let Some(status) = resource.status.as_mut() else {
            return;
        };
        if status.ipam.release_ips.is_empty() {
            return;
        }

        let entries: Vec<(String, IPReleaseStatus)> = status
            .ipam
            .release_ips
            .iter()
            .map(|(ip, status)| (ip.clone(), *status))
            .collect();
        for (ip, release_status) in entries {
            if excess.is_some_and(|excess| excess.contains(&ip)) {
                continue;
            }
            if release_status == IPReleaseStatus::Released {
                // Released address reappeared in the pool
                if pool.contains_key(&ip) {
                    status.ipam.release_ips.remove(&ip);
                    ipv4_alloc.ips_marked_for_release.remove(&ip);
                    ipv4_alloc.ip_release_status.remove(&ip);
                }
                continue;
            }
            let local = ipv4_alloc.ip_release_status.get(&ip).copied();
            if local.is_some_and(|local| local != IPReleaseStatus::Released) {
                ipv4_alloc.ips_marked_for_release.remove(&ip);
                ipv4_alloc.ip_release_status.remove(&ip);
            }
        }
    }

    /// Advances the handshake for the excess addresses in `action` and
    /// releases those the agent agreed to give up.
    ///
    /// Returns whether any address was released.
    pub(super) async fn handle_ip_release(&self, action: &mut MaintenanceAction) -> Result<bool, IpamError> {
        let log = self.logger();
        let excess: HashSet<String> = action
            .release
            .as_ref()
            .map(|release| release.ips_to_release.iter().cloned().collect())
            .unwrap_or_default();
        let delay = self.ctx.config.excess_ip_release_delay;

        let mut ips_to_release = Vec::new();
        {
            let mut state = self.write();
            let NodeState { resource, ipv4_alloc, .. } = &mut *state;
            let now = Instant::now();

            ipv4_alloc
                .ips_marked_for_release
                .retain(|ip, _| excess.contains(ip));
            ipv4_alloc.ip_release_status.retain(|ip, status| {
                *status == IPReleaseStatus::Released || excess.contains(ip)
            });
            for ip in &excess {
                ipv4_alloc.ips_marked_for_release.entry(ip.clone()).or_insert(now);
            }

            let candidates: Vec<(String, Instant)> = ipv4_alloc
                .ips_marked_for_release
                .iter()
                .map(|(ip, ts)| (ip.clone(), *ts))
                .collect();
            for (ip, marked_at) in candidates {
                if marked_at + delay > now {
                    continue;
                }
                let answer = resource.as_ref().and_then(|r| r.release_status(&ip));
                match answer {
                    Some(IPReleaseStatus::ReadyForRelease) => ips_to_release.push(ip),
                    Some(IPReleaseStatus::DoNotRelease) => {
                        debug!(parent: &*log, ip = %ip, "IP is still in use, unmarking");
                        ipv4_alloc.ips_marked_for_release.remove(&ip);
                        ipv4_alloc.ip_release_status.remove(&ip);
                    }
                    // Handshake in progress, wait for the agent
                    Some(_) => {}
                    None => {
                        debug!(parent: &*log, ip = %ip, "Marking IP for release");
                        ipv4_alloc
                            .ip_release_status
                            .insert(ip, IPReleaseStatus::MarkedForRelease);
                    }
                }
            }
        }

        self.abort_no_longer_excess_ips((!excess.is_empty()).then_some(&excess));

        if ips_to_release.is_empty() {
            return Ok(false);
        }
        let Some(release) = action.release.as_mut() else {
            return Ok(false);
        };
        ips_to_release.sort();
        release.ips_to_release = ips_to_release;

        let stats = self.stats();
        info!(
            parent: &*log,
            available = stats.ipv4.available_ips,
            used = stats.ipv4.used_ips,
            excess = stats.ipv4.excess_ips,
            releasing = ?release.ips_to_release,
            selected_interface = %release.interface_id,
            selected_pool_id = %release.pool_id,
            "Releasing excess IPs from node"
        );

        let sink = &self.ctx.metrics;
        if !release.ip_prefixes_to_release.is_empty() {
            let start = Instant::now();
            match self.guarded(self.ops.release_ip_prefixes(release)).await {
                Ok(()) => {
                    sink.release_attempt(metrics::RELEASE_IP_PREFIXES, metrics::SUCCESS, &release.pool_id, start.elapsed());
                    sink.add_ip_release(&release.pool_id, release.ip_prefixes_to_release.len());
                }
                Err(err) => {
                    sink.release_attempt(metrics::RELEASE_IP_PREFIXES, metrics::FAILED, &release.pool_id, start.elapsed());
                    warn!(parent: &*log, error = %err, "Unable to unassign IP prefixes from interface");
                    return Err(err);
                }
            }
        }

        let start = Instant::now();
        match self.guarded(self.ops.release_ips(release)).await {
            Ok(()) => {
                sink.release_attempt(metrics::RELEASE_IP, metrics::SUCCESS, &release.pool_id, start.elapsed());
                sink.add_ip_release(&release.pool_id, release.ips_to_release.len());
                let mut state = self.write();
                for ip in &release.ips_to_release {
                    state.ipv4_alloc.ips_marked_for_release.remove(ip);
                    state
                        .ipv4_alloc
                        .ip_release_status
                        .insert(ip.clone(), IPReleaseStatus::Released);
                }
                Ok(true)
            }
            Err(err) => {
                sink.release_attempt(metrics::RELEASE_IP, metrics::FAILED, &release.pool_id, start.elapsed());
                warn!(parent: &*log, error = %err, "Unable to unassign IPs from interface");
                Err(err)
            }
        }
    }

    /// Writes the local handshake view into `node`'s status.
    ///
    /// An agent answer (ready-for-release or do-not-release) is kept over a
    /// local marked-for-release.
    pub fn populate_ip_release_status(&self, node: &mut IPAMNode) {
        self.remove_stale_release_ips();

        let existing = node
            .ipam_status()
            .map(|status| status.release_ips.clone())
            .unwrap_or_default();
        let mut release_ips = BTreeMap::new();
        {
            let state = self.read();
            for (ip, local) in &state.ipv4_alloc.ip_release_status {
                let answered = existing.get(ip).copied().filter(|answer| {
                    matches!(answer, IPReleaseStatus::ReadyForRelease | IPReleaseStatus::DoNotRelease)
                });
                let status = match answered {
                    Some(answer) if *local == IPReleaseStatus::MarkedForRelease => answer,
                    _ => *local,
                };
                release_ips.insert(ip.clone(), status);
            }
        }
        node.ipam_status_mut().release_ips = release_ips;
    }

    /// Addresses currently in the release handshake with their local status
    pub fn release_handshake(&self) -> BTreeMap<String, IPReleaseStatus> {
        self.read()
            .ipv4_alloc
            .ip_release_status
            .iter()
            .map(|(ip, status)| (ip.clone(), *status))
            .collect()
    }
}
