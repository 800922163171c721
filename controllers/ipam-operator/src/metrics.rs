//! Prometheus metrics.
//!
//! Implements the engine's `MetricsApi` on top of a dedicated registry that
//! the `/metrics` endpoint renders in the text exposition format.

use ipam::{MetricsApi, Statistics};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// `MetricsApi` recording into a Prometheus registry
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    allocation_ops: IntCounterVec,
    release_ops: IntCounterVec,
    allocation_duration: HistogramVec,
    release_duration: HistogramVec,
    ips_allocated: IntCounterVec,
    ips_released: IntCounterVec,
    interface_creations: IntCounterVec,
    node_ips: IntGaugeVec,
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

impl PrometheusMetrics {
    /// Creates and registers all IPAM metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let op_labels = &["type", "status", "pool"];

        let allocation_ops = IntCounterVec::new(
            Opts::new("ipam_allocation_ops_total", "Number of IP allocation operations"),
            op_labels,
        )?;
        let release_ops = IntCounterVec::new(
            Opts::new("ipam_release_ops_total", "Number of IP release operations"),
            op_labels,
        )?;
        let allocation_duration = HistogramVec::new(
            HistogramOpts::new("ipam_allocation_duration_seconds", "Duration of IP allocation operations"),
            op_labels,
        )?;
        let release_duration = HistogramVec::new(
            HistogramOpts::new("ipam_release_duration_seconds", "Duration of IP release operations"),
            op_labels,
        )?;
        let ips_allocated = IntCounterVec::new(
            Opts::new("ipam_ips_allocated_total", "Number of IPs allocated"),
            &["pool"],
        )?;
        let ips_released = IntCounterVec::new(
            Opts::new("ipam_ips_released_total", "Number of IPs released"),
            &["pool"],
        )?;
        let interface_creations = IntCounterVec::new(
            Opts::new("ipam_interface_creation_ops_total", "Number of interfaces created"),
            &["pool"],
        )?;
        let node_ips = IntGaugeVec::new(
            Opts::new("ipam_node_ips", "IP statistics per node"),
            &["node", "type"],
        )?;

        registry.register(Box::new(allocation_ops.clone()))?;
        registry.register(Box::new(release_ops.clone()))?;
        registry.register(Box::new(allocation_duration.clone()))?;
        registry.register(Box::new(release_duration.clone()))?;
        registry.register(Box::new(ips_allocated.clone()))?;
        registry.register(Box::new(ips_released.clone()))?;
        registry.register(Box::new(interface_creations.clone()))?;
        registry.register(Box::new(node_ips.clone()))?;

        Ok(Self {
            registry,
            allocation_ops,
            release_ops,
            allocation_duration,
            release_duration,
            ips_allocated,
            ips_released,
            interface_creations,
            node_ips,
        })
    }

    /// Renders every registered metric in the text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

/// `type` label values of the per-node gauge
const NODE_IP_TYPES: [&str; 5] = ["used", "available", "needed", "excess", "capacity"];

fn gauge_value(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn counter_value(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

impl MetricsApi for PrometheusMetrics {
    fn allocation_attempt(&self, typ: &str, status: &str, pool: &str, duration: Duration) {
        let labels = [typ, status, pool];
        self.allocation_ops.with_label_values(&labels).inc();
        self.allocation_duration
            .with_label_values(&labels)
            .observe(duration.as_secs_f64());
    }

    fn release_attempt(&self, typ: &str, status: &str, pool: &str, duration: Duration) {
        let labels = [typ, status, pool];
        self.release_ops.with_label_values(&labels).inc();
        self.release_duration
            .with_label_values(&labels)
            .observe(duration.as_secs_f64());
    }

    fn add_ip_allocation(&self, pool: &str, count: usize) {
        self.ips_allocated.with_label_values(&[pool]).inc_by(counter_value(count));
    }

    fn add_ip_release(&self, pool: &str, count: usize) {
        self.ips_released.with_label_values(&[pool]).inc_by(counter_value(count));
    }

    fn inc_interface_allocation(&self, pool: &str) {
        self.interface_creations.with_label_values(&[pool]).inc();
    }

    fn update_node_stats(&self, node: &str, stats: &Statistics) {
        let ipv4 = &stats.ipv4;
        let values = [
            ipv4.used_ips,
            ipv4.available_ips,
            ipv4.needed_ips,
            ipv4.excess_ips,
            ipv4.capacity,
        ];
        for (typ, value) in NODE_IP_TYPES.into_iter().zip(values) {
            self.node_ips.with_label_values(&[node, typ]).set(gauge_value(value));
        }
    }

    fn remove_node(&self, node: &str) {
        for typ in NODE_IP_TYPES {
            // Absent when the node never reached a resync
            let _ = self.node_ips.remove_label_values(&[node, typ]);
        }
    }
}
