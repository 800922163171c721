//! Operator configuration.
//!
//! Read from environment variables, the only required one is `IPAM_CIDR`.

use crate::error::ControllerError;
use ipam::{CidrProviderConfig, IpamConfig};
use ipnet::Ipv4Net;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MAX_INTERFACES: usize = 4;
const DEFAULT_IPS_PER_INTERFACE: usize = 16;
const DEFAULT_RELEASE_DELAY_SECONDS: u64 = 180;
const DEFAULT_RESYNC_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Operator settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Cluster CIDR node addresses are allocated from
    pub cidr: Ipv4Net,
    /// Interfaces per node
    pub max_interfaces: usize,
    /// Addresses per interface
    pub ips_per_interface: usize,
    /// Release addresses above the retention watermark
    pub release_excess_ips: bool,
    /// How long an address must stay excess before it is offered for release
    pub excess_ip_release_delay: Duration,
    /// Interval of the provider resync
    pub resync_interval: Duration,
    /// Listen address of the metrics/probes server
    pub metrics_addr: SocketAddr,
}

impl OperatorConfig {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration from `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let cidr = lookup("IPAM_CIDR").ok_or_else(|| {
            ControllerError::InvalidConfig("IPAM_CIDR environment variable is required".to_string())
        })?;
        let cidr = parse("IPAM_CIDR", &cidr)?;

        let max_interfaces = optional(&lookup, "IPAM_MAX_INTERFACES", DEFAULT_MAX_INTERFACES)?;
        let ips_per_interface = optional(&lookup, "IPAM_IPS_PER_INTERFACE", DEFAULT_IPS_PER_INTERFACE)?;
        if max_interfaces == 0 || ips_per_interface == 0 {
            return Err(ControllerError::InvalidConfig(
                "IPAM_MAX_INTERFACES and IPAM_IPS_PER_INTERFACE must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            cidr,
            max_interfaces,
            ips_per_interface,
            release_excess_ips: optional(&lookup, "IPAM_RELEASE_EXCESS_IPS", false)?,
            excess_ip_release_delay: Duration::from_secs(optional(
                &lookup,
                "IPAM_EXCESS_IP_RELEASE_DELAY_SECONDS",
                DEFAULT_RELEASE_DELAY_SECONDS,
            )?),
            resync_interval: Duration::from_secs(optional(
                &lookup,
                "IPAM_RESYNC_INTERVAL_SECONDS",
                DEFAULT_RESYNC_INTERVAL_SECONDS,
            )?),
            metrics_addr: match lookup("METRICS_ADDR") {
                Some(value) => parse("METRICS_ADDR", &value)?,
                None => parse("METRICS_ADDR", DEFAULT_METRICS_ADDR)?,
            },
        })
    }

    /// Engine policy derived from this configuration
    pub fn ipam_config(&self) -> IpamConfig {
        IpamConfig {
            release_excess_ips: self.release_excess_ips,
            excess_ip_release_delay: self.excess_ip_release_delay,
            ..IpamConfig::default()
        }
    }

    /// Sizing of the CIDR provider
    pub fn provider_config(&self) -> CidrProviderConfig {
        CidrProviderConfig {
            cidr: self.cidr,
            max_interfaces: self.max_interfaces,
            ips_per_interface: self.ips_per_interface,
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ControllerError::InvalidConfig(format!("{key}={value}: {e}")))
}

fn optional<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) => parse(key, &value),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::from_lookup(lookup(&[("IPAM_CIDR", "10.128.0.0/16")])).unwrap();

        assert_eq!(config.cidr, "10.128.0.0/16".parse::<Ipv4Net>().unwrap());
        assert_eq!(config.max_interfaces, 4);
        assert_eq!(config.ips_per_interface, 16);
        assert!(!config.release_excess_ips);
        assert_eq!(config.excess_ip_release_delay, Duration::from_secs(180));
        assert_eq!(config.resync_interval, Duration::from_secs(60));
        assert_eq!(config.metrics_addr, "0.0.0.0:9090".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_missing_cidr_is_invalid() {
        let err = OperatorConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(msg) if msg.contains("IPAM_CIDR")));
    }

    #[test]
    fn test_overrides_flow_into_engine_config() {
        let config = OperatorConfig::from_lookup(lookup(&[
            ("IPAM_CIDR", "192.168.0.0/20"),
            ("IPAM_MAX_INTERFACES", "2"),
            ("IPAM_IPS_PER_INTERFACE", "8"),
            ("IPAM_RELEASE_EXCESS_IPS", "true"),
            ("IPAM_EXCESS_IP_RELEASE_DELAY_SECONDS", "30"),
            ("METRICS_ADDR", "127.0.0.1:8080"),
        ]))
        .unwrap();

        let ipam = config.ipam_config();
        assert!(ipam.release_excess_ips);
        assert_eq!(ipam.excess_ip_release_delay, Duration::from_secs(30));
        assert_eq!(ipam.default_pre_allocate, IpamConfig::default().default_pre_allocate);

        let provider = config.provider_config();
        assert_eq!(provider.max_interfaces, 2);
        assert_eq!(provider.ips_per_interface, 8);
    }

    #[test]
    fn test_malformed_values_are_invalid() {
        for (key, value) in [
            ("IPAM_CIDR", "10.0.0.0/33"),
            ("IPAM_MAX_INTERFACES", "many"),
            ("IPAM_RELEASE_EXCESS_IPS", "yes"),
            ("IPAM_IPS_PER_INTERFACE", "0"),
        ] {
            let mut vars = vec![("IPAM_CIDR", "10.0.0.0/24")];
            vars.retain(|(k, _)| *k != key);
            vars.push((key, value));
            let err = OperatorConfig::from_lookup(lookup(&vars)).unwrap_err();
            assert!(matches!(err, ControllerError::InvalidConfig(_)), "{key}={value}");
        }
    }
}
