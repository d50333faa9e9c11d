//! Runtime configuration.
//!
//! Everything is built once at startup and handed to the engines; there is
//! no process-global state.

use std::collections::BTreeMap;
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::Result;

/// Environment variable names
pub mod env_vars {
    pub const UDP_BIND: &str = "SCADA_IDS_UDP_BIND";
    pub const API_BIND: &str = "SCADA_IDS_API_BIND";
    pub const BASELINE: &str = "SCADA_IDS_BASELINE";
    pub const MODELS: &str = "SCADA_IDS_MODELS";
    pub const PACKET_MODEL: &str = "SCADA_IDS_PACKET_MODEL";
    pub const INVENTORY: &str = "SCADA_IDS_INVENTORY";
    pub const AGGREGATE_OUT: &str = "SCADA_IDS_AGGREGATE_OUT";
    pub const PACKET_OUT: &str = "SCADA_IDS_PACKET_OUT";
    pub const BATCH_SIZE: &str = "SCADA_IDS_BATCH_SIZE";
    pub const QUEUE_WARN: &str = "SCADA_IDS_QUEUE_WARN";
    pub const QUEUE_LIMIT: &str = "SCADA_IDS_QUEUE_LIMIT";
    pub const LOG_LEVEL: &str = "SCADA_IDS_LOG_LEVEL";
}

/// Role of a machine on the control network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostRole {
    /// SCADA master replica
    Master,
    /// HMI or proxy
    Client,
    /// PLCs, relays and other field devices
    Device,
}

/// One known machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub ip: String,
    pub mac: String,
    pub role: HostRole,
}

impl Host {
    pub fn new(ip: &str, mac: &str, role: HostRole) -> Self {
        Self {
            ip: ip.to_string(),
            mac: mac.to_string(),
            role,
        }
    }
}

/// Machines and ports that are expected on the network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInventory {
    pub hosts: Vec<Host>,

    /// UDP ports allowed to carry traffic
    #[serde(default)]
    pub authorized_ports: Vec<u16>,
}

impl HostInventory {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn known_ips(&self) -> impl Iterator<Item = &str> + '_ {
        self.hosts.iter().map(|h| h.ip.as_str())
    }

    pub fn known_macs(&self) -> impl Iterator<Item = &str> + '_ {
        self.hosts.iter().map(|h| h.mac.as_str())
    }

    pub fn ips_with_role(&self, role: HostRole) -> impl Iterator<Item = String> + '_ {
        self.hosts
            .iter()
            .filter(move |h| h.role == role)
            .map(|h| h.ip.clone())
    }

    pub fn macs_with_role(&self, role: HostRole) -> impl Iterator<Item = String> + '_ {
        self.hosts
            .iter()
            .filter(move |h| h.role == role)
            .map(|h| h.mac.clone())
    }

    /// IP address -> MAC of the machine that owns it
    pub fn owners(&self) -> BTreeMap<String, String> {
        self.hosts
            .iter()
            .map(|h| (h.ip.clone(), h.mac.clone()))
            .collect()
    }
}

/// Where an engine writes its text reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportTarget {
    Stdout,
    File(PathBuf),
}

impl ReportTarget {
    fn parse(value: &str) -> Self {
        if value == "-" {
            ReportTarget::Stdout
        } else {
            ReportTarget::File(PathBuf::from(value))
        }
    }
}

/// Detector configuration
#[derive(Debug, Clone)]
pub struct IdsConfig {
    /// Listener for parsed-packet datagrams
    pub udp_bind: String,

    /// Health / stats / metrics API
    pub api_bind: String,

    /// Baseline artifact (interval, vocabulary, training matrices)
    pub baseline_path: PathBuf,

    /// Ensemble model artifacts for window scoring
    pub model_paths: Vec<PathBuf>,

    /// Single model for per-packet scoring
    pub packet_model_path: PathBuf,

    pub inventory_path: PathBuf,

    pub aggregate_out: ReportTarget,
    pub packet_out: ReportTarget,

    /// Per-packet batch threshold
    pub batch_size: usize,

    /// Queue depth that triggers a backlog warning
    pub queue_warn_depth: usize,

    /// Hard queue capacity per engine
    pub queue_limit: usize,

    pub log_level: String,
}

impl Default for IdsConfig {
    fn default() -> Self {
        Self {
            udp_bind: defaults::UDP_BIND_ADDR.to_string(),
            api_bind: defaults::API_BIND_ADDR.to_string(),
            baseline_path: PathBuf::from(defaults::BASELINE_PATH),
            model_paths: vec![PathBuf::from(defaults::MODEL_PATH)],
            packet_model_path: PathBuf::from(defaults::PACKET_MODEL_PATH),
            inventory_path: PathBuf::from(defaults::INVENTORY_PATH),
            aggregate_out: ReportTarget::File(PathBuf::from(defaults::AGGREGATE_OUT)),
            packet_out: ReportTarget::File(PathBuf::from(defaults::PACKET_OUT)),
            batch_size: defaults::BATCH_SIZE,
            queue_warn_depth: defaults::QUEUE_WARN_DEPTH,
            queue_limit: defaults::QUEUE_LIMIT,
            log_level: "info".to_string(),
        }
    }
}

impl IdsConfig {
    /// Load configuration from environment, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup (environment, test tables)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let base = Self::default();
        let parsed = |key: &str, default: usize| {
            lookup(key)
                .and_then(|s| s.parse().ok())
                .filter(|v: &usize| *v > 0)
                .unwrap_or(default)
        };

        let model_paths = lookup(env_vars::MODELS)
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or(base.model_paths);

        Self {
            udp_bind: lookup(env_vars::UDP_BIND).unwrap_or(base.udp_bind),
            api_bind: lookup(env_vars::API_BIND).unwrap_or(base.api_bind),
            baseline_path: lookup(env_vars::BASELINE)
                .map(PathBuf::from)
                .unwrap_or(base.baseline_path),
            model_paths,
            packet_model_path: lookup(env_vars::PACKET_MODEL)
                .map(PathBuf::from)
                .unwrap_or(base.packet_model_path),
            inventory_path: lookup(env_vars::INVENTORY)
                .map(PathBuf::from)
                .unwrap_or(base.inventory_path),
            aggregate_out: lookup(env_vars::AGGREGATE_OUT)
                .map(|s| ReportTarget::parse(&s))
                .unwrap_or(base.aggregate_out),
            packet_out: lookup(env_vars::PACKET_OUT)
                .map(|s| ReportTarget::parse(&s))
                .unwrap_or(base.packet_out),
            batch_size: parsed(env_vars::BATCH_SIZE, base.batch_size),
            queue_warn_depth: parsed(env_vars::QUEUE_WARN, base.queue_warn_depth),
            queue_limit: parsed(env_vars::QUEUE_LIMIT, base.queue_limit),
            log_level: lookup(env_vars::LOG_LEVEL).unwrap_or(base.log_level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = IdsConfig::from_lookup(|_| None);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.queue_warn_depth, 1000);
        assert_eq!(config.model_paths.len(), 1);
        assert_eq!(config.udp_bind, defaults::UDP_BIND_ADDR);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            (env_vars::MODELS, "lof.json, svm.json,cov.json"),
            (env_vars::BATCH_SIZE, "250"),
            (env_vars::QUEUE_WARN, "not-a-number"),
            (env_vars::AGGREGATE_OUT, "-"),
        ]
        .into_iter()
        .collect();

        let config = IdsConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(
            config.model_paths,
            vec![
                PathBuf::from("lof.json"),
                PathBuf::from("svm.json"),
                PathBuf::from("cov.json")
            ]
        );
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.queue_warn_depth, defaults::QUEUE_WARN_DEPTH);
        assert_eq!(config.aggregate_out, ReportTarget::Stdout);
    }

    #[test]
    fn test_inventory_roles() {
        let json = r#"{
            "hosts": [
                {"ip": "192.168.101.101", "mac": "00:00:00:00:00:01", "role": "master"},
                {"ip": "192.168.101.107", "mac": "00:00:00:00:00:07", "role": "client"},
                {"ip": "192.168.101.109", "mac": "00:00:00:00:00:09", "role": "device"}
            ],
            "authorized_ports": [8120, 53]
        }"#;
        let inventory: HostInventory = serde_json::from_str(json).unwrap();

        assert_eq!(inventory.known_ips().count(), 3);
        assert_eq!(
            inventory.ips_with_role(HostRole::Client).collect::<Vec<_>>(),
            vec!["192.168.101.107".to_string()]
        );
        assert_eq!(
            inventory.owners().get("192.168.101.109").map(String::as_str),
            Some("00:00:00:00:00:09")
        );
    }
}
