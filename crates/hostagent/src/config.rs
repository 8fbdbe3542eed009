//! Agent configuration.
//!
//! Loaded from a YAML file; every field has a default, so an empty file or
//! no file at all gives a working agent. Durations are in milliseconds.

use crate::l2::L2ProgrammerConfig;
use crate::l3::L3ProgrammerConfig;
use crate::on_demand::OnDemandConfig;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Tunnel endpoint address of this host. Neighbors on this address are
    /// delivered locally instead of through the tunnel.
    pub host_ip: Option<Ipv4Addr>,
    pub worker_threads: usize,
    pub pending_max: usize,
    pub pending_expiration_ms: u64,
    pub sweep_interval_ms: u64,
    pub arp_poll_budget_ms: u64,
    pub arp_poll_interval_ms: u64,
    pub port_tag_retry_max: u32,
    pub port_tag_retry_interval_ms: u64,
    pub enable_on_demand: bool,
    /// Record switch commands instead of executing them
    pub dry_run: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let on_demand = OnDemandConfig::default();
        let l2 = L2ProgrammerConfig::default();
        Self {
            host_ip: None,
            worker_threads: 4,
            pending_max: on_demand.pending_max,
            pending_expiration_ms: millis(on_demand.expiration),
            sweep_interval_ms: millis(on_demand.sweep_interval),
            arp_poll_budget_ms: millis(on_demand.arp_poll_budget),
            arp_poll_interval_ms: millis(on_demand.arp_poll_interval),
            port_tag_retry_max: l2.port_tag_retry_max,
            port_tag_retry_interval_ms: millis(l2.port_tag_retry_interval),
            enable_on_demand: true,
            dry_run: false,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl AgentConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        // serde_yaml rejects an empty document
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("worker_threads", self.worker_threads as u64),
            ("pending_max", self.pending_max as u64),
            ("pending_expiration_ms", self.pending_expiration_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("arp_poll_interval_ms", self.arp_poll_interval_ms),
            ("port_tag_retry_interval_ms", self.port_tag_retry_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn l2_config(&self) -> L2ProgrammerConfig {
        L2ProgrammerConfig {
            port_tag_retry_max: self.port_tag_retry_max,
            port_tag_retry_interval: Duration::from_millis(self.port_tag_retry_interval_ms),
        }
    }

    pub fn l3_config(&self) -> L3ProgrammerConfig {
        L3ProgrammerConfig {
            local_host_ip: self.host_ip,
        }
    }

    pub fn on_demand_config(&self) -> OnDemandConfig {
        OnDemandConfig {
            pending_max: self.pending_max,
            expiration: Duration::from_millis(self.pending_expiration_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            arp_poll_budget: Duration::from_millis(self.arp_poll_budget_ms),
            arp_poll_interval: Duration::from_millis(self.arp_poll_interval_ms),
            ..OnDemandConfig::default()
        }
    }
}
