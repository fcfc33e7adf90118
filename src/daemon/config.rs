use std::path::PathBuf;

use clap::Parser;
use ipnetwork::Ipv4Network;

use crate::config::{DEFAULT_BRIDGE_NAME, DEFAULT_MTU, DEFAULT_SUBNET_FILE};
use crate::error::{CniError, Result};

/// Keeps this node's routes to every other node's pod subnet up to date
#[derive(Debug, Clone, Parser)]
#[command(name = "brcnid", author, version, about)]
pub struct DaemonConfig {
    /// Cluster-wide pod CIDR
    #[arg(long)]
    pub cluster_cidr: String,

    /// Name of this node
    #[arg(long = "node", env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Add iptables forward and masquerade rules
    #[arg(long)]
    pub enable_iptables: bool,

    /// Where to publish this node's subnet for the CNI plugin
    #[arg(long, default_value = DEFAULT_SUBNET_FILE)]
    pub subnet_file: PathBuf,

    /// Bridge to create for local pods
    #[arg(long, default_value = DEFAULT_BRIDGE_NAME)]
    pub bridge: String,

    /// MTU of the bridge
    #[arg(long, default_value_t = DEFAULT_MTU)]
    pub mtu: u32,
}

impl DaemonConfig {
    pub fn cluster_network(&self) -> Result<Ipv4Network> {
        self.cluster_cidr.parse().map_err(|e| {
            CniError::config(format!("cluster-cidr {:?} is invalid: {}", self.cluster_cidr, e))
        })
    }

    pub fn node_name(&self) -> Result<&str> {
        match self.node_name.as_deref() {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(CniError::config("node name is empty, set --node or NODE_NAME")),
        }
    }

    /// Fail early on flags that cannot work.
    pub fn validate(&self) -> Result<()> {
        self.cluster_network()?;
        self.node_name()?;
        if self.bridge.is_empty() || self.bridge.len() > 15 {
            return Err(CniError::config("bridge name must be 1 to 15 characters"));
        }
        Ok(())
    }
}
