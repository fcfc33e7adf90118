//! Bridge CNI plugin and per-node route daemon for Kubernetes
//!
//! `brcni` is the plugin binary called by the container runtime:
//! - Allocates a pod address from the node's subnet
//! - Creates the node bridge on first use
//! - Plumbs a veth pair between the container and the bridge
//!
//! `brcnid` runs once per node. It publishes the node's pod subnet, sets up
//! the bridge and keeps a route to every other node's pod subnet.

pub mod bridge;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod firewall;
pub mod ipam;
pub mod netns;
pub mod plugin;
pub mod queue;
pub mod route;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_check, cmd_del, run_cni};
pub use config::{CniConf, NetConf, SubnetConf};
pub use error::{CniError, Result};
pub use ipam::IpAllocator;
pub use plugin::BridgePlugin;
pub use store::AllocationStore;
