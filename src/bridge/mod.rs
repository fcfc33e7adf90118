//! Bridge and veth data path.
//!
//! The host side is one bridge per node carrying the gateway address; each
//! container gets a veth pair with one end in its namespace and the other
//! enslaved to the bridge.

mod ip;

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{CniError, Result};
use crate::netns::NetNs;
pub use ip::{ipv4_addrs, link_by_addr, link_by_name, Link};

/// Both ends of a container's veth pair, resolved in their final namespaces.
#[derive(Debug, Clone)]
pub struct VethPair {
    pub host: Link,
    pub container: Link,
}

/// Create the bridge `name` unless it already exists.
///
/// A new bridge gets `mtu`, the `gateway` address and is brought up. An
/// existing device is returned as is.
#[instrument]
pub fn create_bridge(name: &str, mtu: u32, gateway: Ipv4Network) -> Result<Link> {
    if let Some(link) = link_by_name(name)? {
        return Ok(link);
    }

    info!("creating bridge {} with gateway {}", name, gateway);
    let mtu = mtu.to_string();
    let gateway = gateway.to_string();
    ip::run_idempotent(&["link", "add", "name", name, "mtu", &mtu, "type", "bridge"])?;
    ip::run_idempotent(&["addr", "add", &gateway, "dev", name])?;
    ip::run(&["link", "set", "dev", name, "up"])?;

    link_by_name(name)?.ok_or_else(|| CniError::not_found(format!("bridge {}", name)))
}

/// Plumb a veth pair between `netns` and `bridge`.
///
/// The pair is created from inside the container namespace with the host
/// end placed straight into the host namespace. That move gives the host end
/// a new ifindex, so it is looked up again by name before it is attached.
#[instrument(skip(netns, bridge), fields(netns = %netns.path().display(), bridge = %bridge.name))]
pub fn setup_veth(
    netns: &NetNs,
    bridge: &Link,
    mtu: u32,
    if_name: &str,
    pod_ip: Ipv4Network,
    gateway: Ipv4Addr,
) -> Result<VethPair> {
    let host_name = host_veth_name();
    let mtu = mtu.to_string();

    let container = netns.run(|host_ns| {
        let host_ns = host_ns.fd_path();
        let host_ns = host_ns.to_string_lossy();
        ip::run(&[
            "link", "add", if_name, "mtu", &mtu, "type", "veth", "peer", "name", &host_name,
            "mtu", &mtu, "netns", &host_ns,
        ])?;

        let pod_ip = pod_ip.to_string();
        let gateway = gateway.to_string();
        ip::run_idempotent(&["addr", "add", &pod_ip, "dev", if_name])?;
        ip::run(&["link", "set", "dev", if_name, "up"])?;
        ip::run_idempotent(&["route", "add", "default", "via", &gateway, "dev", if_name])?;

        link_by_name(if_name)?
            .ok_or_else(|| CniError::not_found(format!("interface {} in container", if_name)))
    })?;

    let host = link_by_name(&host_name)?
        .ok_or_else(|| CniError::not_found(format!("host veth {}", host_name)))?;
    ip::run(&["link", "set", "dev", &host.name, "up"])?;
    ip::run(&["link", "set", "dev", &host.name, "master", &bridge.name]).map_err(|e| {
        CniError::kernel(format!("attach {} to bridge {}", host.name, bridge.name), e.to_string())
    })?;

    info!("attached {} ({}) to {}", host.name, host.index, bridge.name);
    Ok(VethPair { host, container })
}

/// Remove `if_name` from `netns`. The peer goes with it.
#[instrument(skip(netns), fields(netns = %netns.path().display()))]
pub fn del_veth(netns: &NetNs, if_name: &str) -> Result<()> {
    netns.run(|_| {
        if link_by_name(if_name)?.is_none() {
            warn!("interface {} already gone", if_name);
            return Ok(());
        }
        match ip::run(&["link", "del", "dev", if_name]) {
            Ok(_) => Ok(()),
            // Raced with namespace teardown
            Err(_) if link_by_name(if_name)?.is_none() => Ok(()),
            Err(e) => Err(e),
        }
    })
}

/// Verify `if_name` inside `netns` carries `expected`.
#[instrument(skip(netns), fields(netns = %netns.path().display()))]
pub fn check_veth(netns: &NetNs, if_name: &str, expected: Ipv4Addr) -> Result<()> {
    netns.run(|_| {
        if link_by_name(if_name)?.is_none() {
            return Err(CniError::not_found(format!("interface {}", if_name)));
        }
        if ipv4_addrs(if_name)?.contains(&expected) {
            Ok(())
        } else {
            Err(CniError::not_found(format!("address {} on {}", expected, if_name)))
        }
    })
}

fn host_veth_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("veth{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_veth_names_fit_ifnamsiz() {
        let name = host_veth_name();
        assert!(name.starts_with("veth"));
        assert_eq!(name.len(), 12);
        assert!(name[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(name, host_veth_name());
    }
}
