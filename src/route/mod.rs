//! Host routes to peer pod subnets.

use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{CniError, Result};

#[cfg(test)]
pub(crate) mod fake;

/// A route to a peer node's pod subnet through that node's host IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRoute {
    pub dst: Ipv4Network,
    pub gateway: Ipv4Addr,
    pub link: String,
}

impl NodeRoute {
    /// Cache key: the destination in CIDR form.
    pub fn key(&self) -> String {
        self.dst.to_string()
    }
}

impl fmt::Display for NodeRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {} dev {}", self.dst, self.gateway, self.link)
    }
}

/// Kernel routing table operations the reconciler needs.
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Gateway routes installed on `link`.
    async fn list(&self, link: &str) -> Result<Vec<NodeRoute>>;

    async fn add(&self, route: &NodeRoute) -> Result<()>;

    async fn replace(&self, route: &NodeRoute) -> Result<()>;

    async fn delete(&self, route: &NodeRoute) -> Result<()>;
}

/// [`RouteTable`] backed by `ip route`.
#[derive(Debug, Clone)]
pub struct IpRouteTable {
    binary: String,
}

impl Default for IpRouteTable {
    fn default() -> Self {
        Self { binary: "ip".to_string() }
    }
}

impl IpRouteTable {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    async fn ip_route(&self, args: &[&str]) -> Result<String> {
        let op = format!("{} {}", self.binary, args.join(" "));
        debug!("{}", op);
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| CniError::kernel(&op, e.to_string()))?;

        if !output.status.success() {
            return Err(CniError::kernel(op, String::from_utf8_lossy(&output.stderr).trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Debug, Deserialize)]
struct RouteEntry {
    dst: String,
    #[serde(default)]
    gateway: Option<String>,
}

#[async_trait]
impl RouteTable for IpRouteTable {
    async fn list(&self, link: &str) -> Result<Vec<NodeRoute>> {
        let stdout = self.ip_route(&["-j", "-4", "route", "show", "dev", link]).await?;
        parse_routes(&stdout, link)
    }

    async fn add(&self, route: &NodeRoute) -> Result<()> {
        let (dst, gw) = (route.dst.to_string(), route.gateway.to_string());
        match self.ip_route(&["route", "add", &dst, "via", &gw, "dev", &route.link]).await {
            Ok(_) => Ok(()),
            // Someone else holds the destination; take it over.
            Err(CniError::KernelOp { reason, .. }) if reason.contains("File exists") => {
                debug!("route to {} exists, replacing", dst);
                self.replace(route).await
            }
            Err(e) => Err(e),
        }
    }

    async fn replace(&self, route: &NodeRoute) -> Result<()> {
        let (dst, gw) = (route.dst.to_string(), route.gateway.to_string());
        self.ip_route(&["route", "replace", &dst, "via", &gw, "dev", &route.link]).await.map(|_| ())
    }

    async fn delete(&self, route: &NodeRoute) -> Result<()> {
        let (dst, gw) = (route.dst.to_string(), route.gateway.to_string());
        match self.ip_route(&["route", "del", &dst, "via", &gw, "dev", &route.link]).await {
            Ok(_) => Ok(()),
            Err(CniError::KernelOp { reason, .. }) if reason.contains("No such process") => {
                info!("route {} already removed", route);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Parse `ip -j route show dev <link>` output into gateway routes.
///
/// `ip` omits the device when filtering by it, so `link` is filled in.
/// Default routes and routes without a gateway are skipped.
pub(crate) fn parse_routes(json: &str, link: &str) -> Result<Vec<NodeRoute>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<RouteEntry> = serde_json::from_str(json)
        .map_err(|e| CniError::kernel("parse ip route output", e.to_string()))?;

    Ok(entries
        .into_iter()
        .filter_map(|entry| {
            let gateway = entry.gateway?.parse().ok()?;
            let dst = if entry.dst.contains('/') {
                entry.dst.parse().ok()?
            } else {
                Ipv4Network::new(entry.dst.parse().ok()?, 32).ok()?
            };
            Some(NodeRoute { dst, gateway, link: link.to_string() })
        })
        .collect())
}
