//! Converges host routes to the pod subnets of every other node.

use std::collections::BTreeMap;

use ipnetwork::Ipv4Network;
use itertools::Itertools;
use tracing::{debug, info, instrument, warn};

use crate::cluster::NodeInfo;
use crate::error::{CniError, Result};
use crate::route::{NodeRoute, RouteTable};

/// What one pass changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

/// Route reconciler for one node.
///
/// `cache` mirrors what this reconciler last saw succeed in the kernel,
/// keyed by destination CIDR. An entry changes only after the matching
/// kernel call returned, so a pass that fails halfway leaves an accurate
/// cache for the next one.
pub struct RouteReconciler<R> {
    node_name: String,
    host_link: String,
    routes: R,
    cache: BTreeMap<String, NodeRoute>,
}

impl<R: RouteTable> RouteReconciler<R> {
    pub fn new(node_name: impl Into<String>, host_link: impl Into<String>, routes: R) -> Self {
        Self {
            node_name: node_name.into(),
            host_link: host_link.into(),
            routes,
            cache: BTreeMap::new(),
        }
    }

    pub fn host_link(&self) -> &str {
        &self.host_link
    }

    pub fn routes(&self) -> &R {
        &self.routes
    }

    /// Routes currently believed to be installed.
    pub fn cached_routes(&self) -> impl Iterator<Item = &NodeRoute> {
        self.cache.values()
    }

    /// Load routes left by a previous run.
    ///
    /// Only routes on the host link into `cluster` count; the local pod
    /// subnet is never a peer route.
    pub async fn seed(&mut self, cluster: Ipv4Network, local: Ipv4Network) -> Result<usize> {
        let installed = self.routes.list(&self.host_link).await?;
        for route in installed {
            if cluster.contains(route.dst.network()) && route.dst.network() != local.network() {
                self.cache.insert(route.key(), route);
            }
        }
        info!("seeded {} routes: {}", self.cache.len(), self.cache.keys().join(", "));
        Ok(self.cache.len())
    }

    /// The routes this node should have for `nodes`.
    pub fn desired_routes(&self, nodes: &[NodeInfo]) -> Result<BTreeMap<String, NodeRoute>> {
        let mut desired = BTreeMap::new();
        for node in nodes {
            if node.name == self.node_name || node.pod_cidr.is_none() {
                continue;
            }
            let dst = node.pod_network()?;
            let Some(gateway) = node.internal_ip else {
                warn!("node {} has no InternalIP, skipping", node.name);
                continue;
            };

            let route = NodeRoute { dst, gateway, link: self.host_link.clone() };
            if let Some(other) = desired.insert(route.key(), route) {
                return Err(CniError::config(format!(
                    "pod CIDR {} is assigned to more than one node (also {})",
                    other.dst, other.gateway
                )));
            }
        }
        Ok(desired)
    }

    /// One reconcile pass over the full node list.
    #[instrument(skip(self, nodes), fields(nodes = nodes.len()))]
    pub async fn reconcile(&mut self, nodes: &[NodeInfo]) -> Result<ReconcileReport> {
        let desired = self.desired_routes(nodes)?;
        debug!("desired routes: {}", desired.values().join(", "));

        let mut report = ReconcileReport::default();
        for (key, route) in &desired {
            match self.cache.get(key) {
                Some(current) if current == route => report.unchanged += 1,
                Some(current) => {
                    info!("replace route: {} (was {})", route, current);
                    self.routes.replace(route).await?;
                    self.cache.insert(key.clone(), route.clone());
                    report.replaced += 1;
                }
                None => {
                    info!("add route: {}", route);
                    self.routes.add(route).await?;
                    self.cache.insert(key.clone(), route.clone());
                    report.added += 1;
                }
            }
        }

        let stale: Vec<String> =
            self.cache.keys().filter(|key| !desired.contains_key(*key)).cloned().collect();
        for key in stale {
            if let Some(route) = self.cache.get(&key).cloned() {
                info!("del route: {}", route);
                self.routes.delete(&route).await?;
                self.cache.remove(&key);
                report.deleted += 1;
            }
        }

        Ok(report)
    }
}
